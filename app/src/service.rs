use crate::instance::{Instance, InstanceDetail, InstanceState, RequestOutcome, ServiceError};
use crate::monitoring::MetricsSource;
use crate::rng::SimRng;
use async_trait::async_trait;
use eyre::Result;
use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strum::{Display, EnumString};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::*;

const HEALTH_LOOP_INTERVAL: Duration = Duration::from_secs(10);
const RESTART_DELAY_SECS: (f64, f64) = (5.0, 15.0);
const SCALE_UP_CPU: f64 = 70.0;
const SCALE_DOWN_CPU: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    ApiGateway,
    Auth,
    Database,
    Cache,
    Notification,
    Payment,
    UserProfile,
}

impl ServiceKind {
    /// Band a fresh instance draws its base response time from, in ms.
    pub fn base_latency_band_ms(&self) -> (f64, f64) {
        match self {
            ServiceKind::Database => (100.0, 300.0),
            ServiceKind::Cache => (20.0, 80.0),
            ServiceKind::ApiGateway => (50.0, 150.0),
            _ => (70.0, 200.0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScalingPolicy {
    pub initial_instances: usize,
    pub min_instances: usize,
    pub max_instances: usize,
    pub auto_scaling: bool,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            initial_instances: 3,
            min_instances: 1,
            max_instances: 10,
            auto_scaling: true,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    total_requests: u64,
    successful_requests: u64,
    error_count: u64,
    cumulative_response_ms: f64,
}

/// Aggregate view used by status reports and the monitoring poller.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceMetrics {
    pub service: String,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub target_instances: usize,
    pub availability_percent: f64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub error_count: u64,
    pub error_rate_percent: f64,
    pub avg_response_time_ms: f64,
    pub avg_cpu_percent: f64,
    pub avg_memory_percent: f64,
}

/// One logical microservice: an owned pool of instances plus the background
/// loop that health-checks, auto-restarts and auto-scales them. The service
/// is the sole mutator of pool membership.
pub struct Service {
    name: String,
    kind: ServiceKind,
    region: String,
    policy: ScalingPolicy,
    rng: SimRng,
    instances: RwLock<HashMap<String, Arc<Instance>>>,
    counters: Mutex<Counters>,
    target_instances: AtomicUsize,
    running: AtomicBool,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    restarts: Mutex<Vec<JoinHandle<()>>>,
}

impl Service {
    pub fn new(
        name: impl Into<String>,
        kind: ServiceKind,
        region: impl Into<String>,
        policy: ScalingPolicy,
        rng: SimRng,
    ) -> Self {
        let name = name.into();
        let region = region.into();
        let mut instances = HashMap::new();
        for _ in 0..policy.initial_instances {
            let instance = Arc::new(Instance::new(name.as_str(), kind, region.as_str(), rng.clone()));
            instances.insert(instance.id().to_string(), instance);
        }
        info!(
            "service {name} ({kind}) created with {} instances in {region}",
            policy.initial_instances
        );
        Self {
            name,
            kind,
            region,
            policy,
            rng,
            instances: RwLock::new(instances),
            counters: Mutex::new(Counters::default()),
            target_instances: AtomicUsize::new(policy.initial_instances),
            running: AtomicBool::new(false),
            loop_handle: Mutex::new(None),
            restarts: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn min_instances(&self) -> usize {
        self.policy.min_instances
    }

    pub async fn add_instance(&self) -> String {
        let instance = Arc::new(Instance::new(
            self.name.as_str(),
            self.kind,
            self.region.as_str(),
            self.rng.clone(),
        ));
        let id = instance.id().to_string();
        self.instances.write().await.insert(id.clone(), instance);
        info!("service {} added instance {id}", self.name);
        id
    }

    /// Terminates and evicts; false when the id is unknown.
    pub async fn remove_instance(&self, id: &str) -> bool {
        match self.instances.write().await.remove(id) {
            Some(instance) => {
                instance.terminate();
                info!("service {} removed instance {id}", self.name);
                true
            }
            None => false,
        }
    }

    pub async fn instance(&self, id: &str) -> Option<Arc<Instance>> {
        self.instances.read().await.get(id).cloned()
    }

    pub async fn instances(&self) -> Vec<Arc<Instance>> {
        self.instances.read().await.values().cloned().collect()
    }

    pub async fn instance_count(&self) -> usize {
        self.instances.read().await.len()
    }

    /// Healthy here includes Degraded: those instances still take traffic.
    pub async fn healthy_instances(&self) -> Vec<Arc<Instance>> {
        self.instances
            .read()
            .await
            .values()
            .filter(|i| i.is_healthy())
            .cloned()
            .collect()
    }

    pub async fn healthy_count(&self) -> usize {
        self.healthy_instances().await.len()
    }

    /// Routes one synthetic request to a uniformly random healthy instance
    /// and tallies the outcome either way.
    pub async fn handle_request(&self) -> Result<RequestOutcome, ServiceError> {
        let healthy = self.healthy_instances().await;
        let Some(instance) = self.rng.pick(&healthy).cloned() else {
            self.counters().error_count += 1;
            return Err(ServiceError::NoHealthyInstances(self.name.clone()));
        };
        self.dispatch_to(&instance).await
    }

    /// Delegates to a caller-picked instance (the load balancer chooses, the
    /// service keeps the books).
    pub async fn dispatch_to(&self, instance: &Instance) -> Result<RequestOutcome, ServiceError> {
        let started = Instant::now();
        let result = instance.handle_request().await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut counters = self.counters();
        counters.total_requests += 1;
        counters.cumulative_response_ms += elapsed_ms;
        match &result {
            Ok(_) => counters.successful_requests += 1,
            Err(_) => counters.error_count += 1,
        }
        result
    }

    /// The one place the minimum-instance invariant is enforced: refuses
    /// with None once the healthy count is at the floor.
    pub async fn chaos_terminate_random_instance(&self) -> Option<String> {
        let healthy = self.healthy_instances().await;
        if healthy.len() <= self.policy.min_instances {
            warn!(
                "service {} at minimum capacity ({} healthy), refusing chaos termination",
                self.name,
                healthy.len()
            );
            return None;
        }
        let instance = self.rng.pick(&healthy)?.clone();
        instance.terminate();
        info!("chaos terminated {}/{}", self.name, instance.id());
        Some(instance.id().to_string())
    }

    /// Spawns the health/auto-scale loop. Stop with [`Service::stop`].
    pub async fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let service = self.clone();
        let handle = tokio::spawn(async move {
            debug!("service {} loop started", service.name);
            while service.running.load(Ordering::SeqCst) {
                sleep(HEALTH_LOOP_INTERVAL).await;
                if !service.running.load(Ordering::SeqCst) {
                    break;
                }
                service.run_health_checks().await;
                if service.policy.auto_scaling {
                    service.auto_scale().await;
                }
                service.prune_restarts();
            }
            debug!("service {} loop stopped", service.name);
        });
        *self.loop_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Stops the loop and cancels any pending auto-restarts.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.loop_handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        let mut restarts = self.restarts.lock().unwrap_or_else(|e| e.into_inner());
        for handle in restarts.drain(..) {
            handle.abort();
        }
    }

    /// Stop plus terminate every instance; used at system shutdown.
    pub async fn shutdown(&self) {
        self.stop();
        for instance in self.instances().await {
            instance.terminate();
        }
        info!("service {} shut down", self.name);
    }

    pub async fn service_metrics(&self) -> ServiceMetrics {
        let instances = self.instances().await;
        let healthy: Vec<_> = instances.iter().filter(|i| i.is_healthy()).collect();
        let total = instances.len();
        let availability = if total == 0 {
            0.0
        } else {
            healthy.len() as f64 / total as f64 * 100.0
        };
        let (avg_cpu, avg_mem) = if healthy.is_empty() {
            (0.0, 0.0)
        } else {
            let n = healthy.len() as f64;
            (
                healthy.iter().map(|i| i.cpu_percent()).sum::<f64>() / n,
                healthy.iter().map(|i| i.memory_percent()).sum::<f64>() / n,
            )
        };

        let counters = self.counters();
        let error_rate = if counters.total_requests == 0 {
            0.0
        } else {
            counters.error_count as f64 / counters.total_requests as f64 * 100.0
        };
        let avg_response = if counters.total_requests == 0 {
            0.0
        } else {
            counters.cumulative_response_ms / counters.total_requests as f64
        };

        ServiceMetrics {
            service: self.name.clone(),
            total_instances: total,
            healthy_instances: healthy.len(),
            target_instances: self.target_instances.load(Ordering::SeqCst),
            availability_percent: availability,
            total_requests: counters.total_requests,
            successful_requests: counters.successful_requests,
            error_count: counters.error_count,
            error_rate_percent: error_rate,
            avg_response_time_ms: avg_response,
            avg_cpu_percent: avg_cpu,
            avg_memory_percent: avg_mem,
        }
    }

    pub async fn instance_details(&self) -> Vec<InstanceDetail> {
        self.instances().await.iter().map(|i| i.detail()).collect()
    }

    async fn run_health_checks(self: &Arc<Self>) {
        for instance in self.instances().await {
            let healthy = instance.health_check();
            if !healthy && instance.state() == InstanceState::Terminated {
                self.schedule_restart(instance);
            }
        }
    }

    /// Auto-restart after a randomized delay, on its own task so the health
    /// loop never blocks. The handle is retained so stop() can cancel it.
    fn schedule_restart(self: &Arc<Self>, instance: Arc<Instance>) {
        let (low, high) = RESTART_DELAY_SECS;
        let delay = Duration::from_secs_f64(self.rng.range_f64(low, high));
        let service = self.name.clone();
        let handle = tokio::spawn(async move {
            debug!("auto-restarting {service}/{} in {delay:?}", instance.id());
            sleep(delay).await;
            instance.restart().await;
        });
        self.restarts.lock().unwrap_or_else(|e| e.into_inner()).push(handle);
    }

    /// At most one scaling decision per loop iteration.
    async fn auto_scale(&self) {
        let healthy = self.healthy_instances().await;
        if healthy.is_empty() {
            return;
        }
        let avg_cpu = healthy.iter().map(|i| i.cpu_percent()).sum::<f64>() / healthy.len() as f64;
        let total = self.instance_count().await;

        if avg_cpu > SCALE_UP_CPU && total < self.policy.max_instances {
            self.target_instances.fetch_add(1, Ordering::SeqCst);
            let id = self.add_instance().await;
            info!(
                "service {} scaled up (avg cpu {avg_cpu:.0}%), new instance {id}",
                self.name
            );
        } else if avg_cpu < SCALE_DOWN_CPU && total > self.policy.min_instances {
            let least_loaded = healthy
                .iter()
                .min_by(|a, b| a.cpu_percent().total_cmp(&b.cpu_percent()))
                .map(|i| i.id().to_string());
            if let Some(id) = least_loaded {
                self.target_instances.fetch_sub(1, Ordering::SeqCst);
                self.remove_instance(&id).await;
                info!("service {} scaled down (avg cpu {avg_cpu:.0}%)", self.name);
            }
        }
    }

    fn prune_restarts(&self) {
        self.restarts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|handle| !handle.is_finished());
    }

    fn counters(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl MetricsSource for Service {
    async fn snapshot(&self) -> Result<HashMap<String, f64>> {
        let m = self.service_metrics().await;
        Ok(HashMap::from([
            ("response_time_ms".to_string(), m.avg_response_time_ms),
            ("error_rate".to_string(), m.error_rate_percent),
            ("availability".to_string(), m.availability_percent),
            ("cpu_usage".to_string(), m.avg_cpu_percent),
            ("memory_usage".to_string(), m.avg_memory_percent),
            ("healthy_instances".to_string(), m.healthy_instances as f64),
            ("total_instances".to_string(), m.total_instances as f64),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_service(initial: usize, min: usize) -> Arc<Service> {
        Arc::new(Service::new(
            "api-service",
            ServiceKind::ApiGateway,
            "us-east-1",
            ScalingPolicy {
                initial_instances: initial,
                min_instances: min,
                max_instances: 10,
                auto_scaling: true,
            },
            SimRng::seeded(11),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn chaos_termination_respects_the_minimum() {
        let service = test_service(3, 1);

        assert!(service.chaos_terminate_random_instance().await.is_some());
        assert!(service.chaos_terminate_random_instance().await.is_some());
        assert_eq!(service.healthy_count().await, 1);

        assert!(service.chaos_terminate_random_instance().await.is_none());
        assert_eq!(service.healthy_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn requests_fail_without_healthy_instances() {
        let service = test_service(2, 0);
        for instance in service.instances().await {
            instance.terminate();
        }

        let err = service.handle_request().await.unwrap_err();
        assert!(matches!(err, ServiceError::NoHealthyInstances(_)));
        assert_eq!(service.service_metrics().await.error_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn requests_update_counters() {
        let service = test_service(2, 1);
        for instance in service.instances().await {
            instance.introduce_errors(0.0);
        }

        for _ in 0..5 {
            service.handle_request().await.unwrap();
        }
        let metrics = service.service_metrics().await;
        assert_eq!(metrics.total_requests, 5);
        assert_eq!(metrics.successful_requests, 5);
        assert!(metrics.avg_response_time_ms > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn health_loop_schedules_restart_for_terminated_instances() {
        let service = test_service(2, 1);
        let victim = service.instances().await[0].clone();
        victim.terminate();

        service.run_health_checks().await;
        let handle = {
            let mut restarts = service.restarts.lock().unwrap();
            assert_eq!(restarts.len(), 1);
            restarts.pop().unwrap()
        };
        handle.await.unwrap();
        assert_eq!(victim.state(), InstanceState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn scales_up_under_cpu_pressure() {
        let service = test_service(2, 1);
        for instance in service.instances().await {
            instance.set_cpu_percent(95.0);
        }

        service.auto_scale().await;
        assert_eq!(service.instance_count().await, 3);

        // a second decision in the same shape adds at most one more
        service.auto_scale().await;
        assert!(service.instance_count().await <= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn scales_down_when_idle() {
        let service = test_service(3, 1);
        for instance in service.instances().await {
            instance.set_cpu_percent(10.0);
        }

        service.auto_scale().await;
        assert_eq!(service.instance_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_terminates_everything() {
        let service = test_service(3, 1);
        service.clone().start().await;
        service.shutdown().await;

        assert_eq!(service.healthy_count().await, 0);
        for instance in service.instances().await {
            assert_eq!(instance.state(), InstanceState::Terminated);
        }
    }
}
