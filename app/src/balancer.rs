use crate::instance::{Instance, ServiceError};
use crate::monitoring::MetricsSource;
use crate::rng::SimRng;
use crate::service::Service;
use async_trait::async_trait;
use eyre::Result;
use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strum::{Display, EnumString};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::*;

const RATE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Random,
    RoundRobin,
    LeastConnections,
    HealthBased,
    WeightedRoundRobin,
}

/// Response from [`LoadBalancer::route_request`], the instance outcome plus
/// routing metadata.
#[derive(Debug, Clone, Serialize)]
pub struct RoutedResponse {
    pub service: String,
    pub instance: String,
    pub response_time_ms: f64,
    pub balancer: String,
    pub strategy: Strategy,
    pub balancer_time_ms: f64,
}

/// Derived once per second from counter deltas.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TrafficRates {
    pub requests_per_second: f64,
    pub avg_latency_ms: f64,
    pub error_rate_percent: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct TrafficCounters {
    requests: u64,
    errors: u64,
    cumulative_latency_ms: f64,
}

#[derive(Debug, Default)]
struct RateWindow {
    prev: TrafficCounters,
    rates: TrafficRates,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalancerMetrics {
    pub balancer: String,
    pub strategy: Strategy,
    pub registered_services: usize,
    pub total_requests: u64,
    pub total_errors: u64,
    pub error_rate_percent: f64,
    pub avg_latency_ms: f64,
    pub requests_per_second: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub healthy: usize,
    pub total: usize,
    pub availability_percent: f64,
}

/// Routes synthetic requests across registered services with a pluggable
/// selection strategy. Strategy state (round-robin cursors, last-served
/// stamps) lives here, not in the services.
pub struct LoadBalancer {
    name: String,
    strategy: Strategy,
    rng: SimRng,
    services: RwLock<HashMap<String, Arc<Service>>>,
    cursors: Mutex<HashMap<String, usize>>,
    last_served: Mutex<HashMap<String, Instant>>,
    counters: Mutex<TrafficCounters>,
    window: Mutex<RateWindow>,
    running: AtomicBool,
    metrics_handle: Mutex<Option<JoinHandle<()>>>,
    traffic_handle: Mutex<Option<JoinHandle<()>>>,
}

impl LoadBalancer {
    pub fn new(name: impl Into<String>, strategy: Strategy, rng: SimRng) -> Self {
        Self {
            name: name.into(),
            strategy,
            rng,
            services: RwLock::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
            last_served: Mutex::new(HashMap::new()),
            counters: Mutex::new(TrafficCounters::default()),
            window: Mutex::new(RateWindow::default()),
            running: AtomicBool::new(false),
            metrics_handle: Mutex::new(None),
            traffic_handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub async fn register_service(&self, service: Arc<Service>) {
        let name = service.name().to_string();
        info!("balancer {} registered service {name}", self.name);
        self.services.write().await.insert(name, service);
    }

    pub async fn unregister_service(&self, name: &str) -> bool {
        let removed = self.services.write().await.remove(name).is_some();
        if removed {
            self.lock_cursors().remove(name);
            info!("balancer {} unregistered service {name}", self.name);
        }
        removed
    }

    pub async fn service(&self, name: &str) -> Option<Arc<Service>> {
        self.services.read().await.get(name).cloned()
    }

    pub async fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn services(&self) -> Vec<Arc<Service>> {
        self.services.read().await.values().cloned().collect()
    }

    /// Resolves the service, picks an instance per the configured strategy,
    /// delegates and tags the response with routing metadata.
    pub async fn route_request(&self, service_name: &str) -> Result<RoutedResponse, ServiceError> {
        let started = Instant::now();
        let service = self
            .service(service_name)
            .await
            .ok_or_else(|| ServiceError::UnknownService(service_name.to_string()))?;

        let mut healthy = service.healthy_instances().await;
        if healthy.is_empty() {
            self.record(started, true);
            return Err(ServiceError::NoHealthyInstances(service_name.to_string()));
        }
        healthy.sort_by(|a, b| a.id().cmp(b.id()));

        let instance = self.select(service_name, &healthy);
        self.lock_last_served()
            .insert(instance.id().to_string(), Instant::now());

        let result = service.dispatch_to(&instance).await;
        let balancer_time_ms = self.record(started, result.is_err());
        let outcome = result?;
        Ok(RoutedResponse {
            service: service_name.to_string(),
            instance: outcome.instance,
            response_time_ms: outcome.response_time_ms,
            balancer: self.name.clone(),
            strategy: self.strategy,
            balancer_time_ms,
        })
    }

    /// Once-per-second rate derivation loop.
    pub async fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let balancer = self.clone();
        let handle = tokio::spawn(async move {
            let mut last = Instant::now();
            while balancer.running.load(Ordering::SeqCst) {
                sleep(RATE_WINDOW).await;
                let now = Instant::now();
                balancer.derive_rates((now - last).as_secs_f64());
                last = now;
            }
        });
        *self.metrics_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.metrics_handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        self.stop_traffic();
    }

    /// Background generator firing randomized requests at `rps` against
    /// random registered services, forever when `duration` is None. Each
    /// request runs on its own task so slow instances never stall the rate.
    pub async fn simulate_traffic(self: &Arc<Self>, rps: f64, duration: Option<Duration>) {
        self.stop_traffic();
        let interval = Duration::from_secs_f64(1.0 / rps.max(0.01));
        let balancer = self.clone();
        let handle = tokio::spawn(async move {
            info!("traffic generator started at {rps:.1} rps");
            let deadline = duration.map(|d| Instant::now() + d);
            loop {
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        break;
                    }
                }
                let names = balancer.service_names().await;
                if let Some(name) = balancer.rng.pick(&names).cloned() {
                    let requester = balancer.clone();
                    tokio::spawn(async move {
                        if let Err(e) = requester.route_request(&name).await {
                            trace!("synthetic request failed: {e}");
                        }
                    });
                }
                sleep(interval).await;
            }
            info!("traffic generator finished");
        });
        *self.traffic_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    pub fn stop_traffic(&self) {
        if let Some(handle) = self.traffic_handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }

    /// Terminates every instance of the named service; the service stays
    /// registered so recovery can be observed.
    pub async fn chaos_remove_service(&self, name: &str) -> Result<usize, ServiceError> {
        let service = self
            .service(name)
            .await
            .ok_or_else(|| ServiceError::UnknownService(name.to_string()))?;
        let instances = service.instances().await;
        for instance in &instances {
            instance.terminate();
        }
        warn!("chaos removed service {name} ({} instances)", instances.len());
        Ok(instances.len())
    }

    /// Multiplies the base latency of every instance of the named service.
    pub async fn chaos_degrade_service(&self, name: &str, factor: f64) -> Result<(), ServiceError> {
        let service = self
            .service(name)
            .await
            .ok_or_else(|| ServiceError::UnknownService(name.to_string()))?;
        for instance in service.instances().await {
            let base = instance.base_response_time_ms();
            instance.set_base_response_time(base * factor);
        }
        warn!("chaos degraded service {name} by x{factor}");
        Ok(())
    }

    pub async fn service_availability(&self, name: &str) -> Result<f64, ServiceError> {
        let service = self
            .service(name)
            .await
            .ok_or_else(|| ServiceError::UnknownService(name.to_string()))?;
        Ok(service.service_metrics().await.availability_percent)
    }

    /// Active probe sweep across all registered services.
    pub async fn health_check_all_services(&self) -> HashMap<String, ServiceHealth> {
        let mut report = HashMap::new();
        for service in self.services().await {
            let instances = service.instances().await;
            let healthy = instances.iter().filter(|i| i.health_check()).count();
            let total = instances.len();
            let availability = if total == 0 {
                0.0
            } else {
                healthy as f64 / total as f64 * 100.0
            };
            report.insert(
                service.name().to_string(),
                ServiceHealth {
                    healthy,
                    total,
                    availability_percent: availability,
                },
            );
        }
        report
    }

    pub fn current_rates(&self) -> TrafficRates {
        self.window.lock().unwrap_or_else(|e| e.into_inner()).rates
    }

    pub async fn balancer_metrics(&self) -> BalancerMetrics {
        let registered = self.services.read().await.len();
        let totals = *self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let rates = self.current_rates();
        let error_rate = if totals.requests == 0 {
            0.0
        } else {
            totals.errors as f64 / totals.requests as f64 * 100.0
        };
        let avg_latency = if totals.requests == 0 {
            0.0
        } else {
            totals.cumulative_latency_ms / totals.requests as f64
        };
        BalancerMetrics {
            balancer: self.name.clone(),
            strategy: self.strategy,
            registered_services: registered,
            total_requests: totals.requests,
            total_errors: totals.errors,
            error_rate_percent: error_rate,
            avg_latency_ms: avg_latency,
            requests_per_second: rates.requests_per_second,
        }
    }

    fn select(&self, service: &str, healthy: &[Arc<Instance>]) -> Arc<Instance> {
        match self.strategy {
            Strategy::Random => healthy[self.rng.index(healthy.len())].clone(),
            Strategy::RoundRobin => {
                let mut cursors = self.lock_cursors();
                let cursor = cursors.entry(service.to_string()).or_insert(0);
                let instance = healthy[*cursor % healthy.len()].clone();
                *cursor = cursor.wrapping_add(1);
                instance
            }
            Strategy::LeastConnections => {
                let last_served = self.lock_last_served();
                healthy
                    .iter()
                    .min_by_key(|i| last_served.get(i.id()).copied())
                    .cloned()
                    .unwrap_or_else(|| healthy[0].clone())
            }
            Strategy::HealthBased => healthy
                .iter()
                .max_by(|a, b| Self::health_score(a).total_cmp(&Self::health_score(b)))
                .cloned()
                .unwrap_or_else(|| healthy[0].clone()),
            Strategy::WeightedRoundRobin => self.weighted_pick(healthy),
        }
    }

    /// 100 minus penalties for latency, CPU, memory and past failures, plus
    /// a small bonus for long uptime.
    fn health_score(instance: &Instance) -> f64 {
        let mut score = 100.0;
        let rt = instance.response_time_ms();
        if rt > 500.0 {
            score -= (rt - 500.0) / 10.0;
        }
        let cpu = instance.cpu_percent();
        if cpu > 80.0 {
            score -= (cpu - 80.0) * 2.0;
        }
        let mem = instance.memory_percent();
        if mem > 80.0 {
            score -= (mem - 80.0) * 1.5;
        }
        score -= instance.failure_count() as f64 * 10.0;
        if instance.uptime_seconds() > 3600 {
            score += 10.0;
        }
        score
    }

    /// Weight inversely proportional to the current EMA response time.
    fn weighted_pick(&self, healthy: &[Arc<Instance>]) -> Arc<Instance> {
        let weights: Vec<f64> = healthy
            .iter()
            .map(|i| (1000.0 / i.response_time_ms().max(1.0)).max(1.0))
            .collect();
        let total: f64 = weights.iter().sum();
        let mut draw = self.rng.range_f64(0.0, total);
        for (instance, weight) in healthy.iter().zip(&weights) {
            if draw < *weight {
                return instance.clone();
            }
            draw -= weight;
        }
        healthy[healthy.len() - 1].clone()
    }

    fn record(&self, started: Instant, failed: bool) -> f64 {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.requests += 1;
        counters.cumulative_latency_ms += elapsed_ms;
        if failed {
            counters.errors += 1;
        }
        elapsed_ms
    }

    fn derive_rates(&self, elapsed_secs: f64) {
        if elapsed_secs <= 0.0 {
            return;
        }
        let totals = *self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        let requests = totals.requests - window.prev.requests;
        let errors = totals.errors - window.prev.errors;
        let latency = totals.cumulative_latency_ms - window.prev.cumulative_latency_ms;
        window.rates = TrafficRates {
            requests_per_second: requests as f64 / elapsed_secs,
            avg_latency_ms: if requests == 0 {
                0.0
            } else {
                latency / requests as f64
            },
            error_rate_percent: if requests == 0 {
                0.0
            } else {
                errors as f64 / requests as f64 * 100.0
            },
        };
        window.prev = totals;
    }

    fn lock_cursors(&self) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
        self.cursors.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_last_served(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        self.last_served.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl MetricsSource for LoadBalancer {
    async fn snapshot(&self) -> Result<HashMap<String, f64>> {
        let m = self.balancer_metrics().await;
        Ok(HashMap::from([
            ("requests_per_second".to_string(), m.requests_per_second),
            ("response_time_ms".to_string(), m.avg_latency_ms),
            ("error_rate".to_string(), m.error_rate_percent),
            ("registered_services".to_string(), m.registered_services as f64),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ScalingPolicy, ServiceKind};

    fn test_service(name: &str, instances: usize, rng: &SimRng) -> Arc<Service> {
        Arc::new(Service::new(
            name,
            ServiceKind::ApiGateway,
            "us-east-1",
            ScalingPolicy {
                initial_instances: instances,
                min_instances: 1,
                max_instances: 10,
                auto_scaling: false,
            },
            rng.clone(),
        ))
    }

    async fn quiet_service(name: &str, instances: usize, rng: &SimRng) -> Arc<Service> {
        let service = test_service(name, instances, rng);
        for instance in service.instances().await {
            instance.introduce_errors(0.0);
        }
        service
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_service_is_rejected() {
        let rng = SimRng::seeded(3);
        let balancer = LoadBalancer::new("edge", Strategy::Random, rng);

        let err = balancer.route_request("ghost").await.unwrap_err();
        assert!(matches!(err, ServiceError::UnknownService(name) if name == "ghost"));
    }

    #[tokio::test(start_paused = true)]
    async fn round_robin_cycles_through_instances() {
        let rng = SimRng::seeded(3);
        let balancer = Arc::new(LoadBalancer::new("edge", Strategy::RoundRobin, rng.clone()));
        balancer.register_service(quiet_service("api", 2, &rng).await).await;

        let mut served = Vec::new();
        for _ in 0..4 {
            served.push(balancer.route_request("api").await.unwrap().instance);
        }
        assert_eq!(served[0], served[2]);
        assert_eq!(served[1], served[3]);
        assert_ne!(served[0], served[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn unregister_resets_the_round_robin_cursor() {
        let rng = SimRng::seeded(3);
        let balancer = Arc::new(LoadBalancer::new("edge", Strategy::RoundRobin, rng.clone()));
        let service = quiet_service("api", 2, &rng).await;
        balancer.register_service(service.clone()).await;

        let first = balancer.route_request("api").await.unwrap().instance;
        assert!(balancer.unregister_service("api").await);
        balancer.register_service(service).await;
        let after = balancer.route_request("api").await.unwrap().instance;
        assert_eq!(first, after);
    }

    #[tokio::test(start_paused = true)]
    async fn least_connections_spreads_across_instances() {
        let rng = SimRng::seeded(3);
        let balancer = Arc::new(LoadBalancer::new("edge", Strategy::LeastConnections, rng.clone()));
        balancer.register_service(quiet_service("api", 3, &rng).await).await;

        let mut served = std::collections::HashSet::new();
        for _ in 0..3 {
            served.insert(balancer.route_request("api").await.unwrap().instance);
        }
        assert_eq!(served.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn health_based_avoids_the_loaded_instance() {
        let rng = SimRng::seeded(3);
        let balancer = Arc::new(LoadBalancer::new("edge", Strategy::HealthBased, rng.clone()));
        let service = quiet_service("api", 2, &rng).await;
        balancer.register_service(service.clone()).await;

        let instances = service.instances().await;
        instances[0].set_cpu_percent(95.0);
        instances[1].set_cpu_percent(20.0);

        let routed = balancer.route_request("api").await.unwrap();
        assert_eq!(routed.instance, instances[1].id());
    }

    #[tokio::test(start_paused = true)]
    async fn routing_metadata_is_attached() {
        let rng = SimRng::seeded(3);
        let balancer = Arc::new(LoadBalancer::new("edge", Strategy::Random, rng.clone()));
        balancer.register_service(quiet_service("api", 1, &rng).await).await;

        let routed = balancer.route_request("api").await.unwrap();
        assert_eq!(routed.balancer, "edge");
        assert_eq!(routed.strategy, Strategy::Random);
        assert!(routed.balancer_time_ms + 0.01 >= routed.response_time_ms);
    }

    #[tokio::test(start_paused = true)]
    async fn degrade_multiplies_base_latency() {
        let rng = SimRng::seeded(3);
        let balancer = Arc::new(LoadBalancer::new("edge", Strategy::Random, rng.clone()));
        let service = quiet_service("api", 2, &rng).await;
        balancer.register_service(service.clone()).await;

        let before: Vec<f64> = service
            .instances()
            .await
            .iter()
            .map(|i| i.base_response_time_ms())
            .collect();
        balancer.chaos_degrade_service("api", 3.0).await.unwrap();
        let after: Vec<f64> = service
            .instances()
            .await
            .iter()
            .map(|i| i.base_response_time_ms())
            .collect();
        for (b, a) in before.iter().zip(&after) {
            assert!((a - b * 3.0).abs() < 1e-9);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn chaos_removal_zeroes_availability() {
        let rng = SimRng::seeded(3);
        let balancer = LoadBalancer::new("edge", Strategy::Random, rng.clone());
        balancer.register_service(quiet_service("api", 3, &rng).await).await;
        balancer.register_service(quiet_service("db", 2, &rng).await).await;
        assert_eq!(balancer.service_availability("api").await.unwrap(), 100.0);

        assert_eq!(balancer.chaos_remove_service("api").await.unwrap(), 3);

        assert_eq!(balancer.service_availability("api").await.unwrap(), 0.0);
        let sweep = balancer.health_check_all_services().await;
        assert_eq!(sweep["api"].total, 3);
        assert_eq!(sweep["api"].healthy, 0);
        assert_eq!(sweep["api"].availability_percent, 0.0);
        // healthy probes can flap, terminated ones cannot
        assert!(sweep["db"].healthy >= 1);
        assert!(balancer.service_availability("ghost").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn traffic_generator_stops_at_the_deadline() {
        let rng = SimRng::seeded(3);
        let balancer = Arc::new(LoadBalancer::new("edge", Strategy::Random, rng.clone()));
        balancer.register_service(quiet_service("api", 2, &rng).await).await;

        balancer
            .simulate_traffic(10.0, Some(Duration::from_secs(2)))
            .await;
        sleep(Duration::from_secs(5)).await;

        let metrics = balancer.balancer_metrics().await;
        assert!(metrics.total_requests > 0);
        let finished = balancer
            .traffic_handle
            .lock()
            .unwrap()
            .as_ref()
            .map(|h| h.is_finished())
            .unwrap_or(true);
        assert!(finished);
    }

    #[tokio::test(start_paused = true)]
    async fn rates_derive_from_counter_deltas() {
        let rng = SimRng::seeded(3);
        let balancer = Arc::new(LoadBalancer::new("edge", Strategy::Random, rng.clone()));
        balancer.register_service(quiet_service("api", 2, &rng).await).await;

        for _ in 0..10 {
            balancer.route_request("api").await.unwrap();
        }
        balancer.derive_rates(2.0);
        let rates = balancer.current_rates();
        assert!((rates.requests_per_second - 5.0).abs() < 1e-9);
        assert!(rates.avg_latency_ms > 0.0);
        assert_eq!(rates.error_rate_percent, 0.0);

        // no new traffic, next window reads zero
        balancer.derive_rates(1.0);
        assert_eq!(balancer.current_rates().requests_per_second, 0.0);
    }
}
