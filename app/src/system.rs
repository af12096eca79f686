use crate::balancer::LoadBalancer;
use crate::error::Error;
use crate::experiment::{ExperimentReport, ServiceMap};
use crate::metrics;
use crate::monitoring::Monitoring;
use crate::monkey::ChaosMonkey;
use crate::rng::SimRng;
use crate::runner::{ExperimentRequest, ExperimentRunner};
use crate::service::{ScalingPolicy, Service, ServiceKind};
use crate::spec::FleetSpec;
use crate::util::epoch_ms;
use resilience::Timeout;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::*;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);
/// Wall-clock bound on one maintenance sweep.
const AUDIT_TIMEOUT: Duration = Duration::from_secs(20);
const BALANCER_ERROR_WARN_PERCENT: f64 = 10.0;

/// Owns the whole simulation: builds the fleet from a `FleetSpec`, wires
/// every service into the balancer, monitoring, chaos monkey and experiment
/// runner, and drives the start/stop lifecycle plus a periodic maintenance
/// audit.
pub struct Orchestrator {
    name: String,
    rng: SimRng,
    spec: FleetSpec,
    services: ServiceMap,
    balancer: Arc<LoadBalancer>,
    monitoring: Arc<Monitoring>,
    monkey: Arc<ChaosMonkey>,
    runner: Arc<ExperimentRunner>,
    audit_timeout: Timeout,
    running: AtomicBool,
    started_at_ms: Mutex<Option<u64>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Validates the spec, constructs every component and registers the
    /// configured services. Nothing runs until `start()`.
    pub async fn build(
        name: impl Into<String>,
        spec: FleetSpec,
        rng: SimRng,
    ) -> Result<Arc<Self>, Error> {
        spec.validate()?;
        let name = name.into();

        let services: ServiceMap = Arc::new(RwLock::new(HashMap::new()));
        let balancer = Arc::new(LoadBalancer::new(
            format!("{name}-balancer"),
            spec.load_balancer.strategy,
            rng.clone(),
        ));
        let monitoring = Arc::new(Monitoring::new(spec.collection_interval()));
        for (metric, threshold) in &spec.monitoring.alert_thresholds {
            monitoring.alerts().set_threshold(metric, *threshold);
        }
        let monkey = Arc::new(ChaosMonkey::new(
            format!("{name}-monkey"),
            spec.monkey_config(),
            rng.clone(),
        ));
        let runner = Arc::new(ExperimentRunner::new(
            format!("{name}-runner"),
            spec.runner_config(),
            services.clone(),
            rng.clone(),
        ));

        let orchestrator = Arc::new(Self {
            name,
            rng,
            spec,
            services,
            balancer,
            monitoring,
            monkey,
            runner,
            audit_timeout: Timeout::new(AUDIT_TIMEOUT),
            running: AtomicBool::new(false),
            started_at_ms: Mutex::new(None),
            maintenance: Mutex::new(None),
        });

        orchestrator
            .monitoring
            .register_component("load_balancer", orchestrator.balancer.clone())
            .await;

        for (service_name, service_spec) in &orchestrator.spec.services {
            orchestrator
                .add_service(
                    service_name,
                    service_spec.kind,
                    &service_spec.region,
                    service_spec.scaling_policy(),
                )
                .await?;
        }

        info!(
            "orchestrator {} built: {} services, {} strategy",
            orchestrator.name,
            orchestrator.spec.services.len(),
            orchestrator.spec.load_balancer.strategy
        );
        Ok(orchestrator)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn monitoring(&self) -> &Arc<Monitoring> {
        &self.monitoring
    }

    pub fn monkey(&self) -> &Arc<ChaosMonkey> {
        &self.monkey
    }

    pub fn runner(&self) -> &Arc<ExperimentRunner> {
        &self.runner
    }

    /// Creates a service and registers it with every component. Works at
    /// runtime too: on a running system the new pool starts immediately.
    pub async fn add_service(
        &self,
        name: &str,
        kind: ServiceKind,
        region: &str,
        policy: ScalingPolicy,
    ) -> Result<Arc<Service>, Error> {
        let service = {
            let mut registry = self.services.write().await;
            if registry.contains_key(name) {
                return Err(Error::ServiceAlreadyExists(name.to_string()));
            }
            let service = Arc::new(Service::new(name, kind, region, policy, self.rng.clone()));
            registry.insert(name.to_string(), service.clone());
            service
        };

        self.balancer.register_service(service.clone()).await;
        self.monkey.register_service(service.clone()).await;
        self.monitoring.register_component(name, service.clone()).await;

        if self.running.load(Ordering::SeqCst) {
            service.clone().start().await;
        }
        Ok(service)
    }

    /// Unregisters the service everywhere, then terminates its pool.
    pub async fn remove_service(&self, name: &str) -> Result<(), Error> {
        let service = self
            .services
            .write()
            .await
            .remove(name)
            .ok_or_else(|| Error::UnknownService(name.to_string()))?;

        self.balancer.unregister_service(name).await;
        self.monkey.unregister_service(name).await;
        self.monitoring.unregister_component(name).await;
        service.shutdown().await;
        info!("service {name} removed from the fleet");
        Ok(())
    }

    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("orchestrator {} is already running", self.name);
            return;
        }
        *self.lock_started() = Some(epoch_ms());

        let services: Vec<Arc<Service>> = self.services.read().await.values().cloned().collect();
        for service in services {
            service.start().await;
        }
        self.monitoring.clone().start().await;
        self.monkey.clone().start().await;
        self.balancer.clone().start().await;
        self.spawn_maintenance();
        info!("orchestrator {} started", self.name);
    }

    /// Stops everything in dependency order: experiments first so their
    /// cleanups still see live services, then the monkey, monitoring,
    /// traffic and finally the services themselves.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("orchestrator {} stopping", self.name);
        if let Some(handle) = self.lock_maintenance().take() {
            handle.abort();
        }

        self.runner.shutdown().await;
        self.monkey.stop();
        self.monitoring.stop();
        self.balancer.stop_traffic();
        self.balancer.stop();

        let services: Vec<Arc<Service>> = self.services.read().await.values().cloned().collect();
        for service in services {
            service.shutdown().await;
        }
        info!("orchestrator {} stopped", self.name);
    }

    /// Creates and immediately starts an experiment. An admission refusal
    /// discards the pending entry and surfaces the violation.
    pub async fn run_chaos_experiment(&self, request: ExperimentRequest) -> Result<String, Error> {
        let id = self.runner.create_experiment(request).await;
        match self.runner.start_experiment(&id).await {
            Ok(()) => Ok(id),
            Err(e) => {
                self.runner.discard_pending(&id).await;
                Err(e)
            }
        }
    }

    pub async fn experiment_status(&self, id: &str) -> Result<ExperimentReport, Error> {
        self.runner
            .experiment_status(id)
            .await
            .ok_or_else(|| Error::UnknownExperiment(id.to_string()))
    }

    /// The status snapshot consumed by dashboards and report tooling:
    /// `{services, load_balancer, monitoring, chaos_monkey, experiments}`,
    /// all plain JSON. Reporting layers rely on this shape staying stable.
    pub async fn system_status(&self) -> Value {
        let mut services = serde_json::Map::new();
        let snapshot: Vec<Arc<Service>> = self.services.read().await.values().cloned().collect();
        for service in snapshot {
            let service_metrics = service.service_metrics().await;
            services.insert(
                service.name().to_string(),
                json!({
                    "total_instances": service_metrics.total_instances,
                    "healthy_instances": service_metrics.healthy_instances,
                    "availability_percent": service_metrics.availability_percent,
                    "avg_response_time_ms": service_metrics.avg_response_time_ms,
                    "error_rate_percent": service_metrics.error_rate_percent,
                    "instances": service.instance_details().await,
                }),
            );
        }

        json!({
            "timestamp_ms": epoch_ms(),
            "orchestrator": {
                "name": self.name,
                "running": self.running.load(Ordering::SeqCst),
                "uptime_seconds": self.uptime_seconds(),
            },
            "services": Value::Object(services),
            "load_balancer": self.balancer.balancer_metrics().await,
            "monitoring": self.monitoring.dashboard().await,
            "chaos_monkey": self.monkey.statistics().await,
            "experiments": self.runner.status_report().await,
        })
    }

    fn spawn_maintenance(self: &Arc<Self>) {
        let orchestrator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while orchestrator.running.load(Ordering::SeqCst) {
                sleep(MAINTENANCE_INTERVAL).await;
                if !orchestrator.running.load(Ordering::SeqCst) {
                    break;
                }
                let audit = orchestrator
                    .audit_timeout
                    .call(|| async {
                        orchestrator.audit_pass().await;
                        Ok::<_, Infallible>(())
                    })
                    .await;
                if audit.is_err() {
                    warn!(
                        "maintenance audit exceeded {:?}",
                        orchestrator.audit_timeout.duration()
                    );
                }
            }
        });
        *self.lock_maintenance() = Some(handle);
    }

    /// One maintenance sweep over the balancer's probe results. Flags
    /// services running under their minimum and refreshes the exposition
    /// gauges.
    async fn audit_pass(&self) {
        let sweep = self.balancer.health_check_all_services().await;
        let services: Vec<Arc<Service>> = self.services.read().await.values().cloned().collect();
        for service in services {
            let Some(health) = sweep.get(service.name()) else {
                continue;
            };
            metrics::HEALTHY_INSTANCES
                .with_label_values(&[service.name()])
                .set(health.healthy as i64);
            if health.healthy < service.min_instances() {
                warn!(
                    "service {} is under capacity: {}/{} healthy",
                    service.name(),
                    health.healthy,
                    service.min_instances()
                );
            }
        }

        let balancer = self.balancer.balancer_metrics().await;
        if balancer.error_rate_percent > BALANCER_ERROR_WARN_PERCENT {
            warn!(
                "balancer error rate at {:.1}% over {} requests",
                balancer.error_rate_percent, balancer.total_requests
            );
        }
        metrics::REQUESTS_ROUTED.set(balancer.total_requests as i64);
        metrics::OPEN_ALERTS.set(self.monitoring.alerts().open_count() as i64);
        debug!("maintenance audit complete");
    }

    fn uptime_seconds(&self) -> u64 {
        match *self.lock_started() {
            Some(started) => epoch_ms().saturating_sub(started) / 1000,
            None => 0,
        }
    }

    fn lock_started(&self) -> MutexGuard<'_, Option<u64>> {
        self.started_at_ms.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_maintenance(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.maintenance.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{ExperimentKind, ExperimentStatus, LatencyConfig};
    use crate::spec::ServiceSpec;
    use tokio::task::yield_now;

    fn small_spec(services: &[(&str, ServiceKind, usize, usize, &str)]) -> FleetSpec {
        let mut spec = FleetSpec::default();
        spec.enabled = false;
        spec.services.clear();
        for (name, kind, initial, min, region) in services {
            spec.services.insert(
                name.to_string(),
                ServiceSpec {
                    kind: *kind,
                    initial_instances: *initial,
                    min_instances: *min,
                    max_instances: 10,
                    auto_scaling: false,
                    region: region.to_string(),
                },
            );
        }
        spec
    }

    #[tokio::test]
    async fn build_registers_the_fleet_everywhere() {
        let spec = small_spec(&[
            ("api-service", ServiceKind::ApiGateway, 3, 1, "us-east-1"),
            ("db-service", ServiceKind::Database, 2, 1, "eu-west-1"),
        ]);
        let orchestrator = Orchestrator::build("sim", spec, SimRng::seeded(61))
            .await
            .unwrap();

        assert_eq!(
            orchestrator.balancer().service_names().await,
            vec!["api-service", "db-service"]
        );
        assert_eq!(
            orchestrator.monkey().registered_services().await,
            vec!["api-service", "db-service"]
        );
        assert_eq!(orchestrator.services.read().await.len(), 2);

        let api = orchestrator
            .services
            .read()
            .await
            .get("api-service")
            .cloned()
            .unwrap();
        assert_eq!(api.instance_count().await, 3);
    }

    #[tokio::test]
    async fn excluded_services_stay_off_the_monkeys_menu() {
        let mut spec = small_spec(&[
            ("api-service", ServiceKind::ApiGateway, 3, 1, "us-east-1"),
            ("db-service", ServiceKind::Database, 2, 1, "eu-west-1"),
        ]);
        spec.targets.excluded_services = vec!["db-service".to_string()];
        let orchestrator = Orchestrator::build("sim", spec, SimRng::seeded(62))
            .await
            .unwrap();

        assert_eq!(
            orchestrator.monkey().registered_services().await,
            vec!["api-service"]
        );
        assert_eq!(
            orchestrator.balancer().service_names().await,
            vec!["api-service", "db-service"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn services_can_join_and_leave_at_runtime() {
        let spec = small_spec(&[("api-service", ServiceKind::ApiGateway, 3, 1, "us-east-1")]);
        let orchestrator = Orchestrator::build("sim", spec, SimRng::seeded(63))
            .await
            .unwrap();
        orchestrator.start().await;

        let policy = ScalingPolicy {
            initial_instances: 2,
            min_instances: 1,
            max_instances: 4,
            auto_scaling: false,
        };
        let cache = orchestrator
            .add_service("cache-service", ServiceKind::Cache, "us-east-1", policy)
            .await
            .unwrap();
        assert_eq!(cache.instance_count().await, 2);
        assert_eq!(
            orchestrator.balancer().service_names().await,
            vec!["api-service", "cache-service"]
        );

        let duplicate = orchestrator
            .add_service("cache-service", ServiceKind::Cache, "us-east-1", policy)
            .await;
        assert!(matches!(duplicate, Err(Error::ServiceAlreadyExists(_))));

        orchestrator.remove_service("cache-service").await.unwrap();
        assert_eq!(
            orchestrator.balancer().service_names().await,
            vec!["api-service"]
        );
        assert_eq!(cache.healthy_count().await, 0);
        assert!(matches!(
            orchestrator.remove_service("cache-service").await,
            Err(Error::UnknownService(_))
        ));

        orchestrator.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn experiments_run_end_to_end_through_the_orchestrator() {
        let spec = small_spec(&[("api-service", ServiceKind::ApiGateway, 3, 1, "us-east-1")]);
        let orchestrator = Orchestrator::build("sim", spec, SimRng::seeded(64))
            .await
            .unwrap();
        orchestrator.start().await;

        let refused = orchestrator
            .run_chaos_experiment(ExperimentRequest {
                name: "ghost-latency".into(),
                kind: ExperimentKind::Latency(LatencyConfig::default()),
                target_service: Some("ghost-service".into()),
            })
            .await;
        assert!(refused.is_err());
        assert_eq!(orchestrator.runner().active_count().await, 0);

        let id = orchestrator
            .run_chaos_experiment(ExperimentRequest {
                name: "api-latency".into(),
                kind: ExperimentKind::Latency(LatencyConfig {
                    latency_ms: 300.0,
                    variance_ms: 50.0,
                    duration: Duration::from_secs(60),
                }),
                target_service: Some("api-service".into()),
            })
            .await
            .unwrap();
        yield_now().await;
        yield_now().await;

        let report = orchestrator.experiment_status(&id).await.unwrap();
        assert_eq!(report.status, ExperimentStatus::Running);

        orchestrator.stop().await;
        let report = orchestrator.experiment_status(&id).await.unwrap();
        assert!(report.status.is_terminal());

        assert!(matches!(
            orchestrator.experiment_status("no-such-id").await,
            Err(Error::UnknownExperiment(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn status_snapshot_keeps_the_reporting_contract() {
        let spec = small_spec(&[("api-service", ServiceKind::ApiGateway, 3, 1, "us-east-1")]);
        let orchestrator = Orchestrator::build("sim", spec, SimRng::seeded(65))
            .await
            .unwrap();
        orchestrator.start().await;

        let status = orchestrator.system_status().await;
        assert_eq!(status["orchestrator"]["running"], true);
        assert_eq!(status["services"]["api-service"]["total_instances"], 3);
        assert_eq!(status["services"]["api-service"]["healthy_instances"], 3);
        assert!(status["services"]["api-service"]["instances"].is_array());
        assert!(status["load_balancer"].is_object());
        assert!(status["monitoring"].is_object());
        assert!(status["chaos_monkey"].is_object());
        assert!(status["experiments"]["statistics"].is_object());

        orchestrator.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_ordered_and_idempotent() {
        let spec = small_spec(&[
            ("api-service", ServiceKind::ApiGateway, 3, 1, "us-east-1"),
            ("db-service", ServiceKind::Database, 2, 1, "eu-west-1"),
        ]);
        let orchestrator = Orchestrator::build("sim", spec, SimRng::seeded(66))
            .await
            .unwrap();
        orchestrator.start().await;
        orchestrator.start().await;

        orchestrator.stop().await;
        orchestrator.stop().await;

        let status = orchestrator.system_status().await;
        assert_eq!(status["orchestrator"]["running"], false);
        for service in orchestrator.services.read().await.values() {
            assert_eq!(service.healthy_count().await, 0);
        }
    }
}
