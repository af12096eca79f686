//! Admission control and lifecycle bookkeeping for chaos experiments.
//!
//! The runner owns the safety rail: an experiment only starts once it has
//! passed the admission checks (or been explicitly forced past them), and
//! every finished run is reaped into bounded history with its outcome
//! counted.

use crate::error::Error;
use crate::experiment::{
    Experiment, ExperimentKind, ExperimentReport, ExperimentStatus, ServiceMap,
};
use crate::rng::SimRng;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::*;

const MAX_REPORT_HISTORY: usize = 50;
const RECENT_HISTORY_SHOWN: usize = 10;

/// Why an experiment was refused admission.
#[derive(Debug, thiserror::Error)]
pub enum SafetyViolation {
    #[error("no services registered to experiment on")]
    NoServicesRegistered,
    #[error("unknown target service {0}")]
    UnknownTarget(String),
    #[error("{service} has {healthy} healthy instances, at or below its minimum of {min}")]
    BelowMinimumHealthy {
        service: String,
        healthy: usize,
        min: usize,
    },
    #[error("{0} experiments already running, refusing to start another")]
    ConcurrencyLimit(usize),
    #[error("a fleet-wide experiment is already running")]
    DestructiveOverlap,
    #[error("region failure drills must be forced explicitly")]
    ForceRequired,
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub safety_checks_enabled: bool,
    pub dry_run_mode: bool,
    pub require_confirmation_for_destructive: bool,
    pub max_concurrent_experiments: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            safety_checks_enabled: true,
            dry_run_mode: false,
            require_confirmation_for_destructive: true,
            max_concurrent_experiments: 3,
        }
    }
}

/// What to run, before the runner assigns it an id.
#[derive(Debug, Clone)]
pub struct ExperimentRequest {
    pub name: String,
    pub kind: ExperimentKind,
    pub target_service: Option<String>,
}

#[derive(Debug, Default)]
struct RunnerCounters {
    total_created: u64,
    successful: u64,
    failed: u64,
    cancelled: u64,
}

type ReportHook = Box<dyn Fn(&ExperimentReport) + Send + Sync>;

#[derive(Default)]
struct Hooks {
    on_start: Vec<ReportHook>,
    on_complete: Vec<ReportHook>,
    on_fail: Vec<ReportHook>,
    on_cancel: Vec<ReportHook>,
}

enum Phase {
    Start,
    Complete,
    Fail,
    Cancel,
}

/// Creates, admits, runs and reaps chaos experiments against a shared
/// service registry.
pub struct ExperimentRunner {
    name: String,
    rng: SimRng,
    config: Mutex<RunnerConfig>,
    services: ServiceMap,
    active: RwLock<HashMap<String, Arc<Experiment>>>,
    history: Mutex<VecDeque<ExperimentReport>>,
    counters: Mutex<RunnerCounters>,
    hooks: Mutex<Hooks>,
    reapers: Mutex<Vec<JoinHandle<()>>>,
    batches: Mutex<Vec<JoinHandle<()>>>,
}

impl ExperimentRunner {
    pub fn new(
        name: impl Into<String>,
        config: RunnerConfig,
        services: ServiceMap,
        rng: SimRng,
    ) -> Self {
        Self {
            name: name.into(),
            rng,
            config: Mutex::new(config),
            services,
            active: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            counters: Mutex::new(RunnerCounters::default()),
            hooks: Mutex::new(Hooks::default()),
            reapers: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn configure(&self, config: RunnerConfig) {
        info!(
            "runner {} reconfigured: safety={} dry_run={} max_concurrent={}",
            self.name,
            config.safety_checks_enabled,
            config.dry_run_mode,
            config.max_concurrent_experiments
        );
        *self.lock_config() = config;
    }

    /// Registers the experiment and hands back its id. Nothing runs until
    /// `start_experiment` admits it.
    pub async fn create_experiment(&self, request: ExperimentRequest) -> String {
        let id = self.rng.short_id();
        let experiment = Arc::new(Experiment::new(
            id.clone(),
            request.name,
            request.kind,
            request.target_service,
        ));
        info!(
            "experiment {id} ({}) created targeting {}",
            experiment.kind().label(),
            experiment.target_service().unwrap_or("the whole fleet")
        );
        self.active.write().await.insert(id.clone(), experiment);
        self.lock_counters().total_created += 1;
        id
    }

    pub async fn start_experiment(self: &Arc<Self>, id: &str) -> Result<(), Error> {
        self.start_inner(id, false).await
    }

    /// Starts past the safety checks. The concurrency cap still holds.
    pub async fn force_experiment(self: &Arc<Self>, id: &str) -> Result<(), Error> {
        warn!("forcing experiment {id} past safety checks");
        self.start_inner(id, true).await
    }

    async fn start_inner(self: &Arc<Self>, id: &str, force: bool) -> Result<(), Error> {
        self.prune_reapers();
        let experiment = self
            .active
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownExperiment(id.to_string()))?;

        self.admit(&experiment, force).await?;

        if self.lock_config().dry_run_mode {
            info!(
                "dry run: experiment {id} ({}) admitted but not started",
                experiment.kind().label()
            );
            experiment.mark_dry_run();
            return Ok(());
        }
        if !experiment.begin() {
            return Err(Error::ExperimentNotPending(id.to_string()));
        }
        self.fire(Phase::Start, &experiment.report());

        let run = tokio::spawn(Arc::clone(&experiment).run(self.services.clone(), self.rng.clone()));
        let runner = Arc::clone(self);
        let reaper = tokio::spawn(async move {
            if let Err(e) = run.await {
                error!("experiment task for {} crashed: {e}", experiment.id());
            }
            runner.reap(experiment).await;
        });
        self.lock_reapers().push(reaper);
        Ok(())
    }

    /// The admission rules, in the order operators see them fail. Forcing
    /// (or disabling safety checks) skips everything except the
    /// concurrency cap.
    async fn admit(&self, experiment: &Arc<Experiment>, force: bool) -> Result<(), SafetyViolation> {
        let config = self.lock_config().clone();
        let skip_safety = force || !config.safety_checks_enabled;

        if !skip_safety {
            if self.services.read().await.is_empty() {
                return Err(SafetyViolation::NoServicesRegistered);
            }
            if let Some(target) = experiment.target_service() {
                let Some(service) = self.services.read().await.get(target).cloned() else {
                    return Err(SafetyViolation::UnknownTarget(target.to_string()));
                };
                if experiment.kind().is_destructive() {
                    let healthy = service.healthy_count().await;
                    let min = service.min_instances();
                    if healthy <= min {
                        return Err(SafetyViolation::BelowMinimumHealthy {
                            service: target.to_string(),
                            healthy,
                            min,
                        });
                    }
                }
            }
        }

        let running = self.running_count().await;
        if running >= config.max_concurrent_experiments {
            return Err(SafetyViolation::ConcurrencyLimit(running));
        }

        if !skip_safety {
            if experiment.kind().is_fleet_wide() && self.fleet_wide_running().await {
                return Err(SafetyViolation::DestructiveOverlap);
            }
            if matches!(experiment.kind(), ExperimentKind::RegionFailure(_))
                && config.require_confirmation_for_destructive
            {
                return Err(SafetyViolation::ForceRequired);
            }
        }
        Ok(())
    }

    async fn running_count(&self) -> usize {
        self.active
            .read()
            .await
            .values()
            .filter(|e| e.status() == ExperimentStatus::Running)
            .count()
    }

    async fn fleet_wide_running(&self) -> bool {
        self.active
            .read()
            .await
            .values()
            .any(|e| e.status() == ExperimentStatus::Running && e.kind().is_fleet_wide())
    }

    /// Moves a finished experiment out of the active set and into history.
    async fn reap(&self, experiment: Arc<Experiment>) {
        let report = experiment.report();
        {
            let mut history = self.lock_history();
            if history.len() == MAX_REPORT_HISTORY {
                history.pop_front();
            }
            history.push_back(report.clone());
        }
        {
            let mut counters = self.lock_counters();
            match report.status {
                ExperimentStatus::Completed => counters.successful += 1,
                ExperimentStatus::Failed => counters.failed += 1,
                ExperimentStatus::Cancelled => counters.cancelled += 1,
                _ => {}
            }
        }
        match report.status {
            ExperimentStatus::Completed => self.fire(Phase::Complete, &report),
            ExperimentStatus::Failed => self.fire(Phase::Fail, &report),
            ExperimentStatus::Cancelled => self.fire(Phase::Cancel, &report),
            _ => {}
        }
        self.active.write().await.remove(experiment.id());
    }

    pub async fn stop_experiment(&self, id: &str) -> Result<(), Error> {
        let experiment = self
            .active
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownExperiment(id.to_string()))?;
        experiment.request_stop();
        Ok(())
    }

    /// Drops an experiment that never left Pending. Started experiments are
    /// left for their reaper.
    pub async fn discard_pending(&self, id: &str) -> bool {
        let mut active = self.active.write().await;
        match active.get(id) {
            Some(experiment) if experiment.status() == ExperimentStatus::Pending => {
                active.remove(id);
                true
            }
            _ => false,
        }
    }

    pub async fn stop_all(&self) {
        let active: Vec<Arc<Experiment>> = self.active.read().await.values().cloned().collect();
        let mut stopped = 0usize;
        for experiment in &active {
            if experiment.status() == ExperimentStatus::Running {
                experiment.request_stop();
                stopped += 1;
            }
        }
        if stopped > 0 {
            info!("stop requested for {stopped} running experiments");
        }
    }

    pub async fn emergency_stop(&self) {
        error!("emergency stop: cancelling every running experiment");
        self.stop_all().await;
    }

    /// Creates every request up front, then starts them on a background
    /// task with `stagger` between admissions. Refused starts are logged
    /// and skipped, not retried.
    pub async fn run_batch(
        self: &Arc<Self>,
        requests: Vec<ExperimentRequest>,
        stagger: Duration,
    ) -> Vec<String> {
        let mut ids = Vec::with_capacity(requests.len());
        for request in requests {
            ids.push(self.create_experiment(request).await);
        }
        let runner = Arc::clone(self);
        let batch = ids.clone();
        let task = tokio::spawn(async move {
            for id in batch {
                if let Err(e) = runner.start_experiment(&id).await {
                    warn!("batch start of {id} refused: {e}");
                }
                sleep(stagger).await;
            }
        });
        self.lock_batches().push(task);
        ids
    }

    /// Report for one experiment, active or already reaped.
    pub async fn experiment_status(&self, id: &str) -> Option<ExperimentReport> {
        if let Some(experiment) = self.active.read().await.get(id) {
            return Some(experiment.report());
        }
        self.lock_history().iter().rev().find(|r| r.id == id).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    pub async fn status_report(&self) -> Value {
        let mut active: Vec<ExperimentReport> = self
            .active
            .read()
            .await
            .values()
            .map(|e| e.report())
            .collect();
        active.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms).then(a.id.cmp(&b.id)));
        let recent: Vec<ExperimentReport> = self
            .lock_history()
            .iter()
            .rev()
            .take(RECENT_HISTORY_SHOWN)
            .cloned()
            .collect();
        let (total_created, successful, failed, cancelled) = {
            let counters = self.lock_counters();
            (
                counters.total_created,
                counters.successful,
                counters.failed,
                counters.cancelled,
            )
        };
        let finished = successful + failed + cancelled;
        let success_rate = if finished > 0 {
            successful as f64 / finished as f64 * 100.0
        } else {
            0.0
        };
        json!({
            "active": active,
            "recent_history": recent,
            "statistics": {
                "total_created": total_created,
                "successful": successful,
                "failed": failed,
                "cancelled": cancelled,
                "success_rate_percent": success_rate,
            },
        })
    }

    pub fn on_start(&self, hook: impl Fn(&ExperimentReport) + Send + Sync + 'static) {
        self.lock_hooks().on_start.push(Box::new(hook));
    }

    pub fn on_complete(&self, hook: impl Fn(&ExperimentReport) + Send + Sync + 'static) {
        self.lock_hooks().on_complete.push(Box::new(hook));
    }

    pub fn on_fail(&self, hook: impl Fn(&ExperimentReport) + Send + Sync + 'static) {
        self.lock_hooks().on_fail.push(Box::new(hook));
    }

    pub fn on_cancel(&self, hook: impl Fn(&ExperimentReport) + Send + Sync + 'static) {
        self.lock_hooks().on_cancel.push(Box::new(hook));
    }

    /// Cancels pending batch starts, stops running experiments and waits
    /// for their cleanup to land. Every stopped run still gets reaped.
    pub async fn shutdown(&self) {
        for batch in self.lock_batches().drain(..) {
            batch.abort();
        }
        self.stop_all().await;
        let reapers: Vec<JoinHandle<()>> = self.lock_reapers().drain(..).collect();
        for reaper in reapers {
            if let Err(e) = reaper.await {
                if !e.is_cancelled() {
                    error!("experiment reaper crashed: {e}");
                }
            }
        }
        info!("runner {} shut down", self.name);
    }

    fn fire(&self, phase: Phase, report: &ExperimentReport) {
        let hooks = self.lock_hooks();
        let selected = match phase {
            Phase::Start => &hooks.on_start,
            Phase::Complete => &hooks.on_complete,
            Phase::Fail => &hooks.on_fail,
            Phase::Cancel => &hooks.on_cancel,
        };
        for hook in selected {
            hook(report);
        }
    }

    fn prune_reapers(&self) {
        self.lock_reapers().retain(|task| !task.is_finished());
    }

    fn lock_config(&self) -> MutexGuard<'_, RunnerConfig> {
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_history(&self) -> MutexGuard<'_, VecDeque<ExperimentReport>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_counters(&self) -> MutexGuard<'_, RunnerCounters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_hooks(&self) -> MutexGuard<'_, Hooks> {
        self.hooks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_reapers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.reapers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_batches(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.batches.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{LatencyConfig, RegionFailureConfig, ZoneFailureConfig};
    use crate::service::{ScalingPolicy, Service, ServiceKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn registry(specs: &[(&str, usize, &str)], rng: &SimRng) -> ServiceMap {
        let mut map = HashMap::new();
        for (name, count, region) in specs {
            let policy = ScalingPolicy {
                initial_instances: *count,
                min_instances: 1,
                max_instances: 10,
                auto_scaling: false,
            };
            let service = Arc::new(Service::new(
                *name,
                ServiceKind::ApiGateway,
                *region,
                policy,
                rng.clone(),
            ));
            map.insert((*name).to_string(), service);
        }
        Arc::new(RwLock::new(map))
    }

    fn latency_request(target: &str, duration: Duration) -> ExperimentRequest {
        ExperimentRequest {
            name: "latency-drill".into(),
            kind: ExperimentKind::Latency(LatencyConfig {
                latency_ms: 200.0,
                variance_ms: 20.0,
                duration,
            }),
            target_service: Some(target.into()),
        }
    }

    fn termination_request(target: Option<&str>) -> ExperimentRequest {
        ExperimentRequest {
            name: "kill-one".into(),
            kind: ExperimentKind::Termination,
            target_service: target.map(String::from),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn region_failure_needs_an_explicit_force() {
        let rng = SimRng::seeded(51);
        let services = registry(
            &[
                ("api-service", 3, "us-east-1"),
                ("auth-service", 3, "us-west-2"),
            ],
            &rng,
        )
        .await;
        let east = services.read().await.get("api-service").cloned().unwrap();
        let runner = Arc::new(ExperimentRunner::new(
            "runner",
            RunnerConfig::default(),
            services.clone(),
            rng,
        ));

        let id = runner
            .create_experiment(ExperimentRequest {
                name: "kong".into(),
                kind: ExperimentKind::RegionFailure(RegionFailureConfig {
                    region: "us-east-1".into(),
                    duration: Duration::from_secs(5),
                }),
                target_service: None,
            })
            .await;

        let refused = runner.start_experiment(&id).await;
        assert!(matches!(
            refused,
            Err(Error::SafetyViolation(SafetyViolation::ForceRequired))
        ));
        let report = runner.experiment_status(&id).await.unwrap();
        assert_eq!(report.status, ExperimentStatus::Pending);
        assert_eq!(east.healthy_count().await, 3);

        runner.force_experiment(&id).await.unwrap();
        let report = runner.experiment_status(&id).await.unwrap();
        assert_eq!(report.status, ExperimentStatus::Running);

        runner.shutdown().await;
        let report = runner.experiment_status(&id).await.unwrap();
        assert!(report.status.is_terminal());
        assert_eq!(east.healthy_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_cap_refuses_rather_than_queues() {
        let rng = SimRng::seeded(52);
        let services = registry(&[("api-service", 5, "us-east-1")], &rng).await;
        let runner = Arc::new(ExperimentRunner::new(
            "runner",
            RunnerConfig::default(),
            services,
            rng,
        ));

        let mut ids = Vec::new();
        for _ in 0..4 {
            let id = runner
                .create_experiment(latency_request("api-service", Duration::from_secs(600)))
                .await;
            ids.push(id);
        }
        for id in &ids[..3] {
            runner.start_experiment(id).await.unwrap();
        }

        let refused = runner.start_experiment(&ids[3]).await;
        assert!(matches!(
            refused,
            Err(Error::SafetyViolation(SafetyViolation::ConcurrencyLimit(3)))
        ));
        // the cap holds even when forced
        let forced = runner.force_experiment(&ids[3]).await;
        assert!(matches!(
            forced,
            Err(Error::SafetyViolation(SafetyViolation::ConcurrencyLimit(3)))
        ));
        assert_eq!(
            runner.experiment_status(&ids[3]).await.unwrap().status,
            ExperimentStatus::Pending
        );

        runner.shutdown().await;
    }

    #[tokio::test]
    async fn dry_run_admits_without_touching_anything() {
        let rng = SimRng::seeded(53);
        let services = registry(&[("api-service", 3, "us-east-1")], &rng).await;
        let service = services.read().await.get("api-service").cloned().unwrap();
        let bases: HashMap<String, f64> = service
            .instances()
            .await
            .iter()
            .map(|i| (i.id().to_string(), i.base_response_time_ms()))
            .collect();
        let runner = Arc::new(ExperimentRunner::new(
            "runner",
            RunnerConfig {
                dry_run_mode: true,
                ..RunnerConfig::default()
            },
            services,
            rng,
        ));

        let id = runner
            .create_experiment(latency_request("api-service", Duration::from_secs(60)))
            .await;
        runner.start_experiment(&id).await.unwrap();

        let report = runner.experiment_status(&id).await.unwrap();
        assert_eq!(report.status, ExperimentStatus::Pending);
        assert_eq!(report.results["dry_run"], true);
        assert_eq!(runner.active_count().await, 1);
        let after: HashMap<String, f64> = service
            .instances()
            .await
            .iter()
            .map(|i| (i.id().to_string(), i.base_response_time_ms()))
            .collect();
        assert_eq!(bases, after);
    }

    #[tokio::test]
    async fn admission_blocks_empty_registry_and_unknown_targets() {
        let rng = SimRng::seeded(54);
        let services: ServiceMap = Arc::new(RwLock::new(HashMap::new()));
        let runner = Arc::new(ExperimentRunner::new(
            "runner",
            RunnerConfig::default(),
            services.clone(),
            rng.clone(),
        ));

        let id = runner.create_experiment(termination_request(None)).await;
        let refused = runner.start_experiment(&id).await;
        assert!(matches!(
            refused,
            Err(Error::SafetyViolation(SafetyViolation::NoServicesRegistered))
        ));

        let service = Arc::new(Service::new(
            "api-service",
            ServiceKind::ApiGateway,
            "us-east-1",
            ScalingPolicy::default(),
            rng.clone(),
        ));
        services
            .write()
            .await
            .insert("api-service".to_string(), service);

        let id = runner
            .create_experiment(termination_request(Some("nope")))
            .await;
        let refused = runner.start_experiment(&id).await;
        assert!(matches!(
            refused,
            Err(Error::SafetyViolation(SafetyViolation::UnknownTarget(_)))
        ));
    }

    #[tokio::test]
    async fn destructive_runs_are_blocked_at_the_minimum() {
        let rng = SimRng::seeded(55);
        let services = registry(&[("db-service", 1, "us-east-1")], &rng).await;
        let runner = Arc::new(ExperimentRunner::new(
            "runner",
            RunnerConfig::default(),
            services,
            rng,
        ));

        let id = runner
            .create_experiment(termination_request(Some("db-service")))
            .await;
        let refused = runner.start_experiment(&id).await;
        assert!(matches!(
            refused,
            Err(Error::SafetyViolation(SafetyViolation::BelowMinimumHealthy {
                healthy: 1,
                min: 1,
                ..
            }))
        ));

        // non-destructive experiments are not capacity-gated
        let id = runner
            .create_experiment(latency_request("db-service", Duration::from_secs(0)))
            .await;
        runner.start_experiment(&id).await.unwrap();
        runner.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn finished_experiments_land_in_history_with_counters() {
        let rng = SimRng::seeded(56);
        let services = registry(&[("api-service", 4, "us-east-1")], &rng).await;
        let runner = Arc::new(ExperimentRunner::new(
            "runner",
            RunnerConfig::default(),
            services,
            rng,
        ));
        let started = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        {
            let started = Arc::clone(&started);
            runner.on_start(move |_| {
                started.fetch_add(1, Ordering::SeqCst);
            });
            let completed = Arc::clone(&completed);
            runner.on_complete(move |_| {
                completed.fetch_add(1, Ordering::SeqCst);
            });
        }

        let id = runner
            .create_experiment(termination_request(Some("api-service")))
            .await;
        runner.start_experiment(&id).await.unwrap();
        runner.shutdown().await;

        assert_eq!(runner.active_count().await, 0);
        let report = runner.experiment_status(&id).await.unwrap();
        assert_eq!(report.status, ExperimentStatus::Completed);
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(completed.load(Ordering::SeqCst), 1);

        let status = runner.status_report().await;
        assert_eq!(status["statistics"]["successful"], 1);
        assert_eq!(status["statistics"]["total_created"], 1);
        assert_eq!(status["statistics"]["success_rate_percent"], 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_fleet_wide_experiment_runs_at_a_time() {
        let rng = SimRng::seeded(57);
        let services = registry(
            &[
                ("api-service", 3, "us-east-1"),
                ("auth-service", 3, "us-west-2"),
            ],
            &rng,
        )
        .await;
        let runner = Arc::new(ExperimentRunner::new(
            "runner",
            RunnerConfig {
                require_confirmation_for_destructive: false,
                ..RunnerConfig::default()
            },
            services,
            rng,
        ));

        let gorilla = |zone: &str| ExperimentRequest {
            name: "gorilla".into(),
            kind: ExperimentKind::ZoneFailure(ZoneFailureConfig {
                zone: zone.into(),
                duration: Duration::from_secs(60),
            }),
            target_service: None,
        };
        let first = runner.create_experiment(gorilla("us-east-1")).await;
        let second = runner.create_experiment(gorilla("us-west-2")).await;

        runner.start_experiment(&first).await.unwrap();
        let refused = runner.start_experiment(&second).await;
        assert!(matches!(
            refused,
            Err(Error::SafetyViolation(SafetyViolation::DestructiveOverlap))
        ));

        runner.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_experiment_cancels_midflight() {
        let rng = SimRng::seeded(58);
        let services = registry(&[("api-service", 3, "us-east-1")], &rng).await;
        let runner = Arc::new(ExperimentRunner::new(
            "runner",
            RunnerConfig::default(),
            services,
            rng,
        ));

        let id = runner
            .create_experiment(latency_request("api-service", Duration::from_secs(600)))
            .await;
        runner.start_experiment(&id).await.unwrap();
        runner.stop_experiment(&id).await.unwrap();
        runner.shutdown().await;

        let report = runner.experiment_status(&id).await.unwrap();
        assert_eq!(report.status, ExperimentStatus::Cancelled);
        let status = runner.status_report().await;
        assert_eq!(status["statistics"]["cancelled"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_runs_create_then_stagger_starts() {
        let rng = SimRng::seeded(59);
        let services = registry(&[("api-service", 5, "us-east-1")], &rng).await;
        let runner = Arc::new(ExperimentRunner::new(
            "runner",
            RunnerConfig::default(),
            services.clone(),
            rng,
        ));

        let ids = runner
            .run_batch(
                vec![
                    termination_request(Some("api-service")),
                    termination_request(Some("api-service")),
                ],
                Duration::from_secs(1),
            )
            .await;
        assert_eq!(ids.len(), 2);

        let mut rounds = 0;
        while runner.active_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            rounds += 1;
            assert!(rounds < 200, "batch never drained");
        }

        let status = runner.status_report().await;
        assert_eq!(status["statistics"]["successful"], 2);
        let service = services.read().await.get("api-service").cloned().unwrap();
        assert_eq!(service.healthy_count().await, 3);
        runner.shutdown().await;
    }
}
