//! Chaos experiments: scoped fault injections with a lifecycle, a results
//! blob and a cleanup pass that restores whatever the run perturbed.

use crate::instance::{Instance, InstanceState};
use crate::rng::SimRng;
use crate::service::Service;
use crate::util::epoch_ms;
use serde_derive::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use strum::Display;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::{sleep, Instant};
use tracing::*;

/// Shared registry the runner hands to every experiment.
pub type ServiceMap = Arc<RwLock<HashMap<String, Arc<Service>>>>;

const LATENCY_TICK: Duration = Duration::from_secs(10);
const RESOURCE_TICK: Duration = Duration::from_secs(5);
const PARTITION_TICK: Duration = Duration::from_secs(10);
const ZONE_TICK: Duration = Duration::from_secs(10);
const REGION_TICK: Duration = Duration::from_secs(30);
const DIAGNOSTIC_TICK: Duration = Duration::from_secs(30);

/// Saturation above this level also flips the instance to Degraded.
const DEGRADE_ABOVE_LEVEL: f64 = 0.95;
/// Failure rate forced onto partitioned instances. Deliberately above the
/// chaos cap: a partitioned instance is unreachable, not merely flaky.
const PARTITION_ERROR_PROBABILITY: f64 = 0.8;
const PARTITION_LATENCY_MS: f64 = 10_000.0;
const RESTORED_ERROR_PROBABILITY: f64 = 0.01;
const DIAGNOSTIC_REPORTS_KEPT: usize = 5;
const SLOW_RESPONSE_MS: f64 = 1_000.0;
const HOT_CPU_PERCENT: f64 = 90.0;

#[derive(Error, Debug)]
pub enum ExperimentError {
    #[error("experiment requires a target service")]
    MissingTarget,
    #[error("unknown target service {0}")]
    UnknownTarget(String),
    #[error("no services registered")]
    NoServices,
    #[error("no healthy instances on {0}")]
    NoHealthyInstances(String),
    #[error("no spare capacity on {0} above its minimum")]
    NoSpareCapacity(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExperimentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExperimentStatus::Completed | ExperimentStatus::Failed | ExperimentStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Cpu,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IsolationKind {
    Partial,
    Complete,
}

#[derive(Debug, Clone)]
pub struct LatencyConfig {
    pub latency_ms: f64,
    pub variance_ms: f64,
    pub duration: Duration,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            latency_ms: 500.0,
            variance_ms: 100.0,
            duration: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceConfig {
    pub resource: ResourceKind,
    pub exhaustion_level: f64,
    pub duration: Duration,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            resource: ResourceKind::Cpu,
            exhaustion_level: 0.9,
            duration: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PartitionConfig {
    pub isolation: IsolationKind,
    pub duration: Duration,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationKind::Partial,
            duration: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ZoneFailureConfig {
    pub zone: String,
    pub duration: Duration,
}

impl ZoneFailureConfig {
    pub fn new(zone: impl Into<String>) -> Self {
        Self {
            zone: zone.into(),
            duration: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegionFailureConfig {
    pub region: String,
    pub duration: Duration,
}

impl RegionFailureConfig {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            duration: Duration::from_secs(900),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiagnosticConfig {
    pub duration: Duration,
}

impl Default for DiagnosticConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(300),
        }
    }
}

/// What an experiment does, with its type-specific knobs attached. The
/// variant decides both the fault injected and the cleanup that undoes it.
#[derive(Debug, Clone)]
pub enum ExperimentKind {
    Latency(LatencyConfig),
    Termination,
    ResourceExhaustion(ResourceConfig),
    NetworkPartition(PartitionConfig),
    ZoneFailure(ZoneFailureConfig),
    RegionFailure(RegionFailureConfig),
    DiagnosticScan(DiagnosticConfig),
}

impl ExperimentKind {
    pub fn label(&self) -> &'static str {
        match self {
            ExperimentKind::Latency(_) => "latency",
            ExperimentKind::Termination => "termination",
            ExperimentKind::ResourceExhaustion(_) => "resource_exhaustion",
            ExperimentKind::NetworkPartition(_) => "network_partition",
            ExperimentKind::ZoneFailure(_) => "chaos_gorilla",
            ExperimentKind::RegionFailure(_) => "chaos_kong",
            ExperimentKind::DiagnosticScan(_) => "doctor_monkey",
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            ExperimentKind::Latency(c) => c.duration,
            ExperimentKind::Termination => Duration::ZERO,
            ExperimentKind::ResourceExhaustion(c) => c.duration,
            ExperimentKind::NetworkPartition(c) => c.duration,
            ExperimentKind::ZoneFailure(c) => c.duration,
            ExperimentKind::RegionFailure(c) => c.duration,
            ExperimentKind::DiagnosticScan(c) => c.duration,
        }
    }

    /// Destructive experiments take capacity away; the runner's safety
    /// checks only gate these.
    pub fn is_destructive(&self) -> bool {
        !matches!(
            self,
            ExperimentKind::Latency(_) | ExperimentKind::DiagnosticScan(_)
        )
    }

    /// Zone and region failures sweep every registered service at once.
    pub fn is_fleet_wide(&self) -> bool {
        matches!(
            self,
            ExperimentKind::ZoneFailure(_) | ExperimentKind::RegionFailure(_)
        )
    }
}

#[derive(Debug)]
struct Lifecycle {
    status: ExperimentStatus,
    started_at_ms: Option<u64>,
    completed_at_ms: Option<u64>,
    results: Map<String, Value>,
    error_message: Option<String>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            status: ExperimentStatus::Pending,
            started_at_ms: None,
            completed_at_ms: None,
            results: Map::new(),
            error_message: None,
        }
    }
}

/// Everything the cleanup pass needs to put the fleet back.
#[derive(Debug, Default)]
struct RestoreState {
    /// Instance id to the base latency it had before the experiment.
    base_latency_ms: HashMap<String, f64>,
    /// Instances whose error rate or resource readings were overridden.
    touched: Vec<String>,
    /// Service name to the instances a zone or region sweep terminated.
    terminated: HashMap<String, Vec<String>>,
}

/// Snapshot of one experiment for status endpoints and history.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentReport {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub target_service: Option<String>,
    pub status: ExperimentStatus,
    pub duration_seconds: u64,
    pub created_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
    pub runtime_seconds: Option<f64>,
    pub results: Value,
    pub error_message: Option<String>,
}

/// One chaos experiment. Built by the runner, executed on its own task;
/// `run` drives execute, settles the terminal status and always cleans up.
pub struct Experiment {
    id: String,
    name: String,
    kind: ExperimentKind,
    target_service: Option<String>,
    created_at_ms: u64,
    lifecycle: Mutex<Lifecycle>,
    restore: Mutex<RestoreState>,
    cancel: AtomicBool,
}

impl Experiment {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        kind: ExperimentKind,
        target_service: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            target_service,
            created_at_ms: epoch_ms(),
            lifecycle: Mutex::new(Lifecycle::default()),
            restore: Mutex::new(RestoreState::default()),
            cancel: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ExperimentKind {
        &self.kind
    }

    pub fn target_service(&self) -> Option<&str> {
        self.target_service.as_deref()
    }

    pub fn status(&self) -> ExperimentStatus {
        self.lock_lifecycle().status
    }

    /// Flags the run loop to wind down at its next tick.
    pub fn request_stop(&self) {
        info!("stop requested for experiment {} ({})", self.name, self.id);
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Stamps the results of an admitted-but-not-executed dry run.
    pub(crate) fn mark_dry_run(&self) {
        self.lock_lifecycle()
            .results
            .insert("dry_run".to_string(), Value::Bool(true));
    }

    /// Pending to Running, once. False when the experiment already started.
    pub fn begin(&self) -> bool {
        let mut lifecycle = self.lock_lifecycle();
        if lifecycle.status != ExperimentStatus::Pending {
            return false;
        }
        lifecycle.status = ExperimentStatus::Running;
        lifecycle.started_at_ms = Some(epoch_ms());
        true
    }

    pub fn report(&self) -> ExperimentReport {
        let lifecycle = self.lock_lifecycle();
        let runtime_seconds = lifecycle.started_at_ms.map(|started| {
            let end = lifecycle.completed_at_ms.unwrap_or_else(epoch_ms);
            end.saturating_sub(started) as f64 / 1_000.0
        });
        ExperimentReport {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind.label().to_string(),
            target_service: self.target_service.clone(),
            status: lifecycle.status,
            duration_seconds: self.kind.duration().as_secs(),
            created_at_ms: self.created_at_ms,
            started_at_ms: lifecycle.started_at_ms,
            completed_at_ms: lifecycle.completed_at_ms,
            runtime_seconds,
            results: Value::Object(lifecycle.results.clone()),
            error_message: lifecycle.error_message.clone(),
        }
    }

    /// Executes the experiment to a terminal status. Cleanup runs whether
    /// the body completed, failed or was cancelled.
    pub async fn run(self: Arc<Self>, services: ServiceMap, rng: SimRng) {
        info!("experiment {} ({}) starting", self.name, self.kind.label());
        let outcome = self.execute(&services, &rng).await;
        {
            let mut lifecycle = self.lock_lifecycle();
            lifecycle.status = match outcome {
                Ok(()) if self.cancel.load(Ordering::SeqCst) => ExperimentStatus::Cancelled,
                Ok(()) => ExperimentStatus::Completed,
                Err(e) => {
                    error!("experiment {} failed: {e}", self.name);
                    lifecycle.error_message = Some(e.to_string());
                    ExperimentStatus::Failed
                }
            };
            lifecycle.completed_at_ms = Some(epoch_ms());
        }
        self.cleanup(&services, &rng).await;
        info!("experiment {} finished as {}", self.name, self.status());
    }

    async fn execute(&self, services: &ServiceMap, rng: &SimRng) -> Result<(), ExperimentError> {
        match &self.kind {
            ExperimentKind::Latency(config) => self.run_latency(config, services, rng).await,
            ExperimentKind::Termination => self.run_termination(services, rng).await,
            ExperimentKind::ResourceExhaustion(config) => {
                self.run_resource_exhaustion(config, services, rng).await
            }
            ExperimentKind::NetworkPartition(config) => {
                self.run_partition(config, services, rng).await
            }
            ExperimentKind::ZoneFailure(config) => self.run_zone_failure(config, services).await,
            ExperimentKind::RegionFailure(config) => {
                self.run_region_failure(config, services).await
            }
            ExperimentKind::DiagnosticScan(config) => self.run_diagnostic(config, services).await,
        }
    }

    fn still_running(&self, deadline: Instant) -> bool {
        !self.cancel.load(Ordering::SeqCst) && Instant::now() < deadline
    }

    async fn resolve_target(&self, services: &ServiceMap) -> Result<Arc<Service>, ExperimentError> {
        let name = self
            .target_service
            .as_deref()
            .ok_or(ExperimentError::MissingTarget)?;
        services
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ExperimentError::UnknownTarget(name.to_string()))
    }

    /// Sorted snapshot of the registry, so sweeps visit services in a
    /// stable order under a seeded rng.
    async fn registry_snapshot(services: &ServiceMap) -> Vec<(String, Arc<Service>)> {
        let mut snapshot: Vec<(String, Arc<Service>)> = services
            .read()
            .await
            .iter()
            .map(|(name, service)| (name.clone(), service.clone()))
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }

    fn record_results(&self, value: Value) {
        if let Value::Object(map) = value {
            self.lock_lifecycle().results.extend(map);
        }
    }

    async fn run_latency(
        &self,
        config: &LatencyConfig,
        services: &ServiceMap,
        rng: &SimRng,
    ) -> Result<(), ExperimentError> {
        let service = self.resolve_target(services).await?;
        let instances = service.instances().await;
        {
            let mut restore = self.lock_restore();
            for instance in &instances {
                restore
                    .base_latency_ms
                    .insert(instance.id().to_string(), instance.base_response_time_ms());
            }
        }
        info!(
            "injecting {}ms latency into {} ({} instances)",
            config.latency_ms,
            service.name(),
            instances.len()
        );
        for instance in &instances {
            instance.introduce_latency(config.latency_ms);
        }

        // Each tick nudges one healthy instance by a fresh draw so the
        // injected latency wanders instead of sitting flat.
        let deadline = Instant::now() + config.duration;
        let mut adjustments = 0u64;
        while self.still_running(deadline) {
            if config.variance_ms > 0.0 {
                let wobble = rng.range_f64(-config.variance_ms, config.variance_ms);
                let healthy = service.healthy_instances().await;
                if let Some(instance) = rng.pick(&healthy) {
                    instance.introduce_latency(wobble);
                    adjustments += 1;
                }
            }
            sleep(LATENCY_TICK).await;
        }

        self.record_results(json!({
            "latency_introduced_ms": config.latency_ms,
            "variance_ms": config.variance_ms,
            "adjustments": adjustments,
            "affected_instances": instances.len(),
        }));
        Ok(())
    }

    async fn run_termination(
        &self,
        services: &ServiceMap,
        rng: &SimRng,
    ) -> Result<(), ExperimentError> {
        let service = match self.target_service.as_deref() {
            Some(name) => services
                .read()
                .await
                .get(name)
                .cloned()
                .ok_or_else(|| ExperimentError::UnknownTarget(name.to_string()))?,
            None => {
                let snapshot = Self::registry_snapshot(services).await;
                let services_only: Vec<Arc<Service>> =
                    snapshot.into_iter().map(|(_, service)| service).collect();
                rng.pick(&services_only)
                    .cloned()
                    .ok_or(ExperimentError::NoServices)?
            }
        };
        if service.healthy_count().await <= service.min_instances() {
            return Err(ExperimentError::NoSpareCapacity(service.name().to_string()));
        }
        let instance = service
            .chaos_terminate_random_instance()
            .await
            .ok_or_else(|| ExperimentError::NoSpareCapacity(service.name().to_string()))?;
        self.record_results(json!({
            "service": service.name(),
            "terminated_instance": instance,
        }));
        Ok(())
    }

    async fn run_resource_exhaustion(
        &self,
        config: &ResourceConfig,
        services: &ServiceMap,
        rng: &SimRng,
    ) -> Result<(), ExperimentError> {
        let service = self.resolve_target(services).await?;
        let healthy = service.healthy_instances().await;
        let mut sorted = healthy;
        sorted.sort_by(|a, b| a.id().cmp(b.id()));
        let Some(instance) = rng.pick(&sorted).cloned() else {
            return Err(ExperimentError::NoHealthyInstances(
                service.name().to_string(),
            ));
        };
        self.lock_restore().touched.push(instance.id().to_string());
        warn!(
            "exhausting {} on {}/{} at {:.0}%",
            config.resource,
            service.name(),
            instance.id(),
            config.exhaustion_level * 100.0
        );

        // Reapplied every tick: normal request traffic keeps refreshing the
        // synthetic readings, so the squeeze has to keep pressing.
        let saturation = config.exhaustion_level * 100.0;
        let deadline = Instant::now() + config.duration;
        while self.still_running(deadline) {
            match config.resource {
                ResourceKind::Cpu => instance.set_cpu_percent(saturation),
                ResourceKind::Memory => instance.set_memory_percent(saturation),
            }
            if config.exhaustion_level > DEGRADE_ABOVE_LEVEL
                && instance.state() == InstanceState::Healthy
            {
                instance.set_state(InstanceState::Degraded);
            }
            sleep(RESOURCE_TICK).await;
        }

        self.record_results(json!({
            "resource": config.resource.to_string(),
            "exhaustion_level": config.exhaustion_level,
            "affected_instances": [instance.id()],
        }));
        Ok(())
    }

    async fn run_partition(
        &self,
        config: &PartitionConfig,
        services: &ServiceMap,
        rng: &SimRng,
    ) -> Result<(), ExperimentError> {
        let service = self.resolve_target(services).await?;
        let mut sorted = service.healthy_instances().await;
        if sorted.is_empty() {
            return Err(ExperimentError::NoHealthyInstances(
                service.name().to_string(),
            ));
        }
        sorted.sort_by(|a, b| a.id().cmp(b.id()));
        let isolated: Vec<Arc<Instance>> = match config.isolation {
            IsolationKind::Partial => {
                let count = (sorted.len() / 3).max(1);
                rng.sample_indices(sorted.len(), count)
                    .into_iter()
                    .map(|i| sorted[i].clone())
                    .collect()
            }
            IsolationKind::Complete => sorted.clone(),
        };
        warn!(
            "partitioning {} of {} instances off {}",
            isolated.len(),
            sorted.len(),
            service.name()
        );
        {
            let mut restore = self.lock_restore();
            for instance in &isolated {
                restore.touched.push(instance.id().to_string());
            }
        }
        for instance in &isolated {
            instance.set_error_probability(PARTITION_ERROR_PROBABILITY);
            instance.introduce_latency(PARTITION_LATENCY_MS);
        }

        let deadline = Instant::now() + config.duration;
        while self.still_running(deadline) {
            sleep(PARTITION_TICK).await;
        }

        let isolated_ids: Vec<String> = isolated
            .iter()
            .map(|instance| instance.id().to_string())
            .collect();
        self.record_results(json!({
            "isolation": config.isolation.to_string(),
            "isolated_instances": isolated_ids,
            "total_instances": sorted.len(),
            "isolation_percent": isolated.len() as f64 / sorted.len() as f64 * 100.0,
        }));
        Ok(())
    }

    /// Terminates every instance of every service sitting in `region`.
    async fn terminate_in_region(
        services: &ServiceMap,
        region: &str,
    ) -> HashMap<String, Vec<String>> {
        let snapshot = Self::registry_snapshot(services).await;
        let mut terminated: HashMap<String, Vec<String>> = HashMap::new();
        for (name, service) in &snapshot {
            let mut downed = Vec::new();
            for instance in service.instances().await {
                if instance.region() == region && instance.state() != InstanceState::Terminated {
                    instance.terminate();
                    downed.push(instance.id().to_string());
                }
            }
            if !downed.is_empty() {
                terminated.insert(name.clone(), downed);
            }
        }
        terminated
    }

    async fn run_zone_failure(
        &self,
        config: &ZoneFailureConfig,
        services: &ServiceMap,
    ) -> Result<(), ExperimentError> {
        error!("zone failure drill: taking down {}", config.zone);
        let terminated = Self::terminate_in_region(services, &config.zone).await;
        self.lock_restore().terminated = terminated.clone();
        let total: usize = terminated.values().map(Vec::len).sum();

        // Watch which services claw back above their minimums on their own.
        let snapshot = Self::registry_snapshot(services).await;
        let started = Instant::now();
        let deadline = started + config.duration;
        let mut recovery_seconds: HashMap<String, f64> = HashMap::new();
        while self.still_running(deadline) {
            for (name, service) in &snapshot {
                if !terminated.contains_key(name) || recovery_seconds.contains_key(name) {
                    continue;
                }
                if service.healthy_count().await >= service.min_instances() {
                    let elapsed = started.elapsed().as_secs_f64();
                    info!("service {name} recovered {elapsed:.1}s into the zone drill");
                    recovery_seconds.insert(name.clone(), elapsed);
                }
            }
            sleep(ZONE_TICK).await;
        }

        let mut affected: Vec<&String> = terminated.keys().collect();
        affected.sort();
        self.record_results(json!({
            "zone": config.zone,
            "affected_services": affected,
            "terminated_instances": terminated,
            "recovery_seconds": recovery_seconds,
            "total_terminated": total,
        }));
        Ok(())
    }

    async fn run_region_failure(
        &self,
        config: &RegionFailureConfig,
        services: &ServiceMap,
    ) -> Result<(), ExperimentError> {
        error!("region failure drill: taking down {}", config.region);
        let started = Instant::now();
        let terminated = Self::terminate_in_region(services, &config.region).await;
        let total: usize = terminated.values().map(Vec::len).sum();

        let deadline = started + config.duration;
        while self.still_running(deadline) {
            sleep(REGION_TICK).await;
        }

        let mut affected: Vec<&String> = terminated.keys().collect();
        affected.sort();
        self.record_results(json!({
            "region": config.region,
            "affected_services": affected,
            "terminated_instances": terminated,
            "total_terminated": total,
            "disaster_seconds": started.elapsed().as_secs_f64(),
        }));
        Ok(())
    }

    async fn run_diagnostic(
        &self,
        config: &DiagnosticConfig,
        services: &ServiceMap,
    ) -> Result<(), ExperimentError> {
        info!("diagnostic sweep started");
        let deadline = Instant::now() + config.duration;
        let mut scans = 0u64;
        let mut reports: VecDeque<Value> = VecDeque::new();
        let mut seen_unhealthy: HashSet<String> = HashSet::new();
        let mut last_totals = (0usize, 0usize);
        while self.still_running(deadline) {
            scans += 1;
            let (report, instances, healthy) =
                Self::scan_fleet(services, scans, &mut seen_unhealthy).await;
            last_totals = (instances, healthy);
            if reports.len() == DIAGNOSTIC_REPORTS_KEPT {
                reports.pop_front();
            }
            reports.push_back(report);
            sleep(DIAGNOSTIC_TICK).await;
        }

        let (instances, healthy) = last_totals;
        let availability = if instances > 0 {
            healthy as f64 / instances as f64 * 100.0
        } else {
            100.0
        };
        let health_status = if availability > 90.0 {
            "HEALTHY"
        } else if availability > 50.0 {
            "DEGRADED"
        } else {
            "CRITICAL"
        };
        self.record_results(json!({
            "total_scans": scans,
            "unique_unhealthy_instances": seen_unhealthy.len(),
            "reports": reports.iter().collect::<Vec<_>>(),
            "summary": {
                "overall_availability": availability,
                "total_instances": instances,
                "healthy_instances": healthy,
                "health_status": health_status,
            },
        }));
        Ok(())
    }

    /// One diagnostic pass: probe every instance, bucket it by state and
    /// flag slow or hot ones.
    async fn scan_fleet(
        services: &ServiceMap,
        scan: u64,
        seen_unhealthy: &mut HashSet<String>,
    ) -> (Value, usize, usize) {
        let snapshot = Self::registry_snapshot(services).await;
        let mut by_service = Map::new();
        let mut fleet_instances = 0usize;
        let mut fleet_healthy = 0usize;
        for (name, service) in snapshot {
            let instances = service.instances().await;
            let mut healthy = 0usize;
            let mut degraded: Vec<String> = Vec::new();
            let mut unhealthy: Vec<String> = Vec::new();
            let mut issues: Vec<Value> = Vec::new();
            for instance in &instances {
                instance.health_check();
                let id = instance.id().to_string();
                match instance.state() {
                    InstanceState::Healthy => healthy += 1,
                    InstanceState::Degraded => degraded.push(id.clone()),
                    _ => {
                        seen_unhealthy.insert(format!("{name}/{id}"));
                        unhealthy.push(id.clone());
                    }
                }
                if instance.response_time_ms() > SLOW_RESPONSE_MS {
                    issues.push(json!({
                        "instance": id,
                        "issue": "high_response_time",
                        "value": instance.response_time_ms(),
                    }));
                }
                if instance.cpu_percent() > HOT_CPU_PERCENT {
                    issues.push(json!({
                        "instance": id,
                        "issue": "high_cpu",
                        "value": instance.cpu_percent(),
                    }));
                }
            }
            fleet_instances += instances.len();
            fleet_healthy += healthy;
            by_service.insert(
                name,
                json!({
                    "total": instances.len(),
                    "healthy": healthy,
                    "degraded": degraded,
                    "unhealthy": unhealthy,
                    "performance_issues": issues,
                }),
            );
        }
        let report = json!({
            "scan": scan,
            "timestamp_ms": epoch_ms(),
            "services": by_service,
        });
        (report, fleet_instances, fleet_healthy)
    }

    async fn cleanup(&self, services: &ServiceMap, rng: &SimRng) {
        match &self.kind {
            ExperimentKind::Latency(_) => self.cleanup_latency(services).await,
            ExperimentKind::ResourceExhaustion(_) => self.cleanup_resources(services, rng).await,
            ExperimentKind::NetworkPartition(_) => self.cleanup_partition(services, rng).await,
            ExperimentKind::ZoneFailure(_) => self.cleanup_zone(services).await,
            ExperimentKind::RegionFailure(_) => {
                error!(
                    "region drill {} is over; capacity stays down until operators restore it",
                    self.name
                );
            }
            ExperimentKind::Termination | ExperimentKind::DiagnosticScan(_) => {}
        }
    }

    async fn cleanup_latency(&self, services: &ServiceMap) {
        let originals = self.lock_restore().base_latency_ms.clone();
        if originals.is_empty() {
            return;
        }
        let Some(service) = self.lookup_target(services).await else {
            return;
        };
        let mut restored = 0usize;
        for (id, base) in &originals {
            if let Some(instance) = service.instance(id).await {
                instance.set_base_response_time(*base);
                restored += 1;
            }
        }
        info!(
            "restored base latency on {restored} instances of {}",
            service.name()
        );
    }

    async fn cleanup_resources(&self, services: &ServiceMap, rng: &SimRng) {
        let touched = self.lock_restore().touched.clone();
        if touched.is_empty() {
            return;
        }
        let Some(service) = self.lookup_target(services).await else {
            return;
        };
        for id in &touched {
            if let Some(instance) = service.instance(id).await {
                instance.set_cpu_percent(rng.range_f64(20.0, 40.0));
                instance.set_memory_percent(rng.range_f64(30.0, 50.0));
                if instance.state() == InstanceState::Degraded {
                    instance.set_state(InstanceState::Healthy);
                }
            }
        }
        info!("resource readings restored on {}", service.name());
    }

    async fn cleanup_partition(&self, services: &ServiceMap, rng: &SimRng) {
        let touched = self.lock_restore().touched.clone();
        if touched.is_empty() {
            return;
        }
        let Some(service) = self.lookup_target(services).await else {
            return;
        };
        let (low, high) = service.kind().base_latency_band_ms();
        for id in &touched {
            if let Some(instance) = service.instance(id).await {
                instance.set_error_probability(RESTORED_ERROR_PROBABILITY);
                instance.set_base_response_time(rng.range_f64(low, high));
            }
        }
        info!("partition healed on {}", service.name());
    }

    /// Replaces what the zone sweep terminated, one fresh instance per
    /// casualty.
    async fn cleanup_zone(&self, services: &ServiceMap) {
        let terminated = self.lock_restore().terminated.clone();
        for (name, ids) in &terminated {
            let Some(service) = services.read().await.get(name).cloned() else {
                continue;
            };
            for _ in ids {
                service.add_instance().await;
            }
            info!("replaced {} instances of {name} after the zone drill", ids.len());
        }
    }

    async fn lookup_target(&self, services: &ServiceMap) -> Option<Arc<Service>> {
        let name = self.target_service.as_deref()?;
        services.read().await.get(name).cloned()
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_restore(&self) -> MutexGuard<'_, RestoreState> {
        self.restore.lock().unwrap_or_else(|e| e.into_inner())
    }
}
