use crate::error::Error;
use crate::rng::SimRng;
use crate::service::Service;
use crate::util::{epoch_ms, hours_ago_ms};
use chrono::{Datelike, Local, Timelike, Weekday};
use futures_timer::Delay;
use serde_derive::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::*;

const MAX_TERMINATION_HISTORY: usize = 100;
const OUTAGE_PAUSE_SECS: (f64, f64) = (1.0, 5.0);

/// Scheduler knobs, swapped atomically through [`ChaosMonkey::configure`].
#[derive(Debug, Clone)]
pub struct MonkeyConfig {
    pub enabled: bool,
    pub termination_probability: f64,
    pub check_interval: Duration,
    pub min_healthy_instances: usize,
    pub max_instances_to_kill: usize,
    pub excluded_services: HashSet<String>,
    pub allowed_days: HashSet<Weekday>,
    /// Hour-of-day window `[start, end)`, local time.
    pub allowed_hours: (u32, u32),
}

impl Default for MonkeyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            termination_probability: 0.3,
            check_interval: Duration::from_secs(30),
            min_healthy_instances: 1,
            max_instances_to_kill: 1,
            excluded_services: HashSet::new(),
            allowed_days: [
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ]
            .into_iter()
            .collect(),
            allowed_hours: (9, 17),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChaosOutcome {
    Success { service: String, instance: String },
    Blocked { service: String, reason: String },
    Error { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct TerminationRecord {
    pub timestamp_ms: u64,
    pub service: String,
    pub instance: String,
    pub monkey: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutageReport {
    pub service: String,
    pub requested: usize,
    pub terminated: Vec<String>,
}

#[derive(Debug, Default)]
struct MonkeyCounters {
    attempted: u64,
    successful: u64,
    blocked: u64,
    last_termination_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonkeyStatistics {
    pub name: String,
    pub enabled: bool,
    pub running: bool,
    pub termination_probability: f64,
    pub check_interval_seconds: u64,
    pub min_healthy_instances: usize,
    pub max_instances_to_kill: usize,
    pub excluded_services: Vec<String>,
    pub registered_services: usize,
    pub attempted_terminations: u64,
    pub successful_terminations: u64,
    pub blocked_terminations: u64,
    pub last_termination_ms: Option<u64>,
    pub inside_window: bool,
    pub recent_terminations: Vec<TerminationRecord>,
}

type TerminationCallback = Box<dyn Fn(&str, &str) + Send + Sync>;

/// The classic instance killer. On every scheduler tick inside the allowed
/// window it rolls a die and, on a hit, terminates one random instance of one
/// eligible service. Eligible means registered, not excluded, and holding
/// strictly more healthy instances than the configured floor; the owning
/// Service applies its own minimum on top of that.
pub struct ChaosMonkey {
    name: String,
    rng: SimRng,
    config: Mutex<MonkeyConfig>,
    services: RwLock<HashMap<String, Arc<Service>>>,
    stats: Mutex<MonkeyCounters>,
    history: Mutex<VecDeque<TerminationRecord>>,
    callbacks: Mutex<Vec<TerminationCallback>>,
    running: AtomicBool,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl ChaosMonkey {
    pub fn new(name: impl Into<String>, config: MonkeyConfig, rng: SimRng) -> Self {
        Self {
            name: name.into(),
            rng,
            config: Mutex::new(config),
            services: RwLock::new(HashMap::new()),
            stats: Mutex::new(MonkeyCounters::default()),
            history: Mutex::new(VecDeque::new()),
            callbacks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            loop_handle: Mutex::new(None),
            timers: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.lock_config().enabled
    }

    /// Swaps in a new configuration wholesale. Already-registered services
    /// stay registered; new exclusions take effect at the next selection.
    pub fn configure(&self, config: MonkeyConfig) {
        info!(
            "chaos monkey {} configured: enabled={}, probability={}, interval={:?}",
            self.name, config.enabled, config.termination_probability, config.check_interval
        );
        *self.lock_config() = config;
    }

    pub async fn register_service(&self, service: Arc<Service>) {
        let name = service.name().to_string();
        if self.lock_config().excluded_services.contains(&name) {
            info!("service {name} is excluded from chaos, not registering");
            return;
        }
        self.services.write().await.insert(name.clone(), service);
        info!("service {name} registered as a chaos target");
    }

    pub async fn unregister_service(&self, name: &str) -> bool {
        self.services.write().await.remove(name).is_some()
    }

    pub async fn registered_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn start(self: Arc<Self>) {
        if !self.is_enabled() {
            info!("chaos monkey {} is disabled, scheduler not started", self.name);
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("chaos monkey {} is already running", self.name);
            return;
        }
        let monkey = self.clone();
        let handle = tokio::spawn(async move {
            info!("chaos monkey {} scheduler started", monkey.name);
            while monkey.running.load(Ordering::SeqCst) {
                monkey.tick().await;
                let interval = monkey.lock_config().check_interval;
                Delay::new(interval).await;
            }
        });
        *self.loop_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Stops the scheduler and cancels any pending re-enable/re-include
    /// timers. History and counters survive.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.loop_handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        for timer in self.lock_timers().drain(..) {
            timer.abort();
        }
        info!("chaos monkey {} stopped", self.name);
    }

    /// Immediate chaos, skipping the schedule gate and the probability roll.
    /// Safety rules still apply: a named service can be refused by its own
    /// instance floor, an unnamed one also by the monkey's eligibility check.
    pub async fn force_chaos(&self, service_name: Option<&str>) -> ChaosOutcome {
        if !self.is_enabled() {
            return ChaosOutcome::Error {
                reason: "chaos monkey is disabled".to_string(),
            };
        }
        if let Some(name) = service_name {
            if !self.services.read().await.contains_key(name) {
                return ChaosOutcome::Error {
                    reason: format!("service {name} is not a registered chaos target"),
                };
            }
        }
        let target = match service_name {
            Some(name) => name.to_string(),
            None => match self.select_target().await {
                Some(target) => target,
                None => {
                    return ChaosOutcome::Error {
                        reason: "no eligible chaos targets".to_string(),
                    }
                }
            },
        };
        let Some(service) = self.services.read().await.get(&target).cloned() else {
            return ChaosOutcome::Error {
                reason: format!("service {target} is not a registered chaos target"),
            };
        };
        match self.try_terminate(&target, &service).await {
            Some(instance) => {
                self.record_termination(&target, &instance);
                ChaosOutcome::Success {
                    service: target,
                    instance,
                }
            }
            None => ChaosOutcome::Blocked {
                service: target,
                reason: "termination would breach the minimum healthy floor".to_string(),
            },
        }
    }

    /// Terminates up to `min(instance_count, max_instances_to_kill)` instances
    /// of one service with a short randomized pause between kills, stopping
    /// early once a termination is refused.
    pub async fn simulate_outage(
        &self,
        service_name: Option<&str>,
        instance_count: usize,
    ) -> Result<OutageReport, Error> {
        if !self.is_enabled() {
            return Err(Error::ChaosDisabled);
        }
        let target = match service_name {
            Some(name) => name.to_string(),
            None => self.select_target().await.ok_or(Error::NoChaosTargets)?,
        };
        let Some(service) = self.services.read().await.get(&target).cloned() else {
            return Err(Error::UnknownService(target));
        };

        let cap = self.lock_config().max_instances_to_kill;
        let mut terminated = Vec::new();
        for _ in 0..instance_count.min(cap) {
            match self.try_terminate(&target, &service).await {
                Some(instance) => {
                    self.record_termination(&target, &instance);
                    terminated.push(instance);
                    let (low, high) = OUTAGE_PAUSE_SECS;
                    sleep(Duration::from_secs_f64(self.rng.range_f64(low, high))).await;
                }
                None => break,
            }
        }
        info!(
            "simulated outage on {target}: terminated {} of {instance_count} requested",
            terminated.len()
        );
        Ok(OutageReport {
            service: target,
            requested: instance_count,
            terminated,
        })
    }

    pub fn add_termination_callback(&self, callback: impl Fn(&str, &str) + Send + Sync + 'static) {
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(callback));
    }

    /// Pauses all chaos activity, restoring the previous enabled flag once
    /// the window passes. The timer is cancelled by [`ChaosMonkey::stop`].
    pub fn disable_temporarily(self: &Arc<Self>, duration: Duration) {
        let was_enabled = {
            let mut config = self.lock_config();
            let was = config.enabled;
            config.enabled = false;
            was
        };
        info!("chaos monkey {} disabled for {duration:?}", self.name);
        let monkey = self.clone();
        let handle = tokio::spawn(async move {
            sleep(duration).await;
            monkey.lock_config().enabled = was_enabled;
            info!("chaos monkey {} re-enabled after pause", monkey.name);
        });
        self.lock_timers().push(handle);
    }

    /// Shields one service from chaos, permanently unless a duration is
    /// given. Expiry lifts the exclusion only; re-registration is up to the
    /// caller.
    pub async fn exclude_service(self: &Arc<Self>, name: &str, duration: Option<Duration>) {
        self.lock_config().excluded_services.insert(name.to_string());
        self.services.write().await.remove(name);
        match duration {
            Some(window) => {
                info!("service {name} excluded from chaos for {window:?}");
                let monkey = self.clone();
                let name = name.to_string();
                let handle = tokio::spawn(async move {
                    sleep(window).await;
                    monkey.lock_config().excluded_services.remove(&name);
                    info!("service {name} removed from the chaos exclusion list");
                });
                self.lock_timers().push(handle);
            }
            None => info!("service {name} permanently excluded from chaos"),
        }
    }

    pub async fn statistics(&self) -> MonkeyStatistics {
        let registered = self.services.read().await.len();
        let config = self.lock_config().clone();
        let stats = {
            let stats = self.lock_stats();
            (
                stats.attempted,
                stats.successful,
                stats.blocked,
                stats.last_termination_ms,
            )
        };
        let mut excluded: Vec<String> = config.excluded_services.iter().cloned().collect();
        excluded.sort();
        let recent: Vec<TerminationRecord> = {
            let history = self.lock_history();
            history.iter().rev().take(10).rev().cloned().collect()
        };
        MonkeyStatistics {
            name: self.name.clone(),
            enabled: config.enabled,
            running: self.running.load(Ordering::SeqCst),
            termination_probability: config.termination_probability,
            check_interval_seconds: config.check_interval.as_secs(),
            min_healthy_instances: config.min_healthy_instances,
            max_instances_to_kill: config.max_instances_to_kill,
            excluded_services: excluded,
            registered_services: registered,
            attempted_terminations: stats.0,
            successful_terminations: stats.1,
            blocked_terminations: stats.2,
            last_termination_ms: stats.3,
            inside_window: self.is_chaos_time(),
            recent_terminations: recent,
        }
    }

    pub fn termination_history(&self, hours: u64) -> Vec<TerminationRecord> {
        let cutoff = hours_ago_ms(hours);
        self.lock_history()
            .iter()
            .filter(|r| r.timestamp_ms >= cutoff)
            .cloned()
            .collect()
    }

    /// One scheduler pass: schedule gate, probability roll, then a single
    /// termination attempt against one eligible service.
    async fn tick(&self) {
        if !self.is_chaos_time() {
            debug!("outside the chaos window");
            return;
        }
        let probability = self.lock_config().termination_probability;
        if !self.rng.roll(probability) {
            debug!("probability roll spared the fleet");
            return;
        }
        let Some(target) = self.select_target().await else {
            debug!("no eligible chaos targets");
            return;
        };
        let Some(service) = self.services.read().await.get(&target).cloned() else {
            return;
        };
        if let Some(instance) = self.try_terminate(&target, &service).await {
            self.record_termination(&target, &instance);
        }
    }

    fn is_chaos_time(&self) -> bool {
        let config = self.lock_config();
        if !config.enabled {
            return false;
        }
        let now = Local::now();
        if !config.allowed_days.contains(&now.weekday()) {
            return false;
        }
        let hour = now.hour();
        config.allowed_hours.0 <= hour && hour < config.allowed_hours.1
    }

    /// Uniform pick among registered, non-excluded services with strictly
    /// more healthy instances than the monkey floor.
    async fn select_target(&self) -> Option<String> {
        let (min_healthy, excluded) = {
            let config = self.lock_config();
            (config.min_healthy_instances, config.excluded_services.clone())
        };
        let candidates: Vec<(String, Arc<Service>)> = self
            .services
            .read()
            .await
            .iter()
            .filter(|(name, _)| !excluded.contains(*name))
            .map(|(name, service)| (name.clone(), service.clone()))
            .collect();

        let mut eligible = Vec::new();
        for (name, service) in candidates {
            if service.healthy_count().await > min_healthy {
                eligible.push(name);
            }
        }
        eligible.sort();
        self.rng.pick(&eligible).cloned()
    }

    async fn try_terminate(&self, service_name: &str, service: &Arc<Service>) -> Option<String> {
        let terminated = service.chaos_terminate_random_instance().await;
        let mut stats = self.lock_stats();
        stats.attempted += 1;
        match terminated {
            Some(instance) => {
                stats.successful += 1;
                drop(stats);
                warn!(
                    "chaos monkey {} terminated {service_name}/{instance}",
                    self.name
                );
                Some(instance)
            }
            None => {
                stats.blocked += 1;
                drop(stats);
                info!("termination blocked for {service_name} by the healthy floor");
                None
            }
        }
    }

    fn record_termination(&self, service: &str, instance: &str) {
        let record = TerminationRecord {
            timestamp_ms: epoch_ms(),
            service: service.to_string(),
            instance: instance.to_string(),
            monkey: self.name.clone(),
        };
        {
            let mut history = self.lock_history();
            if history.len() == MAX_TERMINATION_HISTORY {
                history.pop_front();
            }
            history.push_back(record);
        }
        self.lock_stats().last_termination_ms = Some(epoch_ms());
        for callback in self.callbacks.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            callback(service, instance);
        }
    }

    fn lock_config(&self) -> std::sync::MutexGuard<'_, MonkeyConfig> {
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, MonkeyCounters> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, VecDeque<TerminationRecord>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_timers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }
}
