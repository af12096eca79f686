use crate::util::{epoch_ms, hours_ago_ms};
use async_trait::async_trait;
use eyre::Result;
use serde_derive::Serialize;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strum::{Display, EnumString};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::*;

pub const DEFAULT_COLLECTION_INTERVAL: Duration = Duration::from_secs(10);

const MAX_POINTS_PER_SERIES: usize = 1000;
const MAX_ALERT_HISTORY: usize = 1000;

/// Anything the monitoring system can poll. The component's name is fixed at
/// registration, not owned by the source.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn snapshot(&self) -> Result<HashMap<String, f64>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, EnumString, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    GreaterThan,
    LessThan,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertRule {
    pub name: String,
    pub metric: String,
    pub comparison: Comparison,
    pub threshold: f64,
    pub severity: Severity,
    pub message: String,
}

impl AlertRule {
    pub fn new(
        name: &str,
        metric: &str,
        comparison: Comparison,
        threshold: f64,
        severity: Severity,
        message: &str,
    ) -> Self {
        Self {
            name: name.into(),
            metric: metric.into(),
            comparison,
            threshold,
            severity,
            message: message.into(),
        }
    }

    fn fires_on(&self, value: f64) -> bool {
        match self.comparison {
            Comparison::GreaterThan => value > self.threshold,
            Comparison::LessThan => value < self.threshold,
        }
    }
}

fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule::new(
            "high_response_time",
            "response_time_ms",
            Comparison::GreaterThan,
            1000.0,
            Severity::High,
            "response time above 1000ms",
        ),
        AlertRule::new(
            "high_error_rate",
            "error_rate",
            Comparison::GreaterThan,
            5.0,
            Severity::Critical,
            "error rate above 5%",
        ),
        AlertRule::new(
            "low_availability",
            "availability",
            Comparison::LessThan,
            90.0,
            Severity::High,
            "availability below 90%",
        ),
        AlertRule::new(
            "high_cpu",
            "cpu_usage",
            Comparison::GreaterThan,
            85.0,
            Severity::Medium,
            "cpu usage above 85%",
        ),
        AlertRule::new(
            "high_memory",
            "memory_usage",
            Comparison::GreaterThan,
            85.0,
            Severity::Medium,
            "memory usage above 85%",
        ),
    ]
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: u64,
    pub service: String,
    pub instance: String,
    pub rule: String,
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub severity: Severity,
    pub message: String,
    pub raised_at_ms: u64,
    pub resolved: bool,
    pub resolved_at_ms: Option<u64>,
}

/// Dedup identity: (service, instance-or-"service", rule name).
type AlertKey = (String, String, String);

type AlertCallback = Box<dyn Fn(&Alert) + Send + Sync>;

/// Evaluates rules against incoming metrics, keeping at most one open alert
/// per identity and resolving it when the metric crosses back.
pub struct AlertManager {
    rules: Mutex<Vec<AlertRule>>,
    open: Mutex<HashMap<AlertKey, Alert>>,
    history: Mutex<VecDeque<Alert>>,
    callbacks: Mutex<Vec<AlertCallback>>,
    next_id: AtomicU64,
}

impl AlertManager {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(default_rules()),
            open: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            callbacks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add_alert_rule(&self, rule: AlertRule) {
        self.lock_rules().push(rule);
    }

    /// Replaces the threshold of the default rule watching `metric`.
    pub fn set_threshold(&self, metric: &str, threshold: f64) {
        for rule in self.lock_rules().iter_mut() {
            if rule.metric == metric {
                rule.threshold = threshold;
            }
        }
    }

    pub fn on_alert(&self, callback: impl Fn(&Alert) + Send + Sync + 'static) {
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(callback));
    }

    /// Runs every rule registered for `metric`; opens on breach, resolves on
    /// crossing back. Re-raising an open identity is a no-op.
    pub fn check_metric(&self, metric: &str, value: f64, service: &str, instance: Option<&str>) {
        let rules: Vec<AlertRule> = self
            .lock_rules()
            .iter()
            .filter(|r| r.metric == metric)
            .cloned()
            .collect();
        let subject = instance.unwrap_or("service");

        for rule in rules {
            let key = (service.to_string(), subject.to_string(), rule.name.clone());
            if rule.fires_on(value) {
                self.open_alert(key, &rule, value);
            } else {
                self.resolve_alert(&key);
            }
        }
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.lock_open().values().cloned().collect();
        alerts.sort_by_key(|a| a.id);
        alerts
    }

    pub fn open_count(&self) -> usize {
        self.lock_open().len()
    }

    /// Open and resolved alerts raised within the window.
    pub fn alert_history(&self, hours: u64) -> Vec<Alert> {
        let cutoff = hours_ago_ms(hours);
        self.lock_history()
            .iter()
            .filter(|a| a.raised_at_ms >= cutoff)
            .cloned()
            .collect()
    }

    fn open_alert(&self, key: AlertKey, rule: &AlertRule, value: f64) {
        let alert = {
            let mut open = self.lock_open();
            if open.contains_key(&key) {
                return;
            }
            let alert = Alert {
                id: self.next_id.fetch_add(1, Ordering::SeqCst),
                service: key.0.clone(),
                instance: key.1.clone(),
                rule: rule.name.clone(),
                metric: rule.metric.clone(),
                value,
                threshold: rule.threshold,
                severity: rule.severity,
                message: rule.message.clone(),
                raised_at_ms: epoch_ms(),
                resolved: false,
                resolved_at_ms: None,
            };
            open.insert(key, alert.clone());
            alert
        };

        warn!(
            "alert [{}] {} on {}/{}: {} = {:.1} (threshold {:.1})",
            alert.severity, alert.rule, alert.service, alert.instance, alert.metric, alert.value,
            alert.threshold
        );
        {
            let mut history = self.lock_history();
            if history.len() == MAX_ALERT_HISTORY {
                history.pop_front();
            }
            history.push_back(alert.clone());
        }
        for callback in self.callbacks.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            callback(&alert);
        }
    }

    fn resolve_alert(&self, key: &AlertKey) {
        let Some(mut alert) = self.lock_open().remove(key) else {
            return;
        };
        alert.resolved = true;
        alert.resolved_at_ms = Some(epoch_ms());
        info!(
            "resolved alert {} on {}/{}",
            alert.rule, alert.service, alert.instance
        );
        let mut history = self.lock_history();
        if let Some(entry) = history.iter_mut().rev().find(|a| a.id == alert.id) {
            *entry = alert;
        }
    }

    fn lock_rules(&self) -> std::sync::MutexGuard<'_, Vec<AlertRule>> {
        self.rules.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_open(&self) -> std::sync::MutexGuard<'_, HashMap<AlertKey, Alert>> {
        self.open.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, VecDeque<Alert>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricPoint {
    pub timestamp_ms: u64,
    pub value: f64,
    pub component: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

/// Polls registered sources on an interval, stores bounded time series keyed
/// `"{component}.{metric}"` and feeds every reading to the alert manager.
pub struct Monitoring {
    interval: Duration,
    components: RwLock<HashMap<String, Arc<dyn MetricsSource>>>,
    series: Mutex<HashMap<String, VecDeque<MetricPoint>>>,
    alerts: AlertManager,
    running: AtomicBool,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Monitoring {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            components: RwLock::new(HashMap::new()),
            series: Mutex::new(HashMap::new()),
            alerts: AlertManager::new(),
            running: AtomicBool::new(false),
            loop_handle: Mutex::new(None),
        }
    }

    pub fn alerts(&self) -> &AlertManager {
        &self.alerts
    }

    pub async fn register_component(&self, name: impl Into<String>, source: Arc<dyn MetricsSource>) {
        let name = name.into();
        info!("monitoring registered component {name}");
        self.components.write().await.insert(name, source);
    }

    pub async fn unregister_component(&self, name: &str) -> bool {
        self.components.write().await.remove(name).is_some()
    }

    pub async fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let monitoring = self.clone();
        let handle = tokio::spawn(async move {
            debug!("monitoring poll loop started");
            while monitoring.running.load(Ordering::SeqCst) {
                sleep(monitoring.interval).await;
                if !monitoring.running.load(Ordering::SeqCst) {
                    break;
                }
                monitoring.poll_once().await;
            }
            debug!("monitoring poll loop stopped");
        });
        *self.loop_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.loop_handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }

    /// One collection pass. A failing source is logged and skipped, never
    /// aborting the cycle for the others.
    pub async fn poll_once(&self) {
        let components: Vec<(String, Arc<dyn MetricsSource>)> = self
            .components
            .read()
            .await
            .iter()
            .map(|(name, source)| (name.clone(), source.clone()))
            .collect();

        for (name, source) in components {
            let snapshot = match source.snapshot().await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("metrics pull from {name} failed: {e}");
                    continue;
                }
            };
            for (metric, value) in snapshot {
                self.record_metric(&format!("{name}.{metric}"), value, &name);
                self.alerts.check_metric(&metric, value, &name, None);
            }
        }
    }

    pub fn record_metric(&self, key: &str, value: f64, component: &str) {
        let mut series = self.lock_series();
        let points = series.entry(key.to_string()).or_default();
        if points.len() == MAX_POINTS_PER_SERIES {
            points.pop_front();
        }
        points.push_back(MetricPoint {
            timestamp_ms: epoch_ms(),
            value,
            component: component.to_string(),
        });
    }

    pub fn metric_series(&self, key: &str, window: Duration) -> Vec<MetricPoint> {
        let cutoff = epoch_ms().saturating_sub(window.as_millis() as u64);
        self.lock_series()
            .get(key)
            .map(|points| {
                points
                    .iter()
                    .filter(|p| p.timestamp_ms >= cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn latest(&self, key: &str) -> Option<f64> {
        self.lock_series()
            .get(key)
            .and_then(|points| points.back())
            .map(|p| p.value)
    }

    /// Per-service status bucketed by latest availability: >= 90 healthy,
    /// >= 50 degraded, below that critical.
    pub async fn health_report(&self) -> HashMap<String, HealthStatus> {
        let names: Vec<String> = self.components.read().await.keys().cloned().collect();
        let mut report = HashMap::new();
        for name in names {
            let Some(availability) = self.latest(&format!("{name}.availability")) else {
                continue;
            };
            let status = if availability >= 90.0 {
                HealthStatus::Healthy
            } else if availability >= 50.0 {
                HealthStatus::Degraded
            } else {
                HealthStatus::Critical
            };
            report.insert(name, status);
        }
        report
    }

    pub async fn dashboard(&self) -> serde_json::Value {
        let components = self.components.read().await.len();
        let mut per_component: HashMap<String, HashMap<String, f64>> = HashMap::new();
        {
            let series = self.lock_series();
            for (key, points) in series.iter() {
                let Some((component, metric)) = key.split_once('.') else {
                    continue;
                };
                let Some(point) = points.back() else { continue };
                per_component
                    .entry(component.to_string())
                    .or_default()
                    .insert(metric.to_string(), point.value);
            }
        }
        json!({
            "timestamp_ms": epoch_ms(),
            "system_overview": {
                "components": components,
                "open_alerts": self.alerts.open_count(),
                "metrics_tracked": self.lock_series().len(),
            },
            "components": per_component,
            "active_alerts": self.alerts.active_alerts(),
        })
    }

    /// Everything the collector knows, JSON-serializable.
    pub fn export_metrics(&self) -> serde_json::Value {
        let series = self.lock_series();
        let metrics: HashMap<&String, Vec<&MetricPoint>> = series
            .iter()
            .map(|(key, points)| (key, points.iter().collect()))
            .collect();
        json!({
            "exported_at_ms": epoch_ms(),
            "metrics": metrics,
            "alerts": self.alerts.alert_history(24),
        })
    }

    fn lock_series(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<MetricPoint>>> {
        self.series.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct StaticSource {
        values: Mutex<HashMap<String, f64>>,
    }

    impl StaticSource {
        fn new(pairs: &[(&str, f64)]) -> Arc<Self> {
            Arc::new(Self {
                values: Mutex::new(
                    pairs
                        .iter()
                        .map(|(k, v)| (k.to_string(), *v))
                        .collect(),
                ),
            })
        }

        fn set(&self, metric: &str, value: f64) {
            self.values.lock().unwrap().insert(metric.to_string(), value);
        }
    }

    #[async_trait]
    impl MetricsSource for StaticSource {
        async fn snapshot(&self) -> Result<HashMap<String, f64>> {
            Ok(self.values.lock().unwrap().clone())
        }
    }

    struct BrokenSource;

    #[async_trait]
    impl MetricsSource for BrokenSource {
        async fn snapshot(&self) -> Result<HashMap<String, f64>> {
            eyre::bail!("collector unplugged")
        }
    }

    #[tokio::test]
    async fn slow_service_opens_then_resolves_a_high_alert() {
        let monitoring = Monitoring::new(DEFAULT_COLLECTION_INTERVAL);
        let source = StaticSource::new(&[("response_time_ms", 1500.0)]);
        monitoring.register_component("api-service", source.clone()).await;

        monitoring.poll_once().await;
        let active = monitoring.alerts().active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].severity, Severity::High);
        assert_eq!(active[0].service, "api-service");
        assert_eq!(active[0].rule, "high_response_time");

        source.set("response_time_ms", 200.0);
        monitoring.poll_once().await;
        assert_eq!(monitoring.alerts().open_count(), 0);
        let history = monitoring.alerts().alert_history(1);
        assert_eq!(history.len(), 1);
        assert!(history[0].resolved);
        assert!(history[0].resolved_at_ms.is_some());
    }

    #[tokio::test]
    async fn open_alert_identity_deduplicates() {
        let monitoring = Monitoring::new(DEFAULT_COLLECTION_INTERVAL);
        let source = StaticSource::new(&[("error_rate", 12.0)]);
        monitoring.register_component("auth-service", source.clone()).await;

        monitoring.poll_once().await;
        monitoring.poll_once().await;
        monitoring.poll_once().await;
        assert_eq!(monitoring.alerts().open_count(), 1);

        // resolve, then a fresh breach opens a new alert instance
        source.set("error_rate", 0.5);
        monitoring.poll_once().await;
        source.set("error_rate", 20.0);
        monitoring.poll_once().await;

        let history = monitoring.alerts().alert_history(1);
        assert_eq!(history.len(), 2);
        assert_ne!(history[0].id, history[1].id);
        assert!(history[0].resolved);
        assert!(!history[1].resolved);
    }

    #[tokio::test]
    async fn callbacks_fire_once_per_opened_alert() {
        let monitoring = Monitoring::new(DEFAULT_COLLECTION_INTERVAL);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        monitoring.alerts().on_alert(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let source = StaticSource::new(&[("cpu_usage", 99.0)]);
        monitoring.register_component("db-service", source).await;

        monitoring.poll_once().await;
        monitoring.poll_once().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn health_report_buckets_by_availability() {
        let monitoring = Monitoring::new(DEFAULT_COLLECTION_INTERVAL);
        monitoring
            .register_component("good", StaticSource::new(&[("availability", 97.0)]))
            .await;
        monitoring
            .register_component("wobbly", StaticSource::new(&[("availability", 70.0)]))
            .await;
        monitoring
            .register_component("down", StaticSource::new(&[("availability", 20.0)]))
            .await;

        monitoring.poll_once().await;
        let report = monitoring.health_report().await;
        assert_eq!(report["good"], HealthStatus::Healthy);
        assert_eq!(report["wobbly"], HealthStatus::Degraded);
        assert_eq!(report["down"], HealthStatus::Critical);
    }

    #[tokio::test]
    async fn one_broken_source_does_not_stop_the_sweep() {
        let monitoring = Monitoring::new(DEFAULT_COLLECTION_INTERVAL);
        monitoring.register_component("broken", Arc::new(BrokenSource)).await;
        monitoring
            .register_component("fine", StaticSource::new(&[("availability", 99.0)]))
            .await;

        monitoring.poll_once().await;
        assert!(monitoring.latest("fine.availability").is_some());
        assert!(monitoring.latest("broken.availability").is_none());
    }

    #[tokio::test]
    async fn series_stay_bounded() {
        let monitoring = Monitoring::new(DEFAULT_COLLECTION_INTERVAL);
        for i in 0..(MAX_POINTS_PER_SERIES + 50) {
            monitoring.record_metric("x.y", i as f64, "x");
        }
        let series = monitoring.metric_series("x.y", Duration::from_secs(3600));
        assert_eq!(series.len(), MAX_POINTS_PER_SERIES);
        assert_eq!(series.last().map(|p| p.value), Some((MAX_POINTS_PER_SERIES + 49) as f64));
    }

    #[tokio::test]
    async fn dashboard_and_export_carry_the_latest_readings() {
        let monitoring = Monitoring::new(DEFAULT_COLLECTION_INTERVAL);
        let source = StaticSource::new(&[("availability", 45.0), ("error_rate", 8.0)]);
        monitoring.register_component("cache-service", source).await;
        monitoring.poll_once().await;

        let dashboard = monitoring.dashboard().await;
        assert_eq!(dashboard["system_overview"]["components"], 1);
        assert_eq!(dashboard["components"]["cache-service"]["availability"], 45.0);
        assert!(dashboard["system_overview"]["open_alerts"].as_u64().unwrap() >= 2);

        let export = monitoring.export_metrics();
        assert!(export["metrics"]
            .as_object()
            .unwrap()
            .contains_key("cache-service.availability"));
        assert!(!export["alerts"].as_array().unwrap().is_empty());
    }
}
