use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use crate::balancer::Strategy;
use crate::error::Error;
use crate::monkey::MonkeyConfig;
use crate::runner::RunnerConfig;
use crate::service::{ScalingPolicy, ServiceKind};
use chrono::Weekday;
use tracing::*;

/// Everything the simulator needs to build a fleet and police its chaos:
/// the services to simulate, the monkey's schedule and safety targets, the
/// runner's safety rails and the monitoring cadence. Loaded from JSON with
/// every field defaulted, so a spec file only states what it changes.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct FleetSpec {
    /// Master switch for scheduled chaos
    pub enabled: bool,
    pub schedule: Schedule,
    pub targets: Targets,
    pub experiments: Experiments,
    pub monitoring: MonitoringSection,
    pub safety: Safety,
    /// Service name to its shape; BTreeMap so startup order is stable
    pub services: BTreeMap<String, ServiceSpec>,
    pub load_balancer: BalancerSection,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Schedule {
    /// Weekday names, full or three-letter
    pub days: Vec<String>,
    pub hours: Hours,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            days: ["monday", "tuesday", "wednesday", "thursday", "friday"]
                .map(String::from)
                .to_vec(),
            hours: Hours::default(),
        }
    }
}

/// Half-open local-time window `[start, end)`.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Hours {
    pub start: u32,
    pub end: u32,
}

impl Default for Hours {
    fn default() -> Self {
        Self { start: 9, end: 17 }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Targets {
    pub min_healthy_instances: usize,
    pub max_instances_to_kill: usize,
    pub excluded_services: Vec<String>,
}

impl Default for Targets {
    fn default() -> Self {
        Self {
            min_healthy_instances: 1,
            max_instances_to_kill: 1,
            excluded_services: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Experiments {
    pub instance_termination: TerminationKnobs,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TerminationKnobs {
    pub enabled: bool,
    pub probability: f64,
    pub check_interval_seconds: u64,
}

impl Default for TerminationKnobs {
    fn default() -> Self {
        Self {
            enabled: true,
            probability: 0.3,
            check_interval_seconds: 30,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringSection {
    pub collection_interval_seconds: u64,
    /// Overrides for the stock alert rules, keyed by metric name
    pub alert_thresholds: HashMap<String, f64>,
}

impl Default for MonitoringSection {
    fn default() -> Self {
        Self {
            collection_interval_seconds: 10,
            alert_thresholds: HashMap::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Safety {
    pub enabled: bool,
    pub dry_run_mode: bool,
    pub require_confirmation_for_destructive: bool,
    pub max_concurrent_experiments: usize,
}

impl Default for Safety {
    fn default() -> Self {
        Self {
            enabled: true,
            dry_run_mode: false,
            require_confirmation_for_destructive: true,
            max_concurrent_experiments: 3,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceSpec {
    #[serde(rename = "type")]
    pub kind: ServiceKind,
    pub initial_instances: usize,
    pub min_instances: usize,
    pub max_instances: usize,
    pub auto_scaling: bool,
    pub region: String,
}

impl Default for ServiceSpec {
    fn default() -> Self {
        Self {
            kind: ServiceKind::ApiGateway,
            initial_instances: 3,
            min_instances: 1,
            max_instances: 10,
            auto_scaling: true,
            region: "us-east-1".to_string(),
        }
    }
}

impl ServiceSpec {
    pub fn scaling_policy(&self) -> ScalingPolicy {
        ScalingPolicy {
            initial_instances: self.initial_instances,
            min_instances: self.min_instances,
            max_instances: self.max_instances,
            auto_scaling: self.auto_scaling,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BalancerSection {
    pub strategy: Strategy,
}

impl Default for BalancerSection {
    fn default() -> Self {
        Self {
            strategy: Strategy::RoundRobin,
        }
    }
}

pub static DEV: Lazy<FleetSpec> = Lazy::new(|| {
    let mut services = BTreeMap::new();
    services.insert(
        "api-service".to_string(),
        ServiceSpec {
            kind: ServiceKind::ApiGateway,
            initial_instances: 5,
            min_instances: 2,
            max_instances: 10,
            auto_scaling: true,
            region: "us-east-1".to_string(),
        },
    );
    services.insert(
        "auth-service".to_string(),
        ServiceSpec {
            kind: ServiceKind::Auth,
            initial_instances: 4,
            min_instances: 2,
            max_instances: 8,
            auto_scaling: true,
            region: "us-west-2".to_string(),
        },
    );
    services.insert(
        "db-service".to_string(),
        ServiceSpec {
            kind: ServiceKind::Database,
            initial_instances: 3,
            min_instances: 2,
            max_instances: 6,
            auto_scaling: false,
            region: "eu-west-1".to_string(),
        },
    );
    services.insert(
        "cache-service".to_string(),
        ServiceSpec {
            kind: ServiceKind::Cache,
            initial_instances: 4,
            min_instances: 1,
            max_instances: 8,
            auto_scaling: true,
            region: "ap-southeast-1".to_string(),
        },
    );
    FleetSpec {
        enabled: true,
        schedule: Schedule::default(),
        targets: Targets::default(),
        experiments: Experiments::default(),
        monitoring: MonitoringSection::default(),
        safety: Safety::default(),
        services,
        load_balancer: BalancerSection::default(),
    }
});

impl Default for FleetSpec {
    fn default() -> Self {
        DEV.clone()
    }
}

impl FleetSpec {
    /// Rejects shapes that would otherwise surface as confusing behavior
    /// deep inside the simulator.
    pub fn validate(&self) -> Result<(), Error> {
        if self.services.is_empty() {
            return Err(Error::InvalidFleetSpec("no services defined".to_string()));
        }
        for (name, spec) in &self.services {
            if spec.initial_instances == 0 {
                return Err(Error::InvalidFleetSpec(format!(
                    "service {name} has zero initial instances"
                )));
            }
            if spec.min_instances > spec.max_instances {
                return Err(Error::InvalidFleetSpec(format!(
                    "service {name} has min_instances above max_instances"
                )));
            }
            if spec.initial_instances > spec.max_instances {
                return Err(Error::InvalidFleetSpec(format!(
                    "service {name} starts above its max_instances"
                )));
            }
        }
        let hours = self.schedule.hours;
        if hours.start >= hours.end || hours.end > 24 {
            return Err(Error::InvalidFleetSpec(
                "schedule hours must satisfy start < end <= 24".to_string(),
            ));
        }
        let probability = self.experiments.instance_termination.probability;
        if !(0.0..=1.0).contains(&probability) {
            return Err(Error::InvalidFleetSpec(
                "termination probability must be within [0, 1]".to_string(),
            ));
        }
        if self.safety.max_concurrent_experiments == 0 {
            return Err(Error::InvalidFleetSpec(
                "max_concurrent_experiments must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Monkey knobs derived from the spec. Unrecognized weekday names are
    /// logged and skipped rather than failing the whole spec.
    pub fn monkey_config(&self) -> MonkeyConfig {
        let mut allowed_days = HashSet::new();
        for day in &self.schedule.days {
            match day.parse::<Weekday>() {
                Ok(weekday) => {
                    allowed_days.insert(weekday);
                }
                Err(_) => warn!("ignoring unknown weekday {day:?} in schedule"),
            }
        }
        let knobs = &self.experiments.instance_termination;
        MonkeyConfig {
            enabled: self.enabled && knobs.enabled,
            termination_probability: knobs.probability,
            check_interval: Duration::from_secs(knobs.check_interval_seconds),
            min_healthy_instances: self.targets.min_healthy_instances,
            max_instances_to_kill: self.targets.max_instances_to_kill,
            excluded_services: self.targets.excluded_services.iter().cloned().collect(),
            allowed_days,
            allowed_hours: (self.schedule.hours.start, self.schedule.hours.end),
        }
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            safety_checks_enabled: self.safety.enabled,
            dry_run_mode: self.safety.dry_run_mode,
            require_confirmation_for_destructive: self.safety.require_confirmation_for_destructive,
            max_concurrent_experiments: self.safety.max_concurrent_experiments,
        }
    }

    pub fn collection_interval(&self) -> Duration {
        Duration::from_secs(self.monitoring.collection_interval_seconds)
    }
}

pub fn fleet_value_parser(s: &str) -> eyre::Result<FleetSpec, eyre::Error> {
    let spec: FleetSpec = match s {
        "dev" => DEV.clone(),
        _ => {
            let raw = std::fs::read_to_string(PathBuf::from(s))?;
            serde_json::from_str(&raw)?
        }
    };
    spec.validate()?;
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn dev_spec_is_valid_and_covers_the_stock_fleet() {
        DEV.validate().unwrap();
        assert_eq!(DEV.services.len(), 4);
        assert_eq!(DEV.services["api-service"].initial_instances, 5);
        assert_eq!(DEV.services["db-service"].kind, ServiceKind::Database);

        let monkey = DEV.monkey_config();
        assert!(monkey.enabled);
        assert_eq!(monkey.allowed_days.len(), 5);
        assert!(!monkey.allowed_days.contains(&Weekday::Sat));
        assert_eq!(monkey.allowed_hours, (9, 17));
        assert_eq!(monkey.check_interval, Duration::from_secs(30));

        let runner = DEV.runner_config();
        assert!(runner.safety_checks_enabled);
        assert_eq!(runner.max_concurrent_experiments, 3);
    }

    #[test]
    fn partial_fleet_file_fills_in_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "services": {{
                    "solo-db": {{
                        "type": "database",
                        "initial_instances": 2,
                        "min_instances": 1,
                        "max_instances": 4,
                        "region": "eu-west-1"
                    }}
                }},
                "safety": {{ "dry_run_mode": true }}
            }}"#
        )
        .unwrap();

        let spec = fleet_value_parser(file.path().to_str().unwrap()).unwrap();
        assert_eq!(spec.services.len(), 1);
        let solo = &spec.services["solo-db"];
        assert_eq!(solo.kind, ServiceKind::Database);
        assert_eq!(solo.scaling_policy().max_instances, 4);
        assert!(solo.auto_scaling);
        assert!(spec.safety.dry_run_mode);
        assert!(spec.safety.require_confirmation_for_destructive);
        assert_eq!(spec.monitoring.collection_interval_seconds, 10);
    }

    #[test]
    fn unknown_weekdays_are_skipped_not_fatal() {
        let mut spec = DEV.clone();
        spec.schedule.days = vec!["monday".to_string(), "someday".to_string()];
        let monkey = spec.monkey_config();
        assert_eq!(monkey.allowed_days.len(), 1);
        assert!(monkey.allowed_days.contains(&Weekday::Mon));
    }

    #[test]
    fn bad_shapes_are_rejected() {
        let mut spec = DEV.clone();
        spec.services.clear();
        assert!(spec.validate().is_err());

        let mut spec = DEV.clone();
        spec.services.get_mut("api-service").unwrap().min_instances = 99;
        assert!(spec.validate().is_err());

        let mut spec = DEV.clone();
        spec.schedule.hours = Hours { start: 17, end: 9 };
        assert!(spec.validate().is_err());

        let mut spec = DEV.clone();
        spec.experiments.instance_termination.probability = 1.5;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn dev_literal_and_missing_files_behave() {
        let spec = fleet_value_parser("dev").unwrap();
        assert_eq!(spec.services.len(), 4);
        assert!(fleet_value_parser("/no/such/fleet.json").is_err());
    }
}
