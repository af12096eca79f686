use crate::rng::SimRng;
use crate::service::ServiceKind;
use crate::util::epoch_ms;
use serde_derive::Serialize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use strum::{Display, EnumString};
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::*;

/// Hard ceiling on injected error probability, so chaos can degrade a
/// service without flat-out bricking it.
pub const MAX_ERROR_PROBABILITY: f64 = 0.10;

const EMA_WEIGHT: f64 = 0.1;
const DEGRADE_PROBABILITY: f64 = 0.05;
const RECOVER_PROBABILITY: f64 = 0.30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Healthy,
    Degraded,
    Unhealthy,
    Terminated,
    Recovering,
}

#[derive(Error, Debug, Clone)]
pub enum ServiceError {
    #[error("instance {instance} of {service} is {state} and cannot serve requests")]
    InstanceUnavailable {
        service: String,
        instance: String,
        state: InstanceState,
    },
    #[error("simulated failure on {service}/{instance}")]
    RequestFailed { service: String, instance: String },
    #[error("no healthy instances available for {0}")]
    NoHealthyInstances(String),
    #[error("unknown service {0}")]
    UnknownService(String),
}

/// Successful response from a single instance.
#[derive(Debug, Clone, Serialize)]
pub struct RequestOutcome {
    pub instance: String,
    pub response_time_ms: f64,
}

/// Point-in-time view of one instance, JSON-serializable for status reports.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceDetail {
    pub id: String,
    pub state: InstanceState,
    pub region: String,
    pub port: u16,
    pub response_time_ms: f64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub uptime_seconds: u64,
    pub last_health_check_ms: Option<u64>,
    pub error_probability: f64,
    pub failure_count: u64,
}

struct Vitals {
    state: InstanceState,
    base_response_time_ms: f64,
    response_time_ms: f64,
    cpu_percent: f64,
    memory_percent: f64,
    error_probability: f64,
    failure_count: u64,
    started_at: Instant,
    last_health_check_ms: Option<u64>,
}

/// One simulated replica. All mutable state sits behind the instance's own
/// lock; the lock is never held across a simulated processing sleep.
pub struct Instance {
    service: String,
    id: String,
    port: u16,
    region: String,
    rng: SimRng,
    vitals: Mutex<Vitals>,
}

impl Instance {
    pub fn new(
        service: impl Into<String>,
        kind: ServiceKind,
        region: impl Into<String>,
        rng: SimRng,
    ) -> Self {
        let (low, high) = kind.base_latency_band_ms();
        let base = rng.range_f64(low, high);
        Self {
            service: service.into(),
            id: rng.short_id(),
            port: rng.range_u64(8000, 9000) as u16,
            region: region.into(),
            vitals: Mutex::new(Vitals {
                state: InstanceState::Healthy,
                base_response_time_ms: base,
                response_time_ms: base,
                cpu_percent: rng.range_f64(15.0, 25.0),
                memory_percent: rng.range_f64(20.0, 40.0),
                error_probability: 0.01,
                failure_count: 0,
                started_at: Instant::now(),
                last_health_check_ms: None,
            }),
            rng,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn state(&self) -> InstanceState {
        self.lock().state
    }

    /// Degraded instances still serve traffic, just slower and flakier.
    pub fn is_healthy(&self) -> bool {
        matches!(self.state(), InstanceState::Healthy | InstanceState::Degraded)
    }

    pub fn response_time_ms(&self) -> f64 {
        self.lock().response_time_ms
    }

    pub fn base_response_time_ms(&self) -> f64 {
        self.lock().base_response_time_ms
    }

    pub fn cpu_percent(&self) -> f64 {
        self.lock().cpu_percent
    }

    pub fn memory_percent(&self) -> f64 {
        self.lock().memory_percent
    }

    pub fn error_probability(&self) -> f64 {
        self.lock().error_probability
    }

    pub fn failure_count(&self) -> u64 {
        self.lock().failure_count
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.lock().started_at.elapsed().as_secs()
    }

    pub fn detail(&self) -> InstanceDetail {
        let vitals = self.lock();
        InstanceDetail {
            id: self.id.clone(),
            state: vitals.state,
            region: self.region.clone(),
            port: self.port,
            response_time_ms: vitals.response_time_ms,
            cpu_percent: vitals.cpu_percent,
            memory_percent: vitals.memory_percent,
            uptime_seconds: vitals.started_at.elapsed().as_secs(),
            last_health_check_ms: vitals.last_health_check_ms,
            error_probability: vitals.error_probability,
            failure_count: vitals.failure_count,
        }
    }

    /// Simulates serving one request: a state-scaled jittered delay, then
    /// either an injected failure or a success that refreshes the EMA
    /// response time and the synthetic CPU/memory readings.
    pub async fn handle_request(&self) -> Result<RequestOutcome, ServiceError> {
        let (delay_ms, fails) = {
            let vitals = self.lock();
            if matches!(vitals.state, InstanceState::Unhealthy | InstanceState::Terminated) {
                return Err(ServiceError::InstanceUnavailable {
                    service: self.service.clone(),
                    instance: self.id.clone(),
                    state: vitals.state,
                });
            }
            let multiplier = self.load_multiplier(vitals.state);
            let jitter = self.rng.range_f64(0.8, 1.2);
            let delay_ms = vitals.base_response_time_ms * multiplier * jitter;
            (delay_ms, self.rng.roll(vitals.error_probability))
        };

        sleep(Duration::from_secs_f64(delay_ms / 1000.0)).await;

        let mut vitals = self.lock();
        if fails {
            vitals.failure_count += 1;
            return Err(ServiceError::RequestFailed {
                service: self.service.clone(),
                instance: self.id.clone(),
            });
        }
        let multiplier = self.load_multiplier(vitals.state);
        vitals.response_time_ms = vitals.response_time_ms * (1.0 - EMA_WEIGHT) + delay_ms * EMA_WEIGHT;
        vitals.cpu_percent = (self.rng.range_f64(15.0, 25.0) * multiplier).min(100.0);
        vitals.memory_percent = (self.rng.range_f64(20.0, 40.0) * multiplier).min(100.0);
        Ok(RequestOutcome {
            instance: self.id.clone(),
            response_time_ms: delay_ms,
        })
    }

    /// One probe: healthy instances occasionally flap to Degraded, degraded
    /// ones sometimes recover. Returns whether the instance is fully healthy.
    pub fn health_check(&self) -> bool {
        let mut vitals = self.lock();
        vitals.last_health_check_ms = Some(epoch_ms());
        match vitals.state {
            InstanceState::Terminated | InstanceState::Unhealthy => false,
            InstanceState::Recovering => false,
            InstanceState::Healthy => {
                if self.rng.roll(DEGRADE_PROBABILITY) {
                    warn!("instance {}/{} degraded", self.service, self.id);
                    vitals.state = InstanceState::Degraded;
                    false
                } else {
                    true
                }
            }
            InstanceState::Degraded => {
                if self.rng.roll(RECOVER_PROBABILITY) {
                    info!("instance {}/{} recovered", self.service, self.id);
                    vitals.state = InstanceState::Healthy;
                }
                vitals.state == InstanceState::Healthy
            }
        }
    }

    /// Idempotent; a terminated instance serves nothing until restarted.
    pub fn terminate(&self) {
        let mut vitals = self.lock();
        if vitals.state != InstanceState::Terminated {
            info!("instance {}/{} terminated", self.service, self.id);
            vitals.state = InstanceState::Terminated;
        }
    }

    /// Terminated → Recovering → (startup delay) → Healthy. Returns false
    /// without touching state when the instance is not terminated.
    pub async fn restart(&self) -> bool {
        {
            let mut vitals = self.lock();
            if vitals.state != InstanceState::Terminated {
                return false;
            }
            vitals.state = InstanceState::Recovering;
            vitals.started_at = Instant::now();
        }
        info!("instance {}/{} restarting", self.service, self.id);
        let startup = self.rng.range_f64(1.0, 3.0);
        sleep(Duration::from_secs_f64(startup)).await;

        let mut vitals = self.lock();
        // terminated again mid-startup stays terminated
        if vitals.state == InstanceState::Recovering {
            vitals.state = InstanceState::Healthy;
            vitals.failure_count = 0;
            info!("instance {}/{} back online", self.service, self.id);
            true
        } else {
            false
        }
    }

    /// Adds to the base response time; experiments undo this by restoring
    /// the recorded base.
    pub fn introduce_latency(&self, extra_ms: f64) {
        let mut vitals = self.lock();
        vitals.base_response_time_ms = (vitals.base_response_time_ms + extra_ms).max(0.0);
        debug!(
            "instance {}/{} base latency now {:.0}ms",
            self.service, self.id, vitals.base_response_time_ms
        );
    }

    /// Raises the injected failure rate, clamped to [`MAX_ERROR_PROBABILITY`].
    pub fn introduce_errors(&self, rate: f64) {
        self.lock().error_probability = rate.clamp(0.0, MAX_ERROR_PROBABILITY);
    }

    pub(crate) fn set_base_response_time(&self, ms: f64) {
        self.lock().base_response_time_ms = ms;
    }

    /// Uncapped setter for partition-style experiments that isolate an
    /// instance outright.
    pub(crate) fn set_error_probability(&self, p: f64) {
        self.lock().error_probability = p.clamp(0.0, 1.0);
    }

    pub(crate) fn set_cpu_percent(&self, pct: f64) {
        self.lock().cpu_percent = pct.clamp(0.0, 100.0);
    }

    pub(crate) fn set_memory_percent(&self, pct: f64) {
        self.lock().memory_percent = pct.clamp(0.0, 100.0);
    }

    pub(crate) fn set_state(&self, state: InstanceState) {
        self.lock().state = state;
    }

    fn load_multiplier(&self, state: InstanceState) -> f64 {
        match state {
            InstanceState::Degraded => self.rng.range_f64(2.0, 4.0),
            InstanceState::Recovering => self.rng.range_f64(1.2, 2.0),
            _ => 1.0,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vitals> {
        self.vitals.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_instance() -> Instance {
        Instance::new("api-service", ServiceKind::ApiGateway, "us-east-1", SimRng::seeded(17))
    }

    #[tokio::test(start_paused = true)]
    async fn terminated_instance_serves_nothing() {
        let instance = test_instance();
        instance.terminate();

        assert_eq!(instance.state(), InstanceState::Terminated);
        assert!(!instance.health_check());
        let err = instance.handle_request().await.unwrap_err();
        assert!(matches!(err, ServiceError::InstanceUnavailable { .. }));

        // terminating again is a no-op
        instance.terminate();
        assert_eq!(instance.state(), InstanceState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_walks_through_recovering() {
        let instance = std::sync::Arc::new(test_instance());
        instance.terminate();

        let restarting = instance.clone();
        let handle = tokio::spawn(async move { restarting.restart().await });
        tokio::task::yield_now().await;
        assert_eq!(instance.state(), InstanceState::Recovering);

        assert!(handle.await.unwrap());
        assert_eq!(instance.state(), InstanceState::Healthy);
        assert_eq!(instance.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_requires_terminated() {
        let instance = test_instance();
        assert!(!instance.restart().await);
        assert_eq!(instance.state(), InstanceState::Healthy);
    }

    #[test]
    fn injected_error_rate_is_capped() {
        let instance = test_instance();
        instance.introduce_errors(0.9);
        assert_eq!(instance.error_probability(), MAX_ERROR_PROBABILITY);
        instance.introduce_errors(0.03);
        assert_eq!(instance.error_probability(), 0.03);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_request_updates_the_ema() {
        let instance = test_instance();
        instance.introduce_errors(0.0);

        let before = instance.response_time_ms();
        let outcome = instance.handle_request().await.unwrap();
        let expected = before * 0.9 + outcome.response_time_ms * 0.1;
        assert!((instance.response_time_ms() - expected).abs() < 1e-9);
    }

    #[test]
    fn health_check_flaps_and_recovers() {
        let instance = test_instance();

        let mut checks = 0;
        while instance.health_check() {
            checks += 1;
            assert!(checks < 1000, "instance never degraded");
        }
        assert_eq!(instance.state(), InstanceState::Degraded);

        let mut checks = 0;
        while !instance.health_check() {
            checks += 1;
            assert!(checks < 1000, "instance never recovered");
        }
        assert_eq!(instance.state(), InstanceState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn latency_injection_is_additive() {
        let instance = test_instance();
        let base = instance.base_response_time_ms();
        instance.introduce_latency(500.0);
        assert!((instance.base_response_time_ms() - base - 500.0).abs() < 1e-9);
    }
}
