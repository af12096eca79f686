use crate::Error;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CircuitBreakerMetrics {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejected: u64,
    pub times_opened: u64,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    metrics: CircuitBreakerMetrics,
}

/// Trips after `failure_threshold` consecutive failures, rejects calls while
/// open, probes again after `recovery_timeout` and closes once
/// `success_threshold` probe calls succeed in a row. Any half-open failure
/// re-opens immediately.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    success_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
    pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 3;
    pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(name: impl Into<String>) -> Self {
        Self::with_thresholds(
            name,
            Self::DEFAULT_FAILURE_THRESHOLD,
            Self::DEFAULT_SUCCESS_THRESHOLD,
            Self::DEFAULT_RECOVERY_TIMEOUT,
        )
    }

    pub fn with_thresholds(
        name: impl Into<String>,
        failure_threshold: u32,
        success_threshold: u32,
        recovery_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            success_threshold,
            recovery_timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
                metrics: CircuitBreakerMetrics::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        self.lock().metrics
    }

    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, Error<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.check_state()?;
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(Error::Inner(e))
            }
        }
    }

    /// Rejects with `CircuitOpen` while open, moving to half-open once the
    /// recovery timeout has elapsed.
    pub(crate) fn check_state<E>(&self) -> Result<(), Error<E>> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => {
                inner.metrics.calls += 1;
                Ok(())
            }
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(self.recovery_timeout);
                if elapsed >= self.recovery_timeout {
                    info!("circuit '{}' half-open, probing", self.name);
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.metrics.calls += 1;
                    Ok(())
                } else {
                    inner.metrics.rejected += 1;
                    Err(Error::CircuitOpen {
                        name: self.name.clone(),
                        retry_in: self.recovery_timeout - elapsed,
                    })
                }
            }
        }
    }

    pub(crate) fn record_success(&self) {
        let mut inner = self.lock();
        inner.metrics.successes += 1;
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.success_threshold {
                    info!("circuit '{}' closed", self.name);
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub(crate) fn record_failure(&self) {
        let mut inner = self.lock();
        inner.metrics.failures += 1;
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    warn!(
                        "circuit '{}' opened after {} consecutive failures",
                        self.name, inner.consecutive_failures
                    );
                    Self::trip(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                warn!("circuit '{}' re-opened by half-open failure", self.name);
                Self::trip(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    fn trip(inner: &mut Inner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.half_open_successes = 0;
        inner.metrics.times_opened += 1;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
