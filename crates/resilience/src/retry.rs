use crate::Error;
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;
use tracing::*;

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryMetrics {
    pub attempts: u64,
    pub retries: u64,
    pub exhausted: u64,
}

/// Exponential backoff with jitter. Delays grow by `factor` per attempt,
/// capped at `max_delay`, each stretched or shrunk by up to `jitter`.
#[derive(Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    factor: f64,
    max_delay: Duration,
    jitter: f64,
    metrics: Mutex<RetryMetrics>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), 2.0, Duration::from_secs(60))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, factor: f64, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            factor,
            max_delay,
            jitter: 0.1,
            metrics: Mutex::new(RetryMetrics::default()),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn metrics(&self) -> RetryMetrics {
        *self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn call<F, Fut, T, E>(&self, mut op: F) -> Result<T, Error<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.note_attempt();
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_attempts => {
                    self.note_exhausted();
                    warn!("giving up after {attempt} attempts: {e}");
                    return Err(Error::RetriesExhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    debug!("attempt {attempt} failed ({e}), retrying in {delay:?}");
                    self.note_retry();
                    sleep(delay).await;
                }
            }
        }
    }

    /// Backoff before the attempt after `attempt` (1-based) failed.
    pub(crate) fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * self.factor.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((capped * (1.0 + spread)).max(0.0))
    }

    pub(crate) fn note_attempt(&self) {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner()).attempts += 1;
    }

    pub(crate) fn note_retry(&self) {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner()).retries += 1;
    }

    pub(crate) fn note_exhausted(&self) {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner()).exhausted += 1;
    }
}
