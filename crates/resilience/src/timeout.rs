use crate::Error;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tracing::*;

#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutMetrics {
    pub completed: u64,
    pub timed_out: u64,
}

/// Hard wall-clock bound on a single call.
pub struct Timeout {
    duration: Duration,
    metrics: Mutex<TimeoutMetrics>,
}

impl Timeout {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            metrics: Mutex::new(TimeoutMetrics::default()),
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn metrics(&self) -> TimeoutMetrics {
        *self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, Error<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match tokio::time::timeout(self.duration, op()).await {
            Ok(result) => {
                self.note(|m| m.completed += 1);
                result.map_err(Error::Inner)
            }
            Err(_) => {
                self.note(|m| m.timed_out += 1);
                debug!("call exceeded {:?}", self.duration);
                Err(Error::Timeout(self.duration))
            }
        }
    }

    fn note(&self, update: impl FnOnce(&mut TimeoutMetrics)) {
        update(&mut self.metrics.lock().unwrap_or_else(|e| e.into_inner()));
    }
}
