use crate::Error;
use std::future::Future;
use std::sync::Mutex;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::*;

#[derive(Debug, Clone, Copy, Default)]
pub struct BulkheadMetrics {
    pub accepted: u64,
    pub rejected: u64,
}

/// Caps the number of calls in flight. A saturated bulkhead rejects
/// immediately instead of queueing.
pub struct Bulkhead {
    name: String,
    max_concurrent: usize,
    permits: Semaphore,
    metrics: Mutex<BulkheadMetrics>,
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, max_concurrent: usize) -> Self {
        Self {
            name: name.into(),
            max_concurrent,
            permits: Semaphore::new(max_concurrent),
            metrics: Mutex::new(BulkheadMetrics::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn metrics(&self) -> BulkheadMetrics {
        *self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, Error<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _permit = self.try_permit()?;
        op().await.map_err(Error::Inner)
    }

    pub(crate) fn try_permit<E>(&self) -> Result<SemaphorePermit<'_>, Error<E>> {
        let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        match self.permits.try_acquire() {
            Ok(permit) => {
                metrics.accepted += 1;
                Ok(permit)
            }
            Err(_) => {
                metrics.rejected += 1;
                debug!("bulkhead '{}' rejected a call at capacity", self.name);
                Err(Error::BulkheadFull(self.name.clone()))
            }
        }
    }
}
