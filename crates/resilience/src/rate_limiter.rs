use crate::Error;
use std::future::Future;
use std::sync::Mutex;
use tokio::time::Instant;
use tracing::*;

#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimiterMetrics {
    pub allowed: u64,
    pub throttled: u64,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    metrics: RateLimiterMetrics,
}

/// Token bucket. Refills continuously at `rate` tokens per second up to
/// `capacity`; acquisition never blocks.
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Burst capacity defaults to twice the sustained rate.
    pub fn new(rate: f64) -> Self {
        Self::with_capacity(rate, rate * 2.0)
    }

    pub fn with_capacity(rate: f64, capacity: f64) -> Self {
        Self {
            rate,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
                metrics: RateLimiterMetrics::default(),
            }),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn available(&self) -> f64 {
        let mut bucket = self.lock();
        self.refill(&mut bucket);
        bucket.tokens
    }

    pub fn metrics(&self) -> RateLimiterMetrics {
        self.lock().metrics
    }

    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.lock();
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            bucket.metrics.allowed += 1;
            true
        } else {
            bucket.metrics.throttled += 1;
            trace!("rate limiter out of tokens");
            false
        }
    }

    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, Error<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.try_acquire() {
            return Err(Error::RateLimited);
        }
        op().await.map_err(Error::Inner)
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
        bucket.last_refill = now;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(|e| e.into_inner())
    }
}
