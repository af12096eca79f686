use crate::{Bulkhead, CircuitBreaker, Error, Fallback, RateLimiter, RetryPolicy, Timeout};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::*;

/// Stacks the individual patterns around one call in a fixed order:
/// rate limit, bulkhead, circuit breaker, timeout, retry, fallback.
/// Every layer is optional.
pub struct Composite {
    name: String,
    rate_limiter: Option<RateLimiter>,
    bulkhead: Option<Bulkhead>,
    circuit_breaker: Option<CircuitBreaker>,
    timeout: Option<Timeout>,
    retry: Option<RetryPolicy>,
}

pub struct CompositeBuilder {
    name: String,
    rate_limiter: Option<RateLimiter>,
    bulkhead: Option<Bulkhead>,
    circuit_breaker: Option<CircuitBreaker>,
    timeout: Option<Timeout>,
    retry: Option<RetryPolicy>,
}

impl CompositeBuilder {
    pub fn rate_limit(mut self, rate_per_second: f64) -> Self {
        self.rate_limiter = Some(RateLimiter::new(rate_per_second));
        self
    }

    pub fn bulkhead(mut self, max_concurrent: usize) -> Self {
        self.bulkhead = Some(Bulkhead::new(format!("{}-bulkhead", self.name), max_concurrent));
        self
    }

    pub fn circuit_breaker(
        mut self,
        failure_threshold: u32,
        success_threshold: u32,
        recovery_timeout: Duration,
    ) -> Self {
        self.circuit_breaker = Some(CircuitBreaker::with_thresholds(
            format!("{}-circuit", self.name),
            failure_threshold,
            success_threshold,
            recovery_timeout,
        ));
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(Timeout::new(duration));
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn build(self) -> Composite {
        Composite {
            name: self.name,
            rate_limiter: self.rate_limiter,
            bulkhead: self.bulkhead,
            circuit_breaker: self.circuit_breaker,
            timeout: self.timeout,
            retry: self.retry,
        }
    }
}

impl Composite {
    pub fn builder(name: impl Into<String>) -> CompositeBuilder {
        CompositeBuilder {
            name: name.into(),
            rate_limiter: None,
            bulkhead: None,
            circuit_breaker: None,
            timeout: None,
            retry: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }

    pub fn bulkhead(&self) -> Option<&Bulkhead> {
        self.bulkhead.as_ref()
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.circuit_breaker.as_ref()
    }

    pub fn timeout(&self) -> Option<&Timeout> {
        self.timeout.as_ref()
    }

    pub fn retry(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, Error<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        if let Some(limiter) = &self.rate_limiter {
            if !limiter.try_acquire() {
                return Err(Error::RateLimited);
            }
        }
        let _permit = match &self.bulkhead {
            Some(bulkhead) => Some(bulkhead.try_permit()?),
            None => None,
        };
        if let Some(breaker) = &self.circuit_breaker {
            breaker.check_state()?;
        }
        // rejections short-circuit above, so any failure here is a real one
        let result = self.attempt(&op).await;
        if let Some(breaker) = &self.circuit_breaker {
            match &result {
                Ok(_) => breaker.record_success(),
                Err(_) => breaker.record_failure(),
            }
        }
        result
    }

    /// Like [`Composite::call`], recovering through `fallback` after every
    /// other layer has given up.
    pub async fn call_with_fallback<F, Fut, T, E>(
        &self,
        op: F,
        fallback: &Fallback<T, Error<E>>,
    ) -> Result<T, Error<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        match self.call(op).await {
            Ok(value) => Ok(value),
            Err(e) => fallback.recover(e).await,
        }
    }

    /// Timeout and retry layers. Unlike a bare [`RetryPolicy`] the last
    /// failure is returned as-is so timeouts stay distinguishable.
    async fn attempt<F, Fut, T, E>(&self, op: &F) -> Result<T, Error<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let Some(retry) = &self.retry else {
            return self.bounded(op).await;
        };
        let mut attempt = 0;
        loop {
            attempt += 1;
            retry.note_attempt();
            match self.bounded(op).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= retry.max_attempts() => {
                    retry.note_exhausted();
                    warn!("'{}' giving up after {attempt} attempts: {e}", self.name);
                    return Err(e);
                }
                Err(e) => {
                    let delay = retry.delay_for(attempt);
                    debug!("'{}' attempt {attempt} failed ({e}), retrying in {delay:?}", self.name);
                    retry.note_retry();
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn bounded<F, Fut, T, E>(&self, op: &F) -> Result<T, Error<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match &self.timeout {
            Some(timeout) => timeout.call(op).await,
            None => op().await.map_err(Error::Inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FallbackStrategy;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn rate_limit_rejects_before_anything_else() {
        let composite = Composite::builder("api").rate_limit(0.5).bulkhead(10).build();

        assert!(composite.call(|| async { Ok::<_, &'static str>(()) }).await.is_ok());
        let rejected = composite
            .call(|| async { Ok::<_, &'static str>(()) })
            .await
            .unwrap_err();
        assert!(matches!(rejected, Error::RateLimited));
        assert_eq!(composite.bulkhead().unwrap().metrics().accepted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opens_and_rejects() {
        let composite = Composite::builder("api")
            .circuit_breaker(1, 1, Duration::from_secs(60))
            .build();

        let _ = composite.call(|| async { Err::<(), _>("boom") }).await;
        let rejected = composite
            .call(|| async { Ok::<_, &'static str>(()) })
            .await
            .unwrap_err();
        assert!(matches!(rejected, Error::CircuitOpen { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_wraps_timeout() {
        let composite = Composite::builder("api")
            .timeout(Duration::from_millis(50))
            .retry(RetryPolicy::new(2, Duration::from_millis(10), 2.0, Duration::from_secs(1)))
            .build();
        let calls = AtomicU32::new(0);

        let out = composite
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_secs(5)).await;
                Ok::<_, &'static str>(())
            })
            .await;

        assert!(matches!(out.unwrap_err(), Error::Timeout(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_is_the_last_layer() {
        let composite = Composite::builder("api")
            .timeout(Duration::from_millis(50))
            .build();
        let fallback = Fallback::new().with(
            FallbackStrategy::value("cached", 99).when(|e: &Error<&'static str>| {
                matches!(e, Error::Timeout(_))
            }),
        );

        let out = composite
            .call_with_fallback(
                || async {
                    sleep(Duration::from_secs(5)).await;
                    Ok::<_, &'static str>(1)
                },
                &fallback,
            )
            .await;

        assert_eq!(out.unwrap(), 99);
    }
}
