mod bulkhead;
mod circuit_breaker;
mod composite;
mod fallback;
mod rate_limiter;
mod retry;
mod timeout;

use std::time::Duration;
use thiserror::Error;

pub use bulkhead::{Bulkhead, BulkheadMetrics};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerMetrics, CircuitState};
pub use composite::{Composite, CompositeBuilder};
pub use fallback::{Fallback, FallbackStrategy};
pub use rate_limiter::{RateLimiter, RateLimiterMetrics};
pub use retry::{RetryMetrics, RetryPolicy};
pub use timeout::{Timeout, TimeoutMetrics};

/// Failure modes shared by every pattern in this crate. `E` is the error
/// type of the wrapped call and only surfaces through `Inner` and
/// `RetriesExhausted`.
#[derive(Error, Debug)]
pub enum Error<E> {
    #[error("circuit '{name}' is open, retry in {retry_in:?}")]
    CircuitOpen { name: String, retry_in: Duration },
    #[error("bulkhead '{0}' is at capacity")]
    BulkheadFull(String),
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("all {attempts} attempts failed, last error: {last}")]
    RetriesExhausted { attempts: u32, last: E },
    #[error("{0}")]
    Inner(E),
}

impl<E> Error<E> {
    /// True for errors raised by a pattern itself rather than the wrapped call.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::CircuitOpen { .. } | Error::BulkheadFull(_) | Error::RateLimited
        )
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Error::Inner(e) | Error::RetriesExhausted { last: e, .. } => Some(e),
            _ => None,
        }
    }
}
