use crate::Error;
use futures::future::BoxFuture;
use std::fmt::Display;
use std::future::Future;
use tracing::*;

type Producer<T, E> = Box<dyn Fn() -> BoxFuture<'static, Result<T, E>> + Send + Sync>;
type Predicate<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;

/// One recovery option: a producer for the substitute value plus an optional
/// predicate deciding which failures it applies to.
pub struct FallbackStrategy<T, E> {
    name: String,
    applies: Option<Predicate<E>>,
    produce: Producer<T, E>,
}

impl<T, E> FallbackStrategy<T, E> {
    pub fn new<F, Fut>(name: impl Into<String>, produce: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            name: name.into(),
            applies: None,
            produce: Box::new(move || Box::pin(produce())),
        }
    }

    /// Strategy that always yields a fixed substitute value.
    pub fn value(name: impl Into<String>, value: T) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        Self::new(name, move || {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    /// Restricts this strategy to failures matching `predicate`.
    pub fn when<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.applies = Some(Box::new(predicate));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn applies_to(&self, error: &E) -> bool {
        self.applies.as_ref().map(|p| p(error)).unwrap_or(true)
    }
}

/// Ordered list of recovery options tried after the primary call fails.
pub struct Fallback<T, E> {
    strategies: Vec<FallbackStrategy<T, E>>,
}

impl<T, E> Fallback<T, E> {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    pub fn with(mut self, strategy: FallbackStrategy<T, E>) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

impl<T, E> Default for Fallback<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E: Display> Fallback<T, E> {
    pub async fn call<F, Fut>(&self, op: F) -> Result<T, Error<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match op().await {
            Ok(value) => Ok(value),
            Err(primary) => self.recover(primary).await.map_err(Error::Inner),
        }
    }

    /// First applicable strategy that succeeds wins; otherwise the original
    /// failure is returned untouched.
    pub(crate) async fn recover(&self, primary: E) -> Result<T, E> {
        for strategy in &self.strategies {
            if !strategy.applies_to(&primary) {
                continue;
            }
            match (strategy.produce)().await {
                Ok(value) => {
                    info!("fallback '{}' recovered the call", strategy.name);
                    return Ok(value);
                }
                Err(e) => debug!("fallback '{}' failed: {e}", strategy.name),
            }
        }
        Err(primary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn primary_success_skips_strategies() {
        let fallback: Fallback<i32, &'static str> =
            Fallback::new().with(FallbackStrategy::value("static", -1));

        let out = fallback.call(|| async { Ok(10) }).await;
        assert_eq!(out.unwrap(), 10);
    }

    #[tokio::test]
    async fn first_applicable_strategy_wins() {
        let fallback: Fallback<i32, &'static str> = Fallback::new()
            .with(FallbackStrategy::new("broken-cache", || async { Err("cache miss") }))
            .with(FallbackStrategy::value("static", 7));

        let out = fallback.call(|| async { Err("primary down") }).await;
        assert_eq!(out.unwrap(), 7);
    }

    #[tokio::test]
    async fn predicates_gate_strategies() {
        let fallback: Fallback<i32, &'static str> = Fallback::new()
            .with(FallbackStrategy::value("timeouts-only", 1).when(|e: &&str| e.contains("timeout")))
            .with(FallbackStrategy::value("catch-all", 2));

        let out = fallback.call(|| async { Err("connection refused") }).await;
        assert_eq!(out.unwrap(), 2);

        let out = fallback.call(|| async { Err("request timeout") }).await;
        assert_eq!(out.unwrap(), 1);
    }

    #[tokio::test]
    async fn original_error_survives_exhaustion() {
        let fallback: Fallback<i32, &'static str> = Fallback::new()
            .with(FallbackStrategy::new("also-down", || async { Err("secondary down") }));

        let out = fallback.call(|| async { Err("primary down") }).await;
        assert!(matches!(out.unwrap_err(), Error::Inner("primary down")));
    }
}
