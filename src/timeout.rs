//! Per-attempt timeout

use crate::policy::TimeoutConfig;
use crate::ResilienceError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    config: TimeoutConfig,
}

impl TimeoutPolicy {
    pub fn new(config: TimeoutConfig) -> Self {
        Self { config }
    }

    /// Timeout for a call: the caller's request clamped to `max`, or the default.
    pub fn effective(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(d) if !d.is_zero() => d.min(self.config.max_timeout()),
            _ => self.config.default_timeout(),
        }
    }

    /// Run `attempt` under the effective timeout for `requested`.
    pub async fn run<T, E, Fut>(
        &self,
        requested: Option<Duration>,
        attempt: Fut,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        with_limit(self.effective(requested), attempt).await
    }
}

/// Run `attempt`, failing with `ResilienceError::Timeout` once `limit` elapses.
pub async fn with_limit<T, E, Fut>(limit: Duration, attempt: Fut) -> Result<T, ResilienceError<E>>
where
    Fut: Future<Output = Result<T, ResilienceError<E>>>,
{
    let start = Instant::now();
    match tokio::time::timeout(limit, attempt).await {
        Ok(result) => result,
        Err(_) => Err(ResilienceError::Timeout { elapsed: start.elapsed(), timeout: limit }),
    }
}
