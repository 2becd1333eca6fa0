//! Retry coordinator: bounded attempts with exponential, jittered backoff.
//!
//! Whether an error earns another attempt is decided once, by the [`RetryTable`], from the
//! error's [`ErrorKind`]. Admission rejections such as an open circuit are never retried.
//!
//! Example
//! ```rust
//! use resilience_policy::{ErrorKind, Classify, ResilienceError, RetryConfig, RetryCoordinator};
//! use resilience_policy::sleeper::InstantSleeper;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug)]
//! struct Unavailable;
//! impl Classify for Unavailable {
//!     fn classify(&self) -> ErrorKind { ErrorKind::Transient }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let cfg = RetryConfig::new(3, Duration::from_millis(10), Duration::from_secs(1), 2.0, 0.0).unwrap();
//! let retry = RetryCoordinator::new(&cfg).with_sleeper(Arc::new(InstantSleeper));
//! let result = retry
//!     .execute(&CancellationToken::new(), |attempt| async move {
//!         if attempt < 3 { Err(ResilienceError::Inner(Unavailable)) } else { Ok(attempt) }
//!     }, |_| {})
//!     .await;
//! assert_eq!(result.unwrap(), 3);
//! # }
//! ```

use crate::backoff::Backoff;
use crate::error::{Classify, ErrorKind, ResilienceError, RetryTable};
use crate::jitter::Jitter;
use crate::policy::RetryConfig;
use crate::sleeper::{Sleeper, TokioSleeper};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Details of a retry about to happen, handed to the caller's observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttempt {
    /// 1-based index of the attempt about to start.
    pub attempt: u32,
    /// Jittered delay slept before it.
    pub delay: Duration,
    /// Kind of the failure that triggered the retry.
    pub cause: ErrorKind,
}

/// Drives up to `max_attempts` attempts of an operation.
#[derive(Debug, Clone)]
pub struct RetryCoordinator {
    max_attempts: u32,
    backoff: Backoff,
    jitter: Jitter,
    table: RetryTable,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryCoordinator {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts(),
            backoff: Backoff::from_config(config),
            jitter: Jitter::percent(config.jitter_percent()),
            table: RetryTable::default(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Single attempt, no delays. Used when a policy has no retry config.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::new(Duration::ZERO, Duration::ZERO, 1.0),
            jitter: Jitter::None,
            table: RetryTable::none(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_table(mut self, table: RetryTable) -> Self {
        self.table = table;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Unjittered delay before `attempt` (1-based; zero for the first attempt).
    pub fn base_delay_before(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt.saturating_sub(1))
    }

    /// Jittered delay before `attempt`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        self.jitter.apply(self.base_delay_before(attempt))
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, runs out of
    /// attempts or `cancel` fires.
    ///
    /// `operation` receives the 1-based attempt number. `on_retry` is called before each
    /// inter-attempt sleep.
    ///
    /// # Errors
    /// - the operation's own error when its kind is not retryable;
    /// - `RetryExhausted` carrying the last error once `max_attempts` attempts failed;
    /// - `Cancelled` as soon as `cancel` fires, during an attempt or a sleep.
    pub async fn execute<T, E, Fut, Op, Obs>(
        &self,
        cancel: &CancellationToken,
        mut operation: Op,
        mut on_retry: Obs,
    ) -> Result<T, ResilienceError<E>>
    where
        E: Classify,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnMut(u32) -> Fut,
        Obs: FnMut(RetryAttempt),
    {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(ResilienceError::Cancelled);
            }
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ResilienceError::Cancelled),
                result = operation(attempt) => result,
            };
            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let cause = error.kind();
            if cause == ErrorKind::Cancelled || !self.table.is_retryable(cause) {
                return Err(error);
            }
            if attempt >= self.max_attempts {
                tracing::debug!(attempts = attempt, cause = %cause, "retry exhausted");
                return Err(ResilienceError::RetryExhausted {
                    attempts: attempt,
                    last_error: Box::new(error),
                });
            }

            attempt += 1;
            let delay = self.delay_before(attempt);
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, cause = %cause, "retrying");
            on_retry(RetryAttempt { attempt, delay, cause });
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ResilienceError::Cancelled),
                _ = self.sleeper.sleep(delay) => {}
            }
        }
    }
}
