//! Error types for policy execution and the closed set of error kinds.
//!
//! Callers classify their own failures through [`Classify`]; the retry coordinator only ever
//! asks the [`RetryTable`] whether a kind is worth another attempt.

use crate::policy::{CodecError, ConfigError};
use std::fmt;
use std::time::Duration;

/// Closed enumeration of everything that can go wrong around a protected call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A policy or engine setting violates its invariants.
    InvalidConfig,
    /// No policy is stored under the requested name.
    PolicyNotFound,
    /// A stored payload could not be parsed.
    Decode,
    /// The breaker rejected the call without invoking the dependency.
    CircuitOpen,
    /// The rate limiter rejected the call.
    RateLimited,
    /// All bulkhead permits are held and the wait queue is full.
    BulkheadFull,
    /// The call waited in the bulkhead queue for longer than allowed.
    QueueTimeout,
    /// The caller cancelled the call.
    Cancelled,
    /// A single attempt exceeded its timeout.
    Timeout,
    /// Every attempt allowed by the retry config failed.
    RetryExhausted,
    /// The policy store could not be reached.
    BackingStoreUnavailable,
    /// The dependency failed in a way that may succeed on another attempt.
    Transient,
    /// The dependency failed in a way that will not change on another attempt.
    Permanent,
}

impl ErrorKind {
    const fn bit(self) -> u16 {
        1 << (self as u16)
    }

    /// Admission-control rejections: expected, returned directly, never retried internally.
    pub fn is_admission(self) -> bool {
        matches!(
            self,
            ErrorKind::CircuitOpen
                | ErrorKind::RateLimited
                | ErrorKind::BulkheadFull
                | ErrorKind::QueueTimeout
        )
    }

    /// Operator-facing configuration failures.
    pub fn is_configuration(self) -> bool {
        matches!(self, ErrorKind::InvalidConfig | ErrorKind::Decode)
    }

    /// Stable snake_case name used in logs and telemetry.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::PolicyNotFound => "policy_not_found",
            ErrorKind::Decode => "decode",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::BulkheadFull => "bulkhead_full",
            ErrorKind::QueueTimeout => "queue_timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RetryExhausted => "retry_exhausted",
            ErrorKind::BackingStoreUnavailable => "backing_store_unavailable",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability table answering "is this kind worth another attempt".
///
/// Admission rejections, cancellation, configuration errors and exhaustion can never be
/// enabled; [`RetryTable::allow`] ignores them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryTable {
    mask: u16,
}

impl RetryTable {
    /// Table that retries nothing.
    pub const fn none() -> Self {
        Self { mask: 0 }
    }

    fn can_enable(kind: ErrorKind) -> bool {
        matches!(
            kind,
            ErrorKind::Transient
                | ErrorKind::Timeout
                | ErrorKind::Permanent
                | ErrorKind::BackingStoreUnavailable
        )
    }

    /// Mark `kind` retryable.
    pub fn allow(mut self, kind: ErrorKind) -> Self {
        if Self::can_enable(kind) {
            self.mask |= kind.bit();
        }
        self
    }

    /// Mark `kind` non-retryable.
    pub fn deny(mut self, kind: ErrorKind) -> Self {
        self.mask &= !kind.bit();
        self
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.mask & kind.bit() != 0
    }
}

impl Default for RetryTable {
    /// Retries transient dependency failures and per-attempt timeouts.
    fn default() -> Self {
        Self::none().allow(ErrorKind::Transient).allow(ErrorKind::Timeout)
    }
}

/// Maps a caller's error onto [`ErrorKind::Transient`] or [`ErrorKind::Permanent`]
/// (or any other kind the caller considers accurate).
pub trait Classify {
    fn classify(&self) -> ErrorKind;
}

impl Classify for std::io::Error {
    fn classify(&self) -> ErrorKind {
        use std::io::ErrorKind as Io;
        match self.kind() {
            Io::TimedOut => ErrorKind::Timeout,
            Io::ConnectionRefused
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::BrokenPipe
            | Io::Interrupted
            | Io::WouldBlock
            | Io::UnexpectedEof => ErrorKind::Transient,
            _ => ErrorKind::Permanent,
        }
    }
}

impl Classify for tower::BoxError {
    fn classify(&self) -> ErrorKind {
        if let Some(io) = self.downcast_ref::<std::io::Error>() {
            io.classify()
        } else if self.is::<tower::timeout::error::Elapsed>() {
            ErrorKind::Timeout
        } else {
            ErrorKind::Permanent
        }
    }
}

/// Unified error returned by [`crate::ResilienceEngine::execute`].
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// The circuit breaker is open (or its half-open probe budget is spent).
    CircuitOpen { policy: String, failure_count: u32, retry_after: Duration },
    /// The rate limiter rejected the call.
    RateLimited { retry_after: Duration },
    /// All permits are held and the wait queue is full.
    BulkheadFull { in_flight: usize, max: usize, queued: usize },
    /// Waited in the bulkhead queue for `waited` without being admitted.
    QueueTimeout { waited: Duration },
    /// The caller's cancellation token fired.
    Cancelled,
    /// A single attempt exceeded its timeout.
    Timeout { elapsed: Duration, timeout: Duration },
    /// All retry attempts failed; `last_error` is the final attempt's failure.
    RetryExhausted { attempts: u32, last_error: Box<ResilienceError<E>> },
    /// No policy is stored under `name`.
    PolicyNotFound { name: String },
    /// The policy store could not be reached.
    BackingStoreUnavailable { reason: String },
    /// A policy or setting violates its invariants.
    InvalidConfig(ConfigError),
    /// A stored policy payload is malformed.
    Decode(CodecError),
    /// The protected operation failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen { policy, failure_count, retry_after } => write!(
                f,
                "circuit breaker for policy '{}' is open ({} failures, retry after {:?})",
                policy, failure_count, retry_after
            ),
            Self::RateLimited { retry_after } => {
                write!(f, "rate limited (retry after {:?})", retry_after)
            }
            Self::BulkheadFull { in_flight, max, queued } => write!(
                f,
                "bulkhead full ({} in-flight, max {}, {} queued)",
                in_flight, max, queued
            ),
            Self::QueueTimeout { waited } => {
                write!(f, "timed out after {:?} waiting for a bulkhead permit", waited)
            }
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Timeout { elapsed, timeout } => {
                write!(f, "operation timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::RetryExhausted { attempts, last_error } => {
                write!(f, "retry exhausted after {} attempts; last error: {}", attempts, last_error)
            }
            Self::PolicyNotFound { name } => write!(f, "policy '{}' not found", name),
            Self::BackingStoreUnavailable { reason } => {
                write!(f, "policy store unavailable: {}", reason)
            }
            Self::InvalidConfig(e) => write!(f, "{}", e),
            Self::Decode(e) => write!(f, "{}", e),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { last_error, .. } => Some(last_error.as_ref()),
            Self::InvalidConfig(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> ResilienceError<E> {
    /// Retry hint for rejections that carry one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } | Self::RateLimited { retry_after } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_bulkhead_full(&self) -> bool {
        matches!(self, Self::BulkheadFull { .. })
    }

    pub fn is_queue_timeout(&self) -> bool {
        matches!(self, Self::QueueTimeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    /// Number of attempts recorded by a `RetryExhausted` error.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::RetryExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the caller's error, looking through retry exhaustion.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { last_error, .. } => last_error.as_inner(),
            _ => None,
        }
    }

    /// Convert the caller's error type, keeping every engine variant as-is.
    pub fn map_inner<F, O>(self, f: F) -> ResilienceError<O>
    where
        F: FnOnce(E) -> O,
    {
        match self {
            Self::CircuitOpen { policy, failure_count, retry_after } => {
                ResilienceError::CircuitOpen { policy, failure_count, retry_after }
            }
            Self::RateLimited { retry_after } => ResilienceError::RateLimited { retry_after },
            Self::BulkheadFull { in_flight, max, queued } => {
                ResilienceError::BulkheadFull { in_flight, max, queued }
            }
            Self::QueueTimeout { waited } => ResilienceError::QueueTimeout { waited },
            Self::Cancelled => ResilienceError::Cancelled,
            Self::Timeout { elapsed, timeout } => ResilienceError::Timeout { elapsed, timeout },
            Self::RetryExhausted { attempts, last_error } => ResilienceError::RetryExhausted {
                attempts,
                last_error: Box::new(last_error.map_inner(f)),
            },
            Self::PolicyNotFound { name } => ResilienceError::PolicyNotFound { name },
            Self::BackingStoreUnavailable { reason } => {
                ResilienceError::BackingStoreUnavailable { reason }
            }
            Self::InvalidConfig(e) => ResilienceError::InvalidConfig(e),
            Self::Decode(e) => ResilienceError::Decode(e),
            Self::Inner(e) => ResilienceError::Inner(f(e)),
        }
    }
}

impl<E: Classify> ResilienceError<E> {
    /// Kind of this error; `Inner` defers to the caller's classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::BulkheadFull { .. } => ErrorKind::BulkheadFull,
            Self::QueueTimeout { .. } => ErrorKind::QueueTimeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            Self::PolicyNotFound { .. } => ErrorKind::PolicyNotFound,
            Self::BackingStoreUnavailable { .. } => ErrorKind::BackingStoreUnavailable,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::Decode(e) => e.kind(),
            Self::Inner(e) => e.classify(),
        }
    }
}

impl<E> From<ConfigError> for ResilienceError<E> {
    fn from(e: ConfigError) -> Self {
        ResilienceError::InvalidConfig(e)
    }
}

impl<E> From<CodecError> for ResilienceError<E> {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Invalid(cfg) => ResilienceError::InvalidConfig(cfg),
            other => ResilienceError::Decode(other),
        }
    }
}
