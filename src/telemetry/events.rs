use crate::circuit_breaker::{CircuitState, CircuitTransition};
use crate::error::ErrorKind;
use crate::rate_limit::CounterMode;
use serde_json::json;
use std::fmt;
use std::time::Duration;

/// Event emitted while executing a call under a policy.
///
/// Wrapped in a [`TelemetryEvent`] that names the policy and the caller's correlation id.
#[derive(Debug, Clone, PartialEq)]
pub enum ResilienceEvent {
    CircuitBreaker(CircuitBreakerEvent),
    RateLimit(RateLimitEvent),
    Bulkhead(BulkheadEvent),
    Retry(RetryEvent),
    Timeout(TimeoutEvent),
    /// Final outcome of an `execute` call.
    Request(RequestOutcome),
}

/// Events emitted by circuit breakers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerEvent {
    /// Circuit transitioned to open state.
    Opened {
        /// Consecutive failures that triggered the open.
        failure_count: u32,
        from: CircuitState,
    },
    /// Probes are being admitted.
    HalfOpen,
    /// Normal operation resumed.
    Closed,
    /// An operator forced the breaker closed.
    Reset { from: CircuitState },
    /// A call was turned away without reaching the dependency.
    Rejected { failure_count: u32, retry_after: Duration },
}

impl From<CircuitTransition> for CircuitBreakerEvent {
    fn from(t: CircuitTransition) -> Self {
        match t {
            CircuitTransition::Opened { failure_count, from } => {
                CircuitBreakerEvent::Opened { failure_count, from }
            }
            CircuitTransition::HalfOpened => CircuitBreakerEvent::HalfOpen,
            CircuitTransition::Closed => CircuitBreakerEvent::Closed,
            CircuitTransition::Reset { from } => CircuitBreakerEvent::Reset { from },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitEvent {
    Rejected { retry_after: Duration },
    /// The limiter switched between shared and local counters.
    ModeChanged { mode: CounterMode },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkheadEvent {
    /// A permit was granted.
    Acquired { in_flight: usize, max: usize },
    /// The permit was granted after queueing; `depth` is the queue depth at hand-off.
    Queued { waited: Duration, depth: usize },
    /// Every permit and queue slot was taken.
    Rejected { in_flight: usize, max: usize, queued: usize },
    QueueTimeout { waited: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryEvent {
    /// A retry attempt is about to be made.
    Attempt {
        /// The attempt number (1-indexed)
        attempt: u32,
        delay: Duration,
        cause: ErrorKind,
    },
    /// All attempts failed.
    Exhausted { attempts: u32, total_duration: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutEvent {
    /// An attempt exceeded its timeout.
    Occurred { timeout: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Success { duration: Duration },
    Failure { duration: Duration, kind: ErrorKind },
}

/// A [`ResilienceEvent`] tagged with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEvent {
    pub policy: String,
    pub correlation_id: String,
    pub event: ResilienceEvent,
}

impl TelemetryEvent {
    pub fn new(
        policy: impl Into<String>,
        correlation_id: impl Into<String>,
        event: impl Into<ResilienceEvent>,
    ) -> Self {
        Self { policy: policy.into(), correlation_id: correlation_id.into(), event: event.into() }
    }

    /// Flat JSON object: `policy`, `correlation_id`, `kind` and the event's own fields.
    pub fn to_json(&self) -> serde_json::Value {
        let mut value = event_to_json(&self.event);
        if let Some(obj) = value.as_object_mut() {
            obj.insert("policy".into(), json!(self.policy));
            obj.insert("correlation_id".into(), json!(self.correlation_id));
        }
        value
    }
}

macro_rules! into_event {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for ResilienceEvent {
            fn from(e: $ty) -> Self {
                ResilienceEvent::$variant(e)
            }
        })*
    };
}

into_event! {
    CircuitBreakerEvent => CircuitBreaker,
    RateLimitEvent => RateLimit,
    BulkheadEvent => Bulkhead,
    RetryEvent => Retry,
    TimeoutEvent => Timeout,
    RequestOutcome => Request,
}

impl fmt::Display for TelemetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {}] {}", self.policy, self.correlation_id, self.event)
    }
}

impl fmt::Display for ResilienceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResilienceEvent::CircuitBreaker(event) => write!(f, "CircuitBreaker::{}", event),
            ResilienceEvent::RateLimit(event) => write!(f, "RateLimit::{}", event),
            ResilienceEvent::Bulkhead(event) => write!(f, "Bulkhead::{}", event),
            ResilienceEvent::Retry(event) => write!(f, "Retry::{}", event),
            ResilienceEvent::Timeout(event) => write!(f, "Timeout::{}", event),
            ResilienceEvent::Request(event) => write!(f, "Request::{}", event),
        }
    }
}

impl fmt::Display for CircuitBreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerEvent::Opened { failure_count, from } => {
                write!(f, "Opened(failures={}, from={})", failure_count, from)
            }
            CircuitBreakerEvent::HalfOpen => write!(f, "HalfOpen"),
            CircuitBreakerEvent::Closed => write!(f, "Closed"),
            CircuitBreakerEvent::Reset { from } => write!(f, "Reset(from={})", from),
            CircuitBreakerEvent::Rejected { failure_count, retry_after } => {
                write!(f, "Rejected(failures={}, retry_after={:?})", failure_count, retry_after)
            }
        }
    }
}

impl fmt::Display for RateLimitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitEvent::Rejected { retry_after } => {
                write!(f, "Rejected(retry_after={:?})", retry_after)
            }
            RateLimitEvent::ModeChanged { mode } => write!(f, "ModeChanged({})", mode),
        }
    }
}

impl fmt::Display for BulkheadEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BulkheadEvent::Acquired { in_flight, max } => write!(f, "Acquired({}/{})", in_flight, max),
            BulkheadEvent::Queued { waited, depth } => {
                write!(f, "Queued(waited={:?}, depth={})", waited, depth)
            }
            BulkheadEvent::Rejected { in_flight, max, queued } => {
                write!(f, "Rejected({}/{}, queued={})", in_flight, max, queued)
            }
            BulkheadEvent::QueueTimeout { waited } => write!(f, "QueueTimeout(waited={:?})", waited),
        }
    }
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryEvent::Attempt { attempt, delay, cause } => {
                write!(f, "Attempt(#{}, delay={:?}, cause={})", attempt, delay, cause)
            }
            RetryEvent::Exhausted { attempts, total_duration } => {
                write!(f, "Exhausted(attempts={}, duration={:?})", attempts, total_duration)
            }
        }
    }
}

impl fmt::Display for TimeoutEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutEvent::Occurred { timeout } => write!(f, "Occurred(timeout={:?})", timeout),
        }
    }
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOutcome::Success { duration } => write!(f, "Success(duration={:?})", duration),
            RequestOutcome::Failure { duration, kind } => {
                write!(f, "Failure(duration={:?}, kind={})", duration, kind)
            }
        }
    }
}

#[inline]
fn millis(d: &Duration) -> u64 {
    d.as_millis().min(u128::from(u64::MAX)) as u64
}

/// Convert an event into a JSON value for sinks.
pub fn event_to_json(event: &ResilienceEvent) -> serde_json::Value {
    match event {
        ResilienceEvent::CircuitBreaker(c) => match c {
            CircuitBreakerEvent::Opened { failure_count, from } => json!({
                "kind": "circuit_opened",
                "failures": *failure_count,
                "from": from.as_str(),
            }),
            CircuitBreakerEvent::HalfOpen => json!({ "kind": "circuit_half_open" }),
            CircuitBreakerEvent::Closed => json!({ "kind": "circuit_closed" }),
            CircuitBreakerEvent::Reset { from } => {
                json!({ "kind": "circuit_reset", "from": from.as_str() })
            }
            CircuitBreakerEvent::Rejected { failure_count, retry_after } => json!({
                "kind": "circuit_rejected",
                "failures": *failure_count,
                "retry_after_ms": millis(retry_after),
            }),
        },
        ResilienceEvent::RateLimit(r) => match r {
            RateLimitEvent::Rejected { retry_after } => json!({
                "kind": "rate_limited",
                "retry_after_ms": millis(retry_after),
            }),
            RateLimitEvent::ModeChanged { mode } => {
                json!({ "kind": "rate_limit_mode", "mode": mode.as_str() })
            }
        },
        ResilienceEvent::Bulkhead(b) => match b {
            BulkheadEvent::Acquired { in_flight, max } => json!({
                "kind": "bulkhead_acquired",
                "active": *in_flight,
                "max": *max,
            }),
            BulkheadEvent::Queued { waited, depth } => json!({
                "kind": "bulkhead_queued",
                "waited_ms": millis(waited),
                "depth": *depth,
            }),
            BulkheadEvent::Rejected { in_flight, max, queued } => json!({
                "kind": "bulkhead_rejected",
                "active": *in_flight,
                "max": *max,
                "queued": *queued,
            }),
            BulkheadEvent::QueueTimeout { waited } => json!({
                "kind": "bulkhead_queue_timeout",
                "waited_ms": millis(waited),
            }),
        },
        ResilienceEvent::Retry(r) => match r {
            RetryEvent::Attempt { attempt, delay, cause } => json!({
                "kind": "retry_attempt",
                "attempt": *attempt,
                "delay_ms": millis(delay),
                "cause": cause.as_str(),
            }),
            RetryEvent::Exhausted { attempts, total_duration } => json!({
                "kind": "retry_exhausted",
                "attempts": *attempts,
                "duration_ms": millis(total_duration),
            }),
        },
        ResilienceEvent::Timeout(TimeoutEvent::Occurred { timeout }) => json!({
            "kind": "timeout",
            "timeout_ms": millis(timeout),
        }),
        ResilienceEvent::Request(r) => match r {
            RequestOutcome::Success { duration } => json!({
                "kind": "request_success",
                "duration_ms": millis(duration),
            }),
            RequestOutcome::Failure { duration, kind } => json!({
                "kind": "request_failure",
                "duration_ms": millis(duration),
                "error": kind.as_str(),
            }),
        },
    }
}
