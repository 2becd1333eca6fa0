//! Telemetry for policy execution.
//!
//! The engine reports what its gates did as [`TelemetryEvent`]s: the policy name, the caller's
//! correlation id and a [`ResilienceEvent`].
//!
//! # Event Types
//!
//! - **Circuit Breaker**: `Opened`, `HalfOpen`, `Closed`, `Reset`, `Rejected`
//! - **Rate Limit**: `Rejected`, `ModeChanged`
//! - **Bulkhead**: `Acquired`, `Queued`, `Rejected`, `QueueTimeout`
//! - **Retry**: `Attempt`, `Exhausted`
//! - **Timeout**: `Occurred`
//! - **Request**: `Success`, `Failure`
//!
//! # Telemetry Sinks
//!
//! The `TelemetrySink` trait defines how events are consumed. It's implemented
//! as a `tower::Service<TelemetryEvent>` for composability. Emission is best effort: a sink
//! error never fails the call being observed.

pub mod events;
pub mod sinks;

pub use events::{
    event_to_json, BulkheadEvent, CircuitBreakerEvent, RateLimitEvent, RequestOutcome,
    ResilienceEvent, RetryEvent, TelemetryEvent, TimeoutEvent,
};
pub use sinks::{emit_best_effort, LogSink, MemorySink, NullSink, StreamingSink, TelemetrySink};
