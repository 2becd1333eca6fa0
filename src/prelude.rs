//! Convenient re-exports for wiring an engine and protecting calls.
pub use crate::{
    config::{EngineConfig, FailMode},
    engine::{CallContext, ResilienceEngine},
    error::{Classify, ErrorKind, ResilienceError},
    layer::PolicyLayer,
    policy::{
        BulkheadConfig, CircuitBreakerConfig, Policy, RateLimitAlgorithm, RateLimitConfig,
        RetryConfig, TimeoutConfig,
    },
    presets,
    repository::PolicyRepository,
    store::{InMemoryKvStore, KvStore},
    telemetry::{LogSink, MemorySink, TelemetrySink},
};
