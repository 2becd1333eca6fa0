#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Resilience Policy
//!
//! Named, versioned resilience policies stored in a shared key-value store and enforced around
//! any async unit of work: circuit breakers, retries with backoff and jitter, per-attempt
//! timeouts, sliding-window rate limits and bulkheads.
//!
//! ## Features
//!
//! - **Policy repository** with a TTL cache and a cancellable change stream
//! - **Circuit breakers** with bounded half-open probing
//! - **Retry coordinator** driven by an explicit retryability table
//! - **Rate limiters** counting in a shared store, degrading to local counters when it is down
//! - **Bulkheads** with a bounded FIFO queue
//! - **Hot reload** without resetting breaker or limiter state
//! - **Telemetry** as `tower::Service` sinks, plus a tower [`layer::PolicyLayer`]
//!
//! ## Quick Start
//!
//! ```rust
//! use resilience_policy::{CallContext, CircuitBreakerConfig, Policy, ResilienceEngine, ResilienceError};
//! use resilience_policy::repository::PolicyRepository;
//! use resilience_policy::store::InMemoryKvStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = ResilienceEngine::builder()
//!         .store(Arc::new(InMemoryKvStore::new()))
//!         .build()
//!         .unwrap();
//!     let breaker = CircuitBreakerConfig::new(1, 1, Duration::from_secs(30), 1).unwrap();
//!     engine
//!         .repository()
//!         .save(Policy::builder("payments").circuit_breaker(breaker).build().unwrap())
//!         .await
//!         .unwrap();
//!
//!     let ctx = CallContext::new();
//!     let failed = engine
//!         .execute(&ctx, "payments", || async {
//!             Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "declined"))
//!         })
//!         .await;
//!     assert!(matches!(failed, Err(ResilienceError::Inner(_))));
//!
//!     // One failure reached the threshold; the next call is rejected without running.
//!     let rejected = engine.execute(&ctx, "payments", || async { Ok::<_, std::io::Error>(()) }).await;
//!     assert!(rejected.unwrap_err().is_circuit_open());
//! }
//! ```

pub mod backoff;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod dynamic;
pub mod engine;
pub mod error;
pub mod jitter;
pub mod layer;
pub mod policy;
pub mod prelude;
pub mod presets;
pub mod rate_limit;
pub mod registry;
pub mod repository;
pub mod retry;
pub mod sleeper;
pub mod store;
pub mod telemetry;
pub mod timeout;

// Re-exports
pub use bulkhead::{Bulkhead, BulkheadPermit, BulkheadRejection};
pub use circuit_breaker::{CircuitBreaker, CircuitPermit, CircuitSnapshot, CircuitState, CircuitTransition};
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use config::{CacheConfig, EngineConfig, FailMode};
pub use engine::{CallContext, EngineBuilder, ResilienceEngine};
pub use error::{Classify, ErrorKind, ResilienceError, RetryTable};
pub use layer::{PolicyLayer, PolicyService};
pub use policy::{
    BulkheadConfig, CircuitBreakerConfig, CodecError, ConfigError, Policy, PolicyBuilder,
    RateLimitAlgorithm, RateLimitConfig, RetryConfig, TimeoutConfig,
};
pub use rate_limit::{CounterMode, Decision, RateLimiter};
pub use repository::{PolicyEvent, PolicyEventKind, PolicyRepository, RepositoryError};
pub use retry::{RetryAttempt, RetryCoordinator};
pub use store::{InMemoryKvStore, KvStore, StoreError};
pub use timeout::TimeoutPolicy;
