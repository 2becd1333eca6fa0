//! Production-ready policy presets.
//!
//! Each function returns a validated [`Policy`] for a common kind of dependency. Save it to a
//! repository as-is or adjust it first through [`Policy::into_builder`].
//!
//! ```rust
//! use resilience_policy::presets;
//!
//! let policy = presets::database_client("orders-db").unwrap();
//! assert!(policy.retry().is_none());
//! assert!(policy.circuit_breaker().is_some());
//! ```
//!
//! ## Available Presets
//!
//! - [`web_service`]: HTTP/gRPC services (retry, circuit breaker, bulkhead, timeout)
//! - [`database_client`]: Database connections (circuit breaker, bulkhead, timeout - NO retry)
//! - [`external_api`]: Third-party APIs (conservative retry, long timeouts, rate limit)
//! - [`cache_lookup`]: Cache reads (tight timeout only)
//! - [`object_storage`]: Blob stores (patient retry, long timeouts, bulkhead)

use crate::policy::{
    BulkheadConfig, CircuitBreakerConfig, ConfigError, Policy, RateLimitAlgorithm,
    RateLimitConfig, RetryConfig, TimeoutConfig,
};
use std::time::Duration;

const WEB_TIMEOUT: Duration = Duration::from_secs(5);
const WEB_MAX_TIMEOUT: Duration = Duration::from_secs(30);
const WEB_RETRY_ATTEMPTS: u32 = 3;
const WEB_BASE_DELAY: Duration = Duration::from_millis(100);
const WEB_MAX_DELAY: Duration = Duration::from_secs(2);
const WEB_FAILURE_THRESHOLD: u32 = 10;
const WEB_OPEN_TIMEOUT: Duration = Duration::from_secs(30);
const WEB_CONCURRENCY: usize = 100;
const WEB_QUEUE: usize = 50;

const DB_TIMEOUT: Duration = Duration::from_secs(10);
const DB_MAX_TIMEOUT: Duration = Duration::from_secs(60);
const DB_FAILURE_THRESHOLD: u32 = 5;
const DB_OPEN_TIMEOUT: Duration = Duration::from_secs(60);
const DB_CONCURRENCY: usize = 50;
const DB_QUEUE: usize = 100;

const API_TIMEOUT: Duration = Duration::from_secs(15);
const API_MAX_TIMEOUT: Duration = Duration::from_secs(60);
const API_RETRY_ATTEMPTS: u32 = 5;
const API_BASE_DELAY: Duration = Duration::from_millis(500); // longer backoff
const API_MAX_DELAY: Duration = Duration::from_secs(30);
const API_FAILURE_THRESHOLD: u32 = 15;
const API_OPEN_TIMEOUT: Duration = Duration::from_secs(120);
const API_CONCURRENCY: usize = 20;
const API_RATE_LIMIT: u32 = 600;

const CACHE_TIMEOUT: Duration = Duration::from_millis(100);
const CACHE_MAX_TIMEOUT: Duration = Duration::from_millis(250);

const STORAGE_TIMEOUT: Duration = Duration::from_secs(30);
const STORAGE_MAX_TIMEOUT: Duration = Duration::from_secs(300);
const STORAGE_RETRY_ATTEMPTS: u32 = 4;
const STORAGE_FAILURE_THRESHOLD: u32 = 8;
const STORAGE_CONCURRENCY: usize = 32;

/// Fronting an internal HTTP/gRPC service.
///
/// - **Timeout**: 5s (30s max per call)
/// - **Retry**: 3 attempts, 100ms exponential backoff capped at 2s, 20% jitter
/// - **Circuit breaker**: opens after 10 consecutive failures, probes after 30s
/// - **Bulkhead**: 100 concurrent, 50 queued for up to 1s
pub fn web_service(name: impl Into<String>) -> Result<Policy, ConfigError> {
    Policy::builder(name)
        .timeout(TimeoutConfig::new(WEB_TIMEOUT, WEB_MAX_TIMEOUT)?)
        .retry(RetryConfig::new(WEB_RETRY_ATTEMPTS, WEB_BASE_DELAY, WEB_MAX_DELAY, 2.0, 20.0)?)
        .circuit_breaker(CircuitBreakerConfig::new(WEB_FAILURE_THRESHOLD, 2, WEB_OPEN_TIMEOUT, 2)?)
        .bulkhead(BulkheadConfig::new(WEB_CONCURRENCY, WEB_QUEUE, Duration::from_secs(1))?)
        .build()
}

/// Database connections.
///
/// Retries are deliberately absent: writes are rarely idempotent and drivers retry on their own.
pub fn database_client(name: impl Into<String>) -> Result<Policy, ConfigError> {
    Policy::builder(name)
        .timeout(TimeoutConfig::new(DB_TIMEOUT, DB_MAX_TIMEOUT)?)
        .circuit_breaker(CircuitBreakerConfig::new(DB_FAILURE_THRESHOLD, 3, DB_OPEN_TIMEOUT, 1)?)
        .bulkhead(BulkheadConfig::new(DB_CONCURRENCY, DB_QUEUE, Duration::from_secs(5))?)
        .build()
}

/// Third-party APIs with their own quotas: conservative retry plus a client-side rate limit of
/// 600 requests per minute.
pub fn external_api(name: impl Into<String>) -> Result<Policy, ConfigError> {
    Policy::builder(name)
        .timeout(TimeoutConfig::new(API_TIMEOUT, API_MAX_TIMEOUT)?)
        .retry(RetryConfig::new(API_RETRY_ATTEMPTS, API_BASE_DELAY, API_MAX_DELAY, 2.0, 25.0)?)
        .circuit_breaker(CircuitBreakerConfig::new(API_FAILURE_THRESHOLD, 2, API_OPEN_TIMEOUT, 1)?)
        .rate_limit(RateLimitConfig::new(
            RateLimitAlgorithm::SlidingWindow,
            API_RATE_LIMIT,
            Duration::from_secs(60),
            API_RATE_LIMIT / 10,
        )?)
        .bulkhead(BulkheadConfig::new(API_CONCURRENCY, 0, Duration::ZERO)?)
        .build()
}

/// Cache lookups: a miss is cheaper than waiting, so only a tight timeout applies.
pub fn cache_lookup(name: impl Into<String>) -> Result<Policy, ConfigError> {
    Policy::builder(name).timeout(TimeoutConfig::new(CACHE_TIMEOUT, CACHE_MAX_TIMEOUT)?).build()
}

/// Object/blob storage: long transfers, patient retries.
pub fn object_storage(name: impl Into<String>) -> Result<Policy, ConfigError> {
    Policy::builder(name)
        .timeout(TimeoutConfig::new(STORAGE_TIMEOUT, STORAGE_MAX_TIMEOUT)?)
        .retry(RetryConfig::new(
            STORAGE_RETRY_ATTEMPTS,
            Duration::from_millis(250),
            Duration::from_secs(10),
            3.0,
            20.0,
        )?)
        .circuit_breaker(CircuitBreakerConfig::new(
            STORAGE_FAILURE_THRESHOLD,
            2,
            Duration::from_secs(60),
            2,
        )?)
        .bulkhead(BulkheadConfig::new(STORAGE_CONCURRENCY, STORAGE_CONCURRENCY * 2, Duration::from_secs(10))?)
        .build()
}
