//! Validated sub-configurations of a [`Policy`](super::Policy).
//!
//! Every constructor checks its invariants and returns a [`ConfigError`] naming the offending
//! field; a config value that exists is always valid.

use super::duration;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A policy setting violates its invariants.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field}: {reason}")]
pub struct ConfigError {
    field: &'static str,
    reason: String,
}

impl ConfigError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self { field, reason: reason.into() }
    }

    /// Dotted path of the offending field (`"retry.multiplier"`).
    pub fn field(&self) -> &'static str {
        self.field
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

fn at_least_one(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::new(field, "must be >= 1 (got 0)"));
    }
    Ok(())
}

fn non_zero(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::new(field, "must be > 0"));
    }
    Ok(())
}

fn encodable(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value > duration::MAX {
        return Err(ConfigError::new(field, format!("must be <= {}", duration::format(duration::MAX))));
    }
    Ok(())
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    failure_threshold: u32,
    success_threshold: u32,
    open_timeout: Duration,
    probe_count: u32,
}

impl CircuitBreakerConfig {
    /// # Examples
    /// ```
    /// use resilience_policy::CircuitBreakerConfig;
    /// use std::time::Duration;
    /// let cfg = CircuitBreakerConfig::new(5, 2, Duration::from_secs(30), 2).unwrap();
    /// assert_eq!(cfg.failure_threshold(), 5);
    /// assert!(CircuitBreakerConfig::new(0, 2, Duration::from_secs(30), 2).is_err());
    /// ```
    pub fn new(
        failure_threshold: u32,
        success_threshold: u32,
        open_timeout: Duration,
        probe_count: u32,
    ) -> Result<Self, ConfigError> {
        at_least_one("circuit_breaker.failure_threshold", failure_threshold.into())?;
        at_least_one("circuit_breaker.success_threshold", success_threshold.into())?;
        non_zero("circuit_breaker.timeout", open_timeout)?;
        encodable("circuit_breaker.timeout", open_timeout)?;
        at_least_one("circuit_breaker.probe_count", probe_count.into())?;
        Ok(Self { failure_threshold, success_threshold, open_timeout, probe_count })
    }

    /// Consecutive failures in Closed that open the breaker.
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Cumulative probe successes in HalfOpen that close the breaker.
    pub fn success_threshold(&self) -> u32 {
        self.success_threshold
    }

    /// Time spent Open before probes are admitted.
    pub fn open_timeout(&self) -> Duration {
        self.open_timeout
    }

    /// Maximum concurrently outstanding probes while HalfOpen.
    pub fn probe_count(&self) -> u32 {
        self.probe_count
    }
}

/// Retry schedule: `max_attempts` total attempts with exponential, jittered backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter_percent: f64,
}

impl RetryConfig {
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        jitter_percent: f64,
    ) -> Result<Self, ConfigError> {
        at_least_one("retry.max_attempts", max_attempts.into())?;
        encodable("retry.max_delay", max_delay)?;
        if max_delay < base_delay {
            return Err(ConfigError::new(
                "retry.max_delay",
                format!("must be >= base_delay ({:?} < {:?})", max_delay, base_delay),
            ));
        }
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigError::new(
                "retry.multiplier",
                format!("must be a finite number >= 1 (got {})", multiplier),
            ));
        }
        if !jitter_percent.is_finite() || !(0.0..=100.0).contains(&jitter_percent) {
            return Err(ConfigError::new(
                "retry.jitter_percent",
                format!("must be within 0..=100 (got {})", jitter_percent),
            ));
        }
        Ok(Self { max_attempts, base_delay, max_delay, multiplier, jitter_percent })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn jitter_percent(&self) -> f64 {
        self.jitter_percent
    }
}

/// Per-attempt timeout. Callers may request a different timeout per call, clamped to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    default_timeout: Duration,
    max_timeout: Duration,
}

impl TimeoutConfig {
    pub fn new(default_timeout: Duration, max_timeout: Duration) -> Result<Self, ConfigError> {
        non_zero("timeout.default", default_timeout)?;
        encodable("timeout.max", max_timeout)?;
        if max_timeout < default_timeout {
            return Err(ConfigError::new(
                "timeout.max",
                format!("must be >= default ({:?} < {:?})", max_timeout, default_timeout),
            ));
        }
        Ok(Self { default_timeout, max_timeout })
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn max_timeout(&self) -> Duration {
        self.max_timeout
    }
}

/// Counting algorithm used by the rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RateLimitAlgorithm {
    /// Weighted estimate over the current and previous window.
    #[default]
    SlidingWindow,
    /// Current window only; the count resets at each window boundary.
    FixedWindow,
}

impl RateLimitAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitAlgorithm::SlidingWindow => "sliding_window",
            RateLimitAlgorithm::FixedWindow => "fixed_window",
        }
    }
}

impl fmt::Display for RateLimitAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RateLimitAlgorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sliding_window" => Ok(RateLimitAlgorithm::SlidingWindow),
            "fixed_window" => Ok(RateLimitAlgorithm::FixedWindow),
            other => Err(ConfigError::new(
                "rate_limit.algorithm",
                format!("unknown algorithm {:?} (expected sliding_window or fixed_window)", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    algorithm: RateLimitAlgorithm,
    limit: u32,
    window: Duration,
    burst_size: u32,
}

impl RateLimitConfig {
    pub fn new(
        algorithm: RateLimitAlgorithm,
        limit: u32,
        window: Duration,
        burst_size: u32,
    ) -> Result<Self, ConfigError> {
        at_least_one("rate_limit.limit", limit.into())?;
        non_zero("rate_limit.window", window)?;
        if window.as_millis() == 0 {
            return Err(ConfigError::new("rate_limit.window", "must be at least 1ms"));
        }
        encodable("rate_limit.window", window)?;
        Ok(Self { algorithm, limit, window, burst_size })
    }

    pub fn algorithm(&self) -> RateLimitAlgorithm {
        self.algorithm
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Grace admissions on top of `limit`.
    pub fn burst_size(&self) -> u32 {
        self.burst_size
    }

    /// `limit + burst_size`: the estimate must stay below this to admit.
    pub fn capacity(&self) -> u64 {
        u64::from(self.limit) + u64::from(self.burst_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadConfig {
    max_concurrent: usize,
    max_queue: usize,
    queue_timeout: Duration,
}

impl BulkheadConfig {
    /// Largest permit count a tokio semaphore accepts, with headroom.
    pub const MAX_CONCURRENT: usize = 1_000_000_000;

    pub fn new(
        max_concurrent: usize,
        max_queue: usize,
        queue_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        at_least_one("bulkhead.max_concurrent", max_concurrent as u64)?;
        encodable("bulkhead.queue_timeout", queue_timeout)?;
        if max_concurrent > Self::MAX_CONCURRENT {
            return Err(ConfigError::new(
                "bulkhead.max_concurrent",
                format!("must be <= {} (got {})", Self::MAX_CONCURRENT, max_concurrent),
            ));
        }
        Ok(Self { max_concurrent, max_queue, queue_timeout })
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn max_queue(&self) -> usize {
        self.max_queue
    }

    pub fn queue_timeout(&self) -> Duration {
        self.queue_timeout
    }
}
