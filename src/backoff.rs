//! Exponential backoff for the retry coordinator.
//!
//! Retry semantics: `retry` index `0` is the initial call (no delay) and the first retry is
//! `retry = 1`, so the delay before attempt `i` is `delay(i - 1)`.
//!
//! ```rust
//! use std::time::Duration;
//! use resilience_policy::backoff::Backoff;
//!
//! let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 2.0);
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(1), Duration::from_secs(1));
//! assert_eq!(backoff.delay(2), Duration::from_secs(2));
//! assert_eq!(backoff.delay(9), Duration::from_secs(30)); // capped
//! ```

use crate::policy::RetryConfig;
use std::time::Duration;

/// `min(max, base * multiplier^(retry - 1))`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    /// Values are trusted; build from a validated [`RetryConfig`] where possible.
    pub fn new(base: Duration, max: Duration, multiplier: f64) -> Self {
        Self { base, max: max.max(base), multiplier: multiplier.max(1.0) }
    }

    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self::new(cfg.base_delay(), cfg.max_delay(), cfg.multiplier())
    }

    pub fn delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let factor = self.multiplier.powi(exponent);
        let nanos = self.base.as_nanos() as f64 * factor;
        if !nanos.is_finite() || nanos >= self.max.as_nanos() as f64 {
            return self.max;
        }
        // `as` saturates for floats, and `nanos` is below `max` here.
        Duration::from_nanos(nanos as u64)
    }
}
