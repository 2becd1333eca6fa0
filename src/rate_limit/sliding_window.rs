//! Window arithmetic shared by the local and shared counting modes.

use crate::policy::{RateLimitAlgorithm, RateLimitConfig};
use std::time::Duration;

/// Where `now` falls relative to fixed window boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPosition {
    /// Index of the current window (`now / window`).
    pub bucket: u64,
    /// Milliseconds elapsed since the current window started.
    pub elapsed_ms: u64,
    pub window_ms: u64,
}

impl WindowPosition {
    pub fn at(now_ms: u64, window: Duration) -> Self {
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1);
        Self { bucket: now_ms / window_ms, elapsed_ms: now_ms % window_ms, window_ms }
    }

    pub fn previous_bucket(&self) -> Option<u64> {
        self.bucket.checked_sub(1)
    }

    /// Fraction of the previous window still inside the sliding lookback.
    pub fn overlap(&self) -> f64 {
        (self.window_ms - self.elapsed_ms) as f64 / self.window_ms as f64
    }

    /// Time until the current window closes.
    pub fn remaining(&self) -> Duration {
        Duration::from_millis(self.window_ms - self.elapsed_ms)
    }
}

/// Weighted request count for the admission check.
pub fn estimate(algorithm: RateLimitAlgorithm, pos: &WindowPosition, previous: u64, current: u64) -> f64 {
    match algorithm {
        RateLimitAlgorithm::SlidingWindow => previous as f64 * pos.overlap() + current as f64,
        RateLimitAlgorithm::FixedWindow => current as f64,
    }
}

/// Admission outcome before any counter is touched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    /// Admit; `remaining` further requests fit after this one.
    Admit { remaining: u64 },
    Reject { retry_after: Duration },
}

pub fn admit(config: &RateLimitConfig, pos: &WindowPosition, previous: u64, current: u64) -> Admission {
    let estimate = estimate(config.algorithm(), pos, previous, current);
    let capacity = config.capacity() as f64;
    if estimate < capacity {
        let remaining = (capacity - estimate - 1.0).max(0.0).floor() as u64;
        Admission::Admit { remaining }
    } else {
        Admission::Reject { retry_after: pos.remaining() }
    }
}

/// Headroom left once `counted` (which includes the current request) is in the window.
pub fn remaining_after(config: &RateLimitConfig, pos: &WindowPosition, previous: u64, counted: u64) -> u64 {
    let estimate = estimate(config.algorithm(), pos, previous, counted);
    (config.capacity() as f64 - estimate).max(0.0).floor() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(algorithm: RateLimitAlgorithm, limit: u32, burst: u32) -> RateLimitConfig {
        RateLimitConfig::new(algorithm, limit, Duration::from_secs(60), burst).unwrap()
    }

    #[test]
    fn position_splits_time_into_buckets() {
        let pos = WindowPosition::at(125_000, Duration::from_secs(60));
        assert_eq!(pos.bucket, 2);
        assert_eq!(pos.elapsed_ms, 5_000);
        assert_eq!(pos.remaining(), Duration::from_secs(55));
        assert_eq!(pos.previous_bucket(), Some(1));
        assert_eq!(WindowPosition::at(10, Duration::from_secs(1)).previous_bucket(), None);
    }

    #[test]
    fn previous_window_weight_decays() {
        let start = WindowPosition::at(60_000, Duration::from_secs(60));
        let middle = WindowPosition::at(90_000, Duration::from_secs(60));
        let alg = RateLimitAlgorithm::SlidingWindow;
        assert_eq!(estimate(alg, &start, 100, 0), 100.0);
        assert_eq!(estimate(alg, &middle, 100, 10), 60.0);
        assert_eq!(estimate(RateLimitAlgorithm::FixedWindow, &middle, 100, 10), 10.0);
    }

    #[test]
    fn rejects_at_limit_with_time_left_in_window() {
        let cfg = config(RateLimitAlgorithm::SlidingWindow, 100, 0);
        let pos = WindowPosition::at(15_000, Duration::from_secs(60));
        assert_eq!(admit(&cfg, &pos, 0, 99), Admission::Admit { remaining: 0 });
        assert_eq!(
            admit(&cfg, &pos, 0, 100),
            Admission::Reject { retry_after: Duration::from_secs(45) }
        );
    }

    #[test]
    fn burst_extends_capacity() {
        let cfg = config(RateLimitAlgorithm::FixedWindow, 10, 5);
        let pos = WindowPosition::at(0, Duration::from_secs(60));
        assert_eq!(admit(&cfg, &pos, 0, 10), Admission::Admit { remaining: 4 });
        assert!(matches!(admit(&cfg, &pos, 0, 15), Admission::Reject { .. }));
    }
}
