//! Jitter to prevent synchronized retry storms
//!
//! `Percent(p)` scales a delay by a uniform factor in `[1 - p/100, 1 + p/100]`; with `p <= 100`
//! the result is never negative.
//!
//! RNG: uses `rand`'s thread-local RNG by default; deterministic RNGs can be injected via
//! `apply_with_rng`.

use rand::{rng, Rng};
use std::time::Duration;

/// Jitter strategy for randomizing retry delays
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Jitter {
    /// No jitter - use exact backoff delay
    #[default]
    None,
    /// Symmetric jitter of up to the given percentage of the delay.
    Percent(f64),
}

impl Jitter {
    /// `0` disables jitter; values are clamped to `0..=100`.
    pub fn percent(p: f64) -> Self {
        if !p.is_finite() || p <= 0.0 {
            Jitter::None
        } else {
            Jitter::Percent(p.min(100.0))
        }
    }

    /// Apply jitter to a delay duration
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_with_rng(delay, &mut rng)
    }

    /// Apply jitter with a custom RNG (for testing)
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match *self {
            Jitter::None => delay,
            Jitter::Percent(p) => {
                if delay.is_zero() {
                    return delay;
                }
                let nanos = delay.as_nanos() as f64;
                let offset = nanos * rng.random_range(-p..=p) / 100.0;
                Duration::from_nanos((nanos + offset).max(0.0) as u64)
            }
        }
    }

    /// Inclusive range `apply` can return for `delay`.
    pub fn bounds(&self, delay: Duration) -> (Duration, Duration) {
        match *self {
            Jitter::None => (delay, delay),
            Jitter::Percent(p) => {
                let nanos = delay.as_nanos() as f64;
                let spread = nanos * p / 100.0;
                (
                    Duration::from_nanos((nanos - spread).max(0.0) as u64),
                    Duration::from_nanos((nanos + spread) as u64),
                )
            }
        }
    }
}
