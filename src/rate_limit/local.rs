//! In-process window counters used when shared counting is disabled or unreachable.

use super::sliding_window::{self, Admission, WindowPosition};
use crate::policy::RateLimitConfig;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
struct KeyWindows {
    bucket: u64,
    current: u64,
    previous: u64,
}

impl KeyWindows {
    /// Roll forward so `current` belongs to `bucket`.
    fn advance(&mut self, bucket: u64) {
        if bucket == self.bucket {
            return;
        }
        self.previous = if bucket == self.bucket + 1 { self.current } else { 0 };
        self.current = 0;
        self.bucket = bucket;
    }
}

#[derive(Debug, Default)]
struct Tracked {
    keys: HashMap<String, KeyWindows>,
    /// Bucket of the last sweep for idle keys; sweeps run once per window.
    pruned_bucket: u64,
}

impl Tracked {
    fn prune(&mut self, bucket: u64) {
        if bucket == self.pruned_bucket {
            return;
        }
        // Keys idle for two windows carry no weight any more.
        self.keys.retain(|_, w| w.bucket + 1 >= bucket);
        self.pruned_bucket = bucket;
    }
}

/// Per-key current/previous window counts. Check and increment happen under one lock, so the
/// local mode is exact.
#[derive(Debug, Default)]
pub struct LocalCounters {
    tracked: Mutex<Tracked>,
}

impl LocalCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, key: &str, config: &RateLimitConfig, pos: &WindowPosition) -> Admission {
        let mut tracked = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);
        tracked.prune(pos.bucket);

        let windows = tracked.keys.entry(key.to_string()).or_insert_with(|| KeyWindows {
            bucket: pos.bucket,
            ..KeyWindows::default()
        });
        windows.advance(pos.bucket);

        let admission = sliding_window::admit(config, pos, windows.previous, windows.current);
        if let Admission::Admit { .. } = admission {
            windows.current += 1;
        }
        admission
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner).keys.len()
    }
}
