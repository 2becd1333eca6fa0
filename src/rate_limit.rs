//! Rate limiting primitives.
//!
//! [`RateLimiter`] admits at most `limit + burst_size` requests per key within a window,
//! estimated with the sliding-window approximation
//! `previous * overlap + current` (or only `current` for [`RateLimitAlgorithm::FixedWindow`]).
//!
//! # Counting modes
//!
//! - **Shared**: counters live in a [`KvStore`] under
//!   `{namespace}:{policy}:{key}:{bucket}` with a TTL of two windows, so every instance sees the
//!   same counts.
//! - **Local**: identical arithmetic against in-process counters.
//!
//! A limiter built with a store counts in shared mode and falls back to local counting when a
//! store call fails. After `shared_retry` it tries the store again on the next check and
//! switches back on the first success; no reset is needed.

use crate::clock::{Clock, SystemClock};
use crate::dynamic::DynamicConfig;
use crate::policy::{RateLimitAlgorithm, RateLimitConfig};
use crate::store::{KvStore, StoreError};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub mod local;
pub mod sliding_window;

use local::LocalCounters;
use sliding_window::{Admission, WindowPosition};

/// Where the limiter is currently counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterMode {
    Shared,
    Local,
}

impl CounterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterMode::Shared => "shared",
            CounterMode::Local => "local",
        }
    }

    fn from_u8(raw: u8) -> Self {
        if raw == MODE_SHARED {
            CounterMode::Shared
        } else {
            CounterMode::Local
        }
    }
}

impl fmt::Display for CounterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const MODE_SHARED: u8 = 0;
const MODE_LOCAL: u8 = 1;

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// The request is allowed to proceed.
    Allowed {
        /// Requests that still fit in the current estimate after this one.
        remaining: u64,
    },
    /// The request is denied.
    Denied {
        /// Time until the current window closes.
        retry_after: Duration,
    },
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    fn from_admission(admission: Admission) -> Self {
        match admission {
            Admission::Admit { remaining } => Decision::Allowed { remaining },
            Admission::Reject { retry_after } => Decision::Denied { retry_after },
        }
    }
}

/// Result of [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitCheck {
    pub decision: Decision,
    /// Mode that produced `decision`.
    pub mode: CounterMode,
    /// `Some(mode)` when this check switched the limiter into `mode`.
    pub mode_change: Option<CounterMode>,
}

#[derive(Debug)]
struct SharedCounters {
    store: Arc<dyn KvStore>,
    namespace: String,
}

/// Sliding-window rate limiter for one policy.
#[derive(Debug)]
pub struct RateLimiter {
    policy: Arc<str>,
    config: DynamicConfig<RateLimitConfig>,
    shared: Option<SharedCounters>,
    local: LocalCounters,
    mode: AtomicU8,
    /// Clock millis before which shared counting is not retried.
    shared_retry_at: AtomicU64,
    shared_retry: Duration,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Local-only limiter.
    pub fn new(policy: impl Into<Arc<str>>, config: RateLimitConfig) -> Self {
        Self {
            policy: policy.into(),
            config: DynamicConfig::new(config),
            shared: None,
            local: LocalCounters::new(),
            mode: AtomicU8::new(MODE_LOCAL),
            shared_retry_at: AtomicU64::new(0),
            shared_retry: Duration::from_secs(5),
            clock: Arc::new(SystemClock),
        }
    }

    /// Count in `store` under `namespace`, falling back to local counters on store errors.
    pub fn with_shared(mut self, store: Arc<dyn KvStore>, namespace: impl Into<String>) -> Self {
        self.shared = Some(SharedCounters { store, namespace: namespace.into() });
        self.mode.store(MODE_SHARED, Ordering::Release);
        self
    }

    /// How long to stay in local mode before trying the store again.
    pub fn with_shared_retry(mut self, interval: Duration) -> Self {
        self.shared_retry = interval;
        self
    }

    /// Window boundaries are taken from `clock`. Instances sharing counters must agree on it,
    /// so production code keeps the default wall clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> &str {
        &self.policy
    }

    pub fn config(&self) -> Arc<RateLimitConfig> {
        self.config.get()
    }

    /// Swap the configuration; counts already taken stay in place.
    pub fn update_config(&self, config: RateLimitConfig) {
        self.config.set(config);
    }

    pub fn mode(&self) -> CounterMode {
        CounterMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    /// Check and, when admitted, count one request for `key`.
    pub async fn check(&self, key: &str) -> RateLimitCheck {
        let config = self.config.get();
        let now = self.clock.now_millis();
        let pos = WindowPosition::at(now, config.window());

        let Some(shared) = &self.shared else {
            return RateLimitCheck {
                decision: Decision::from_admission(self.local.check(key, &config, &pos)),
                mode: CounterMode::Local,
                mode_change: None,
            };
        };

        if self.mode() == CounterMode::Local && now < self.shared_retry_at.load(Ordering::Acquire) {
            return self.check_local(key, &config, &pos, None);
        }

        match self.check_shared(shared, key, &config, &pos).await {
            Ok(admission) => {
                let previous = self.mode.swap(MODE_SHARED, Ordering::AcqRel);
                let mode_change = (previous == MODE_LOCAL).then(|| {
                    tracing::info!(policy = %self.policy, "rate limiter: shared counting resumed");
                    CounterMode::Shared
                });
                RateLimitCheck {
                    decision: Decision::from_admission(admission),
                    mode: CounterMode::Shared,
                    mode_change,
                }
            }
            Err(err) => {
                self.shared_retry_at.store(
                    now.saturating_add(u64::try_from(self.shared_retry.as_millis()).unwrap_or(u64::MAX)),
                    Ordering::Release,
                );
                let previous = self.mode.swap(MODE_LOCAL, Ordering::AcqRel);
                let mode_change = (previous == MODE_SHARED).then(|| {
                    tracing::warn!(
                        policy = %self.policy,
                        error = %err,
                        retry_in = ?self.shared_retry,
                        "rate limiter: shared counters unavailable, counting locally"
                    );
                    CounterMode::Local
                });
                self.check_local(key, &config, &pos, mode_change)
            }
        }
    }

    fn check_local(
        &self,
        key: &str,
        config: &RateLimitConfig,
        pos: &WindowPosition,
        mode_change: Option<CounterMode>,
    ) -> RateLimitCheck {
        RateLimitCheck {
            decision: Decision::from_admission(self.local.check(key, config, pos)),
            mode: CounterMode::Local,
            mode_change,
        }
    }

    /// Read both windows, then increment the current one if admitted. Concurrent instances can
    /// interleave between the read and the increment, so the shared count may overshoot slightly.
    async fn check_shared(
        &self,
        shared: &SharedCounters,
        key: &str,
        config: &RateLimitConfig,
        pos: &WindowPosition,
    ) -> Result<Admission, StoreError> {
        let current_key = self.counter_key(&shared.namespace, key, pos.bucket);
        let current = read_count(shared.store.as_ref(), &current_key).await?;
        let previous = match pos.previous_bucket() {
            Some(bucket) if config.algorithm() == RateLimitAlgorithm::SlidingWindow => {
                read_count(shared.store.as_ref(), &self.counter_key(&shared.namespace, key, bucket))
                    .await?
            }
            _ => 0,
        };

        match sliding_window::admit(config, pos, previous, current) {
            Admission::Admit { .. } => {
                let counted = shared.store.incr(&current_key, config.window().saturating_mul(2)).await?;
                Ok(Admission::Admit {
                    remaining: sliding_window::remaining_after(config, pos, previous, counted),
                })
            }
            reject => Ok(reject),
        }
    }

    fn counter_key(&self, namespace: &str, key: &str, bucket: u64) -> String {
        format!("{}:{}:{}:{}", namespace, self.policy, key, bucket)
    }
}

async fn read_count(store: &dyn KvStore, key: &str) -> Result<u64, StoreError> {
    match store.get(key).await? {
        None => Ok(0),
        Some(bytes) => std::str::from_utf8(&bytes)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| StoreError::NotAnInteger { key: key.to_string() }),
    }
}
