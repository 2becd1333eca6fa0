//! Circuit breaker implementation with lock-free atomics
//!
//! The phase and a transition epoch share one `AtomicU64`, so every transition is a single
//! compare-and-swap and no two callers can win the same logical transition. Counters are tagged
//! with the epoch they belong to: a transition never has to reset them, and outcomes reported
//! by calls admitted before a transition are ignored.

use crate::clock::{Clock, MonotonicClock};
use crate::dynamic::DynamicConfig;
use crate::policy::CircuitBreakerConfig;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const PHASE_BITS: u64 = 2;
const PHASE_MASK: u64 = 0b11;
const PHASE_CLOSED: u64 = 0;
const PHASE_OPEN: u64 = 1;
const PHASE_HALF_OPEN: u64 = 2;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the open timeout elapses.
    Open,
    /// Probe mode allowing a limited number of calls to test recovery.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    fn from_bits(bits: u64) -> Self {
        match bits & PHASE_MASK {
            PHASE_OPEN => CircuitState::Open,
            PHASE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A phase change performed by one caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitTransition {
    /// Closed or HalfOpen to Open.
    Opened {
        /// Consecutive failures that tripped the breaker (1 for a failed probe).
        failure_count: u32,
        from: CircuitState,
    },
    /// Open to HalfOpen after the open timeout.
    HalfOpened,
    /// HalfOpen to Closed after enough successful probes.
    Closed,
    /// Operator reset back to Closed.
    Reset { from: CircuitState },
}

impl CircuitTransition {
    /// Phase after the transition.
    pub fn to_state(&self) -> CircuitState {
        match self {
            CircuitTransition::Opened { .. } => CircuitState::Open,
            CircuitTransition::HalfOpened => CircuitState::HalfOpen,
            CircuitTransition::Closed | CircuitTransition::Reset { .. } => CircuitState::Closed,
        }
    }
}

/// Returned by [`CircuitBreaker::try_acquire`] when the call must not reach the dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitOpenRejection {
    pub failure_count: u32,
    /// Time until probes are admitted; zero when rejected for lack of probe budget.
    pub retry_after: Duration,
}

/// Point-in-time view for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub probe_successes: u32,
    pub probes_in_flight: u32,
    /// Clock reading when the breaker last opened; meaningful while Open.
    pub opened_at_millis: u64,
}

/// `(epoch tag << 32) | count`. A count whose tag is older than the caller's epoch reads as 0.
#[derive(Debug, Default)]
struct EpochCounter(AtomicU64);

impl EpochCounter {
    fn tag(epoch: u64) -> u32 {
        epoch as u32
    }

    fn unpack(word: u64) -> (u32, u32) {
        ((word >> 32) as u32, word as u32)
    }

    fn pack(tag: u32, count: u32) -> u64 {
        (u64::from(tag) << 32) | u64::from(count)
    }

    /// Wrapping comparison so tags survive `u32` overflow.
    fn is_newer(tag: u32, than: u32) -> bool {
        (tag.wrapping_sub(than) as i32) > 0
    }

    fn get(&self, epoch: u64) -> u32 {
        let (tag, count) = Self::unpack(self.0.load(Ordering::Acquire));
        if tag == Self::tag(epoch) {
            count
        } else {
            0
        }
    }

    /// Apply `f` to the count for `epoch`; `None` from `f` or a newer tag leaves it untouched.
    fn update(&self, epoch: u64, f: impl Fn(u32) -> Option<u32>) -> Option<u32> {
        let mine = Self::tag(epoch);
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let (tag, count) = Self::unpack(current);
            if Self::is_newer(tag, mine) {
                return None;
            }
            let base = if tag == mine { count } else { 0 };
            let next = f(base)?;
            match self.0.compare_exchange_weak(
                current,
                Self::pack(mine, next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(next),
                Err(actual) => current = actual,
            }
        }
    }

    fn increment(&self, epoch: u64) -> Option<u32> {
        self.update(epoch, |c| Some(c.saturating_add(1)))
    }

    fn increment_below(&self, epoch: u64, limit: u32) -> Option<u32> {
        self.update(epoch, |c| if c < limit { Some(c + 1) } else { None })
    }

    fn decrement(&self, epoch: u64) {
        let _ = self.update(epoch, |c| c.checked_sub(1));
    }

    fn clear(&self, epoch: u64) {
        let _ = self.update(epoch, |_| Some(0));
    }
}

/// Per-policy breaker. Callers ask for a [`CircuitPermit`] before invoking the dependency and
/// report the outcome through it.
pub struct CircuitBreaker {
    name: Arc<str>,
    config: DynamicConfig<CircuitBreakerConfig>,
    clock: Arc<dyn Clock>,
    state: AtomicU64,
    failures: EpochCounter,
    successes: EpochCounter,
    probes: EpochCounter,
    opened_at: AtomicU64,
    open_failures: AtomicU32,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl CircuitBreaker {
    /// # Examples
    /// ```
    /// use resilience_policy::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    /// use std::time::Duration;
    ///
    /// let cfg = CircuitBreakerConfig::new(1, 1, Duration::from_secs(30), 1).unwrap();
    /// let breaker = CircuitBreaker::new("search", cfg);
    /// let permit = breaker.try_acquire().unwrap();
    /// permit.record(false);
    /// assert_eq!(breaker.state(), CircuitState::Open);
    /// assert!(breaker.try_acquire().is_err());
    /// ```
    pub fn new(name: impl Into<Arc<str>>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, Arc::new(MonotonicClock::default()))
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock(
        name: impl Into<Arc<str>>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            config: DynamicConfig::new(config),
            clock,
            state: AtomicU64::new(PHASE_CLOSED),
            failures: EpochCounter::default(),
            successes: EpochCounter::default(),
            probes: EpochCounter::default(),
            opened_at: AtomicU64::new(0),
            open_failures: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> Arc<CircuitBreakerConfig> {
        self.config.get()
    }

    /// Swap thresholds in place. Counters and phase are kept.
    pub fn update_config(&self, config: CircuitBreakerConfig) {
        self.config.set(config);
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_bits(self.state.load(Ordering::Acquire))
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let word = self.state.load(Ordering::Acquire);
        let epoch = word >> PHASE_BITS;
        CircuitSnapshot {
            state: CircuitState::from_bits(word),
            consecutive_failures: self.failures.get(epoch),
            probe_successes: self.successes.get(epoch),
            probes_in_flight: self.probes.get(epoch),
            opened_at_millis: self.opened_at.load(Ordering::Acquire),
        }
    }

    /// Decide whether a call may proceed.
    ///
    /// # Behavior
    /// - **Closed**: always admitted.
    /// - **Open**: rejected until `open_timeout` has elapsed; the first caller after that moves
    ///   the breaker to HalfOpen.
    /// - **HalfOpen**: admitted while fewer than `probe_count` probes are outstanding.
    pub fn try_acquire(&self) -> Result<CircuitPermit<'_>, CircuitOpenRejection> {
        let mut transition = None;
        loop {
            let word = self.state.load(Ordering::Acquire);
            let epoch = word >> PHASE_BITS;
            match CircuitState::from_bits(word) {
                CircuitState::Closed => {
                    return Ok(CircuitPermit::new(self, epoch, false, transition));
                }
                CircuitState::Open => {
                    let config = self.config.get();
                    let opened_at = self.opened_at.load(Ordering::Acquire);
                    let elapsed = Duration::from_millis(self.now().saturating_sub(opened_at));
                    if elapsed < config.open_timeout() {
                        return Err(CircuitOpenRejection {
                            failure_count: self.open_failures.load(Ordering::Acquire),
                            retry_after: config.open_timeout() - elapsed,
                        });
                    }
                    let next = Self::pack(epoch + 1, PHASE_HALF_OPEN);
                    if self
                        .state
                        .compare_exchange(word, next, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        tracing::info!(policy = %self.name, "circuit breaker → half-open");
                        transition = Some(CircuitTransition::HalfOpened);
                    }
                }
                CircuitState::HalfOpen => {
                    let limit = self.config.get().probe_count();
                    if self.probes.increment_below(epoch, limit).is_some() {
                        // A transition may have slipped in between the load and the increment.
                        if self.state.load(Ordering::Acquire) != word {
                            self.probes.decrement(epoch);
                            continue;
                        }
                        tracing::debug!(
                            policy = %self.name,
                            in_flight = self.probes.get(epoch),
                            max = limit,
                            "circuit breaker: half-open probe"
                        );
                        return Ok(CircuitPermit::new(self, epoch, true, transition));
                    }
                    if self.state.load(Ordering::Acquire) != word {
                        continue;
                    }
                    return Err(CircuitOpenRejection {
                        failure_count: self.open_failures.load(Ordering::Acquire),
                        retry_after: Duration::ZERO,
                    });
                }
            }
        }
    }

    /// Force the breaker back to Closed with fresh counters.
    pub fn reset(&self) -> Option<CircuitTransition> {
        let mut word = self.state.load(Ordering::Acquire);
        loop {
            let from = CircuitState::from_bits(word);
            let next = Self::pack((word >> PHASE_BITS) + 1, PHASE_CLOSED);
            match self.state.compare_exchange(word, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    tracing::info!(policy = %self.name, from = %from, "circuit breaker reset");
                    return (from != CircuitState::Closed)
                        .then_some(CircuitTransition::Reset { from });
                }
                Err(actual) => word = actual,
            }
        }
    }

    fn pack(epoch: u64, phase: u64) -> u64 {
        (epoch << PHASE_BITS) | phase
    }

    fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    fn on_success(&self, epoch: u64, probe: bool) -> Option<CircuitTransition> {
        if !probe {
            self.failures.clear(epoch);
            return None;
        }
        let word = Self::pack(epoch, PHASE_HALF_OPEN);
        if self.state.load(Ordering::Acquire) != word {
            return None;
        }
        let successes = self.successes.increment(epoch)?;
        let threshold = self.config.get().success_threshold();
        if successes >= threshold
            && self
                .state
                .compare_exchange(
                    word,
                    Self::pack(epoch + 1, PHASE_CLOSED),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            tracing::info!(policy = %self.name, successes, "circuit breaker → closed");
            return Some(CircuitTransition::Closed);
        }
        None
    }

    fn on_failure(&self, epoch: u64, probe: bool) -> Option<CircuitTransition> {
        let (word, failures) = if probe {
            (Self::pack(epoch, PHASE_HALF_OPEN), 1)
        } else {
            let word = Self::pack(epoch, PHASE_CLOSED);
            if self.state.load(Ordering::Acquire) != word {
                return None;
            }
            let failures = self.failures.increment(epoch)?;
            if failures < self.config.get().failure_threshold() {
                return None;
            }
            (word, failures)
        };
        if self.state.load(Ordering::Acquire) != word {
            return None;
        }

        // Readers of an Open phase must never see a stale `opened_at`.
        self.opened_at.store(self.now(), Ordering::Release);
        self.open_failures.store(failures, Ordering::Release);
        if self
            .state
            .compare_exchange(
                word,
                Self::pack(epoch + 1, PHASE_OPEN),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return None;
        }

        let from = if probe { CircuitState::HalfOpen } else { CircuitState::Closed };
        if probe {
            tracing::warn!(policy = %self.name, "circuit breaker: probe failed → open");
        } else {
            tracing::error!(
                policy = %self.name,
                failures,
                threshold = self.config.get().failure_threshold(),
                "circuit breaker → open"
            );
        }
        Some(CircuitTransition::Opened { failure_count: failures, from })
    }
}

/// Admission granted by [`CircuitBreaker::try_acquire`].
///
/// Dropping the permit without recording an outcome releases any probe slot and leaves the
/// counters untouched (used for cancelled calls).
#[must_use = "report the call outcome with `record`"]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    epoch: u64,
    probe: bool,
    transition: Option<CircuitTransition>,
}

impl<'a> CircuitPermit<'a> {
    fn new(
        breaker: &'a CircuitBreaker,
        epoch: u64,
        probe: bool,
        transition: Option<CircuitTransition>,
    ) -> Self {
        Self { breaker, epoch, probe, transition }
    }

    /// True when this call is a half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Transition this caller performed while being admitted (Open to HalfOpen).
    pub fn transition(&self) -> Option<CircuitTransition> {
        self.transition
    }

    /// Feed the call outcome back into the breaker.
    pub fn record(self, success: bool) -> Option<CircuitTransition> {
        if success {
            self.breaker.on_success(self.epoch, self.probe)
        } else {
            self.breaker.on_failure(self.epoch, self.probe)
        }
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if self.probe {
            self.breaker.probes.decrement(self.epoch);
        }
    }
}

impl fmt::Debug for CircuitPermit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitPermit")
            .field("policy", &self.breaker.name)
            .field("probe", &self.probe)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use futures::future::join_all;

    fn breaker(failures: u32, successes: u32, timeout_ms: u64, probes: u32) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::new();
        let cfg = CircuitBreakerConfig::new(
            failures,
            successes,
            Duration::from_millis(timeout_ms),
            probes,
        )
        .unwrap();
        (CircuitBreaker::with_clock("test", cfg, Arc::new(clock.clone())), clock)
    }

    fn fail(b: &CircuitBreaker) -> Option<CircuitTransition> {
        b.try_acquire().expect("admitted").record(false)
    }

    fn succeed(b: &CircuitBreaker) -> Option<CircuitTransition> {
        b.try_acquire().expect("admitted").record(true)
    }

    #[test]
    fn starts_closed() {
        let (b, _) = breaker(3, 1, 1_000, 1);
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.try_acquire().is_ok());
    }

    #[test]
    fn opens_after_threshold_failures() {
        let (b, _) = breaker(5, 1, 30_000, 1);
        for _ in 0..4 {
            assert_eq!(fail(&b), None);
        }
        assert_eq!(
            fail(&b),
            Some(CircuitTransition::Opened { failure_count: 5, from: CircuitState::Closed })
        );
        assert_eq!(b.state(), CircuitState::Open);
        let rejection = b.try_acquire().unwrap_err();
        assert_eq!(rejection.failure_count, 5);
        assert_eq!(rejection.retry_after, Duration::from_secs(30));
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let (b, _) = breaker(3, 1, 1_000, 1);
        fail(&b);
        fail(&b);
        succeed(&b);
        fail(&b);
        fail(&b);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().consecutive_failures, 2);
    }

    #[test]
    fn open_blocks_until_timeout_then_half_opens() {
        let (b, clock) = breaker(1, 1, 30_000, 1);
        fail(&b);

        clock.advance(29_999);
        let rejection = b.try_acquire().unwrap_err();
        assert_eq!(rejection.retry_after, Duration::from_millis(1));

        clock.advance(1);
        let permit = b.try_acquire().expect("probe admitted at timeout");
        assert!(permit.is_probe());
        assert_eq!(permit.transition(), Some(CircuitTransition::HalfOpened));
        assert_eq!(b.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_closes_after_success_threshold() {
        let (b, clock) = breaker(1, 2, 100, 2);
        fail(&b);
        clock.advance(100);

        let first = b.try_acquire().unwrap();
        let second = b.try_acquire().unwrap();
        assert_eq!(first.record(true), None);
        assert_eq!(second.record(true), Some(CircuitTransition::Closed));
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn failed_probe_reopens_and_discards_budget() {
        let (b, clock) = breaker(1, 2, 100, 2);
        fail(&b);
        clock.advance(100);

        let first = b.try_acquire().unwrap();
        let second = b.try_acquire().unwrap();
        assert_eq!(
            first.record(false),
            Some(CircuitTransition::Opened { failure_count: 1, from: CircuitState::HalfOpen })
        );
        assert_eq!(b.state(), CircuitState::Open);
        // The remaining probe's success arrives after the reopen and is ignored.
        assert_eq!(second.record(true), None);
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.try_acquire().unwrap_err().retry_after, Duration::from_millis(100));
    }

    #[test]
    fn excess_probes_are_rejected_like_open() {
        let (b, clock) = breaker(1, 1, 100, 2);
        fail(&b);
        clock.advance(100);

        let p1 = b.try_acquire().unwrap();
        let p2 = b.try_acquire().unwrap();
        let rejected = b.try_acquire().unwrap_err();
        assert_eq!(rejected.retry_after, Duration::ZERO);

        drop(p1);
        let p3 = b.try_acquire().expect("slot freed by drop");
        drop((p2, p3));
        assert_eq!(b.snapshot().probes_in_flight, 0);
    }

    #[test]
    fn stale_closed_outcomes_are_ignored_after_reset() {
        let (b, _) = breaker(2, 1, 100, 1);
        let stale = b.try_acquire().unwrap();
        fail(&b);
        assert_eq!(b.reset(), None);
        assert_eq!(stale.record(false), None);
        assert_eq!(b.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn reset_reports_transition_from_open() {
        let (b, _) = breaker(1, 1, 60_000, 1);
        fail(&b);
        assert_eq!(b.reset(), Some(CircuitTransition::Reset { from: CircuitState::Open }));
        assert!(b.try_acquire().is_ok());
    }

    #[test]
    fn config_update_keeps_counters() {
        let (b, _) = breaker(5, 1, 100, 1);
        fail(&b);
        fail(&b);
        b.update_config(CircuitBreakerConfig::new(3, 1, Duration::from_millis(100), 1).unwrap());
        assert_eq!(b.snapshot().consecutive_failures, 2);
        assert!(fail(&b).is_some());
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn counter_tags_survive_wraparound() {
        assert!(EpochCounter::is_newer(0, u32::MAX));
        assert!(!EpochCounter::is_newer(u32::MAX, 0));
        assert!(!EpochCounter::is_newer(7, 7));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_probes_never_exceed_budget() {
        let (b, clock) = breaker(1, 10, 5, 3);
        let b = Arc::new(b);
        fail(&b);
        clock.advance(5);

        let tasks = 200;
        let barrier = Arc::new(tokio::sync::Barrier::new(tasks));
        let admitted = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let handles = (0..tasks).map(|_| {
            let b = b.clone();
            let barrier = barrier.clone();
            let admitted = admitted.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                if let Ok(permit) = b.try_acquire() {
                    admitted.fetch_add(1, Ordering::SeqCst);
                    peak.fetch_max(b.snapshot().probes_in_flight, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    drop(permit);
                }
            })
        });
        join_all(handles).await;

        assert!(admitted.load(Ordering::SeqCst) >= 1);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(b.snapshot().probes_in_flight, 0);
        assert_eq!(b.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_failures_open_exactly_once() {
        let (b, _) = breaker(10, 1, 60_000, 1);
        let b = Arc::new(b);
        let handles = (0..100).map(|_| {
            let b = b.clone();
            tokio::spawn(async move {
                match b.try_acquire() {
                    Ok(permit) => permit.record(false),
                    Err(_) => None,
                }
            })
        });
        let opened = join_all(handles)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(Some(CircuitTransition::Opened { .. }))))
            .count();
        assert_eq!(opened, 1);
        assert_eq!(b.state(), CircuitState::Open);
    }
}
