//! Per-policy runtime state.
//!
//! The engine keeps one [`PolicyRuntime`] per policy name: the breaker, limiter and bulkhead that
//! carry state between calls, plus the stateless retry and timeout settings. Updating a policy
//! swaps in a new runtime that reuses the stateful parts, so breaker counters and limiter windows
//! survive a reload.

use crate::bulkhead::Bulkhead;
use crate::circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitTransition};
use crate::clock::{Clock, MonotonicClock, SystemClock};
use crate::error::RetryTable;
use crate::policy::Policy;
use crate::rate_limit::RateLimiter;
use crate::retry::RetryCoordinator;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::store::KvStore;
use crate::timeout::TimeoutPolicy;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

const TARGET: &str = "resilience_policy::registry";

/// Errors from operator controls on the registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No runtime is loaded for the policy.
    #[error("policy '{name}' is not loaded")]
    UnknownPolicy { name: String },
    #[error("policy '{name}' has no circuit breaker")]
    NoCircuitBreaker { name: String },
}

/// Collaborators used to build runtime components.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Drives breaker open timeouts.
    pub breaker_clock: Arc<dyn Clock>,
    /// Drives rate-limit window boundaries.
    pub limiter_clock: Arc<dyn Clock>,
    pub sleeper: Arc<dyn Sleeper>,
    pub retry_table: RetryTable,
    /// Store for shared rate-limit counters; `None` counts locally only.
    pub shared_counters: Option<Arc<dyn KvStore>>,
    pub rate_limit_namespace: String,
    pub shared_counter_retry: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            breaker_clock: Arc::new(MonotonicClock::default()),
            limiter_clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            retry_table: RetryTable::default(),
            shared_counters: None,
            rate_limit_namespace: "ratelimit".to_string(),
            shared_counter_retry: Duration::from_secs(5),
        }
    }
}

/// Live components for one policy version.
#[derive(Debug)]
pub struct PolicyRuntime {
    policy: Policy,
    breaker: Option<Arc<CircuitBreaker>>,
    limiter: Option<Arc<RateLimiter>>,
    bulkhead: Option<Arc<Bulkhead>>,
    retry: RetryCoordinator,
    timeout: Option<TimeoutPolicy>,
}

impl PolicyRuntime {
    /// Build components for `policy`, reusing stateful ones from `previous` where the
    /// protection is still configured.
    fn build(policy: Policy, previous: Option<&PolicyRuntime>, settings: &RuntimeSettings) -> Self {
        let name = policy.name();

        let breaker = policy.circuit_breaker().map(|cfg| {
            match previous.and_then(|p| p.breaker.clone()) {
                Some(existing) => {
                    existing.update_config(*cfg);
                    existing
                }
                None => Arc::new(CircuitBreaker::with_clock(
                    name,
                    *cfg,
                    settings.breaker_clock.clone(),
                )),
            }
        });

        let limiter = policy.rate_limit().map(|cfg| {
            match previous.and_then(|p| p.limiter.clone()) {
                Some(existing) => {
                    existing.update_config(*cfg);
                    existing
                }
                None => {
                    let mut limiter = RateLimiter::new(name, *cfg)
                        .with_clock(settings.limiter_clock.clone())
                        .with_shared_retry(settings.shared_counter_retry);
                    if let Some(store) = &settings.shared_counters {
                        limiter = limiter.with_shared(store.clone(), settings.rate_limit_namespace.clone());
                    }
                    Arc::new(limiter)
                }
            }
        });

        let bulkhead = policy.bulkhead().map(|cfg| {
            match previous.and_then(|p| p.bulkhead.clone()) {
                Some(existing) if existing.update_config(*cfg) => existing,
                Some(_) => {
                    tracing::info!(
                        target: TARGET,
                        policy = name,
                        max_concurrent = cfg.max_concurrent(),
                        max_queue = cfg.max_queue(),
                        "bulkhead capacity changed, rebuilding"
                    );
                    Arc::new(Bulkhead::new(*cfg))
                }
                None => Arc::new(Bulkhead::new(*cfg)),
            }
        });

        let retry = policy
            .retry()
            .map_or_else(RetryCoordinator::single_attempt, RetryCoordinator::new)
            .with_sleeper(settings.sleeper.clone())
            .with_table(match policy.retry() {
                Some(_) => settings.retry_table,
                None => RetryTable::none(),
            });

        let timeout = policy.timeout().map(|cfg| TimeoutPolicy::new(*cfg));

        Self { policy, breaker, limiter, bulkhead, retry, timeout }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_deref()
    }

    pub fn limiter(&self) -> Option<&RateLimiter> {
        self.limiter.as_deref()
    }

    pub fn bulkhead(&self) -> Option<&Bulkhead> {
        self.bulkhead.as_deref()
    }

    pub fn retry(&self) -> &RetryCoordinator {
        &self.retry
    }

    pub fn timeout(&self) -> Option<&TimeoutPolicy> {
        self.timeout.as_ref()
    }

    fn is_revision_of(&self, policy: &Policy) -> bool {
        self.policy.version() == policy.version()
            && self.policy.created_at() == policy.created_at()
            && self.policy.updated_at() == policy.updated_at()
            && self.policy.same_settings(policy)
    }
}

/// Name-keyed map of [`PolicyRuntime`]s. Each runtime's state is independent; the map lock is
/// held only to look up or swap entries.
#[derive(Debug, Default)]
pub struct RuntimeRegistry {
    settings: RuntimeSettings,
    entries: RwLock<HashMap<String, Arc<PolicyRuntime>>>,
}

impl RuntimeRegistry {
    pub fn new(settings: RuntimeSettings) -> Self {
        Self { settings, entries: RwLock::new(HashMap::new()) }
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn get(&self, name: &str) -> Option<Arc<PolicyRuntime>> {
        self.read().get(name).cloned()
    }

    /// Runtime for a policy read from the repository, installing or refreshing it as needed.
    ///
    /// The repository copy always wins over whatever is loaded, including a copy with a higher
    /// version: a name deleted and saved again restarts at version 1. Stateful components are
    /// carried over either way.
    pub fn upsert(&self, policy: Policy) -> Arc<PolicyRuntime> {
        self.install(policy, PolicyRuntime::is_revision_of)
    }

    /// Runtime for a policy supplied directly by the caller.
    ///
    /// Revision metadata is not compared: the loaded runtime is reused only when its settings
    /// already match, otherwise the caller's settings are applied over the shared state.
    pub fn apply(&self, policy: Policy) -> Arc<PolicyRuntime> {
        self.install(policy, |current, policy| current.policy.same_settings(policy))
    }

    fn install(
        &self,
        policy: Policy,
        is_current: impl Fn(&PolicyRuntime, &Policy) -> bool,
    ) -> Arc<PolicyRuntime> {
        if let Some(current) = self.get(policy.name()) {
            if is_current(&current, &policy) {
                return current;
            }
        }

        let mut entries = self.write();
        let previous = entries.get(policy.name()).cloned();
        if let Some(current) = &previous {
            if is_current(current, &policy) {
                return current.clone();
            }
        }

        let name = policy.name().to_string();
        let version = policy.version();
        let runtime = Arc::new(PolicyRuntime::build(policy, previous.as_deref(), &self.settings));
        entries.insert(name.clone(), runtime.clone());
        tracing::debug!(
            target: TARGET,
            policy = %name,
            version,
            reloaded = previous.is_some(),
            "policy runtime installed"
        );
        runtime
    }

    /// Drop the runtime for `name`. Calls already holding it finish against the old state.
    pub fn remove(&self, name: &str) -> Option<Arc<PolicyRuntime>> {
        self.write().remove(name)
    }

    /// Breaker snapshot of every loaded policy that has one, sorted by name.
    pub fn circuit_states(&self) -> Vec<(String, CircuitSnapshot)> {
        let mut states: Vec<(String, CircuitSnapshot)> = self
            .read()
            .iter()
            .filter_map(|(name, rt)| rt.breaker().map(|b| (name.clone(), b.snapshot())))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    pub fn reset_circuit(&self, name: &str) -> Result<Option<CircuitTransition>, RegistryError> {
        let runtime =
            self.get(name).ok_or_else(|| RegistryError::UnknownPolicy { name: name.to_string() })?;
        let breaker = runtime
            .breaker()
            .ok_or_else(|| RegistryError::NoCircuitBreaker { name: name.to_string() })?;
        Ok(breaker.reset())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<PolicyRuntime>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<PolicyRuntime>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::policy::{BulkheadConfig, CircuitBreakerConfig, RateLimitAlgorithm, RateLimitConfig};
    use chrono::Utc;
    use tokio_util::sync::CancellationToken;

    fn breaker_cfg(threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(threshold, 1, Duration::from_secs(30), 1).unwrap()
    }

    fn revision(policy: Policy, version: u64) -> Policy {
        let now = Utc::now();
        policy.with_revision(version, now, now)
    }

    #[test]
    fn reload_keeps_breaker_state_and_applies_thresholds() {
        let registry = RuntimeRegistry::default();
        let v1 = revision(Policy::builder("db").circuit_breaker(breaker_cfg(5)).build().unwrap(), 1);
        let rt1 = registry.upsert(v1);
        rt1.breaker().unwrap().try_acquire().unwrap().record(false);

        let v2 = revision(Policy::builder("db").circuit_breaker(breaker_cfg(2)).build().unwrap(), 2);
        let rt2 = registry.upsert(v2);
        assert!(!Arc::ptr_eq(&rt1, &rt2));
        assert_eq!(rt2.breaker().unwrap().snapshot().consecutive_failures, 1);

        rt2.breaker().unwrap().try_acquire().unwrap().record(false);
        assert_eq!(rt1.breaker().unwrap().state(), CircuitState::Open);
    }

    #[test]
    fn same_revision_reuses_runtime() {
        let registry = RuntimeRegistry::default();
        let v2 = revision(Policy::builder("db").build().unwrap(), 2);
        let rt = registry.upsert(v2.clone());
        assert!(Arc::ptr_eq(&rt, &registry.upsert(v2)));
    }

    #[test]
    fn recreated_policy_replaces_higher_version() {
        let registry = RuntimeRegistry::default();
        let at = Utc::now();
        let old = Policy::builder("db").circuit_breaker(breaker_cfg(100)).build().unwrap();
        registry.upsert(old.with_revision(3, at, at));

        // Same timestamps as the deleted copy, as with a clock that has not moved.
        let recreated = Policy::builder("db").circuit_breaker(breaker_cfg(1)).build().unwrap();
        let rt = registry.upsert(recreated.with_revision(1, at, at));
        assert_eq!(rt.policy().version(), 1);
        assert_eq!(rt.breaker().unwrap().config().failure_threshold(), 1);
    }

    #[test]
    fn explicit_policy_applies_its_settings_over_any_version() {
        let registry = RuntimeRegistry::default();
        let stored = revision(Policy::builder("db").circuit_breaker(breaker_cfg(3)).build().unwrap(), 3);
        let loaded = registry.upsert(stored);
        loaded.breaker().unwrap().try_acquire().unwrap().record(false);

        let explicit = Policy::builder("db")
            .circuit_breaker(breaker_cfg(3))
            .bulkhead(BulkheadConfig::new(1, 0, Duration::ZERO).unwrap())
            .build()
            .unwrap();
        let rt = registry.apply(explicit.clone());
        assert!(rt.bulkhead().is_some());
        assert_eq!(rt.breaker().unwrap().snapshot().consecutive_failures, 1);
        assert!(Arc::ptr_eq(&rt, &registry.apply(explicit)));
    }

    #[tokio::test]
    async fn bulkhead_rebuilt_only_when_capacity_changes() {
        let registry = RuntimeRegistry::default();
        let with = |max, timeout_ms, version| {
            revision(
                Policy::builder("db")
                    .bulkhead(BulkheadConfig::new(max, 2, Duration::from_millis(timeout_ms)).unwrap())
                    .build()
                    .unwrap(),
                version,
            )
        };
        let rt1 = registry.upsert(with(4, 100, 1));
        let rt2 = registry.upsert(with(4, 900, 2));
        assert!(std::ptr::eq(rt1.bulkhead().unwrap(), rt2.bulkhead().unwrap()));
        assert_eq!(rt2.bulkhead().unwrap().config().queue_timeout(), Duration::from_millis(900));

        let held = rt2.bulkhead().unwrap().admit(&CancellationToken::new()).await.unwrap();
        let rt3 = registry.upsert(with(8, 900, 3));
        assert!(!std::ptr::eq(rt2.bulkhead().unwrap(), rt3.bulkhead().unwrap()));
        assert_eq!(rt3.bulkhead().unwrap().config().max_concurrent(), 8);
        // The permit taken before the rebuild stays on the old bulkhead.
        assert_eq!(rt2.bulkhead().unwrap().in_flight(), 1);
        assert_eq!(rt3.bulkhead().unwrap().in_flight(), 0);
        drop(held);
    }

    #[test]
    fn removed_protection_is_dropped() {
        let registry = RuntimeRegistry::default();
        let limit = RateLimitConfig::new(RateLimitAlgorithm::SlidingWindow, 10, Duration::from_secs(1), 0)
            .unwrap();
        registry.upsert(revision(Policy::builder("api").rate_limit(limit).build().unwrap(), 1));
        let rt = registry.upsert(revision(Policy::builder("api").build().unwrap(), 2));
        assert!(rt.limiter().is_none());
        assert_eq!(rt.retry().max_attempts(), 1);
    }

    #[test]
    fn operator_controls() {
        let registry = RuntimeRegistry::default();
        registry.upsert(revision(Policy::builder("b").circuit_breaker(breaker_cfg(1)).build().unwrap(), 1));
        registry.upsert(revision(Policy::builder("a").circuit_breaker(breaker_cfg(1)).build().unwrap(), 1));
        registry.upsert(revision(Policy::builder("plain").build().unwrap(), 1));

        let names: Vec<String> = registry.circuit_states().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "b"]);

        registry.get("a").unwrap().breaker().unwrap().try_acquire().unwrap().record(false);
        assert!(matches!(
            registry.reset_circuit("a"),
            Ok(Some(CircuitTransition::Reset { from: CircuitState::Open }))
        ));
        assert_eq!(
            registry.reset_circuit("plain"),
            Err(RegistryError::NoCircuitBreaker { name: "plain".into() })
        );
        assert_eq!(
            registry.reset_circuit("zzz"),
            Err(RegistryError::UnknownPolicy { name: "zzz".into() })
        );

        assert!(registry.remove("a").is_some());
        assert_eq!(registry.len(), 2);
    }
}
