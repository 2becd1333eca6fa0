//! The resilience engine: resolves a policy by name and runs a unit of work through its gates.
//!
//! Gate order is fixed so cheap rejections happen before scarce resources are taken:
//!
//! 1. rate limiter (`RateLimited`)
//! 2. bulkhead (`BulkheadFull`, `QueueTimeout`; may queue)
//! 3. circuit breaker (`CircuitOpen`; the work is not invoked)
//! 4. retry coordinator, each attempt under the policy timeout
//! 5. the final outcome is recorded in the breaker
//!
//! Permits are RAII guards, so the bulkhead slot and any half-open probe slot are released on
//! every exit path, including cancellation and panics.
//!
//! ```
//! use resilience_policy::{CallContext, Policy, ResilienceEngine, RetryConfig};
//! use resilience_policy::repository::PolicyRepository;
//! use resilience_policy::store::InMemoryKvStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let engine = ResilienceEngine::builder()
//!     .store(Arc::new(InMemoryKvStore::new()))
//!     .build()
//!     .unwrap();
//! let retry = RetryConfig::new(3, Duration::from_millis(1), Duration::from_millis(10), 2.0, 0.0).unwrap();
//! engine
//!     .repository()
//!     .save(Policy::builder("inventory").retry(retry).build().unwrap())
//!     .await
//!     .unwrap();
//!
//! let ctx = CallContext::new();
//! let stock = engine
//!     .execute(&ctx, "inventory", || async { Ok::<_, std::io::Error>(42) })
//!     .await
//!     .unwrap();
//! assert_eq!(stock, 42);
//! # }
//! ```

use crate::bulkhead::BulkheadRejection;
use crate::circuit_breaker::{CircuitSnapshot, CircuitTransition};
use crate::clock::Clock;
use crate::config::{EngineConfig, FailMode};
use crate::error::{Classify, ErrorKind, ResilienceError, RetryTable};
use crate::policy::{ConfigError, Policy};
use crate::rate_limit::Decision;
use crate::registry::{PolicyRuntime, RegistryError, RuntimeRegistry, RuntimeSettings};
use crate::repository::{
    CachedPolicyRepository, KvPolicyRepository, PolicyEvent, PolicyEventKind, PolicyRepository,
    RepositoryError,
};
use crate::sleeper::Sleeper;
use crate::store::KvStore;
use crate::telemetry::{
    emit_best_effort, BulkheadEvent, CircuitBreakerEvent, NullSink, RateLimitEvent,
    RequestOutcome, ResilienceEvent, RetryEvent, TelemetryEvent, TelemetrySink, TimeoutEvent,
};
use crate::timeout;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

const TARGET: &str = "resilience_policy::engine";

/// Per-call inputs: correlation id, cancellation, rate-limit key and timeout override.
#[derive(Debug, Clone)]
pub struct CallContext {
    correlation_id: String,
    cancel: CancellationToken,
    rate_limit_key: String,
    timeout: Option<Duration>,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CallContext {
    /// Fresh context with a random correlation id.
    pub fn new() -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            cancel: CancellationToken::new(),
            rate_limit_key: "default".to_string(),
            timeout: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Key the rate limiter counts under (e.g. a tenant or client id).
    pub fn with_rate_limit_key(mut self, key: impl Into<String>) -> Self {
        self.rate_limit_key = key.into();
        self
    }

    /// Per-attempt timeout; clamped to the policy's `max_timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn rate_limit_key(&self) -> &str {
        &self.rate_limit_key
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

enum RepositorySource {
    Repository(Arc<dyn PolicyRepository>),
    Store(Arc<dyn KvStore>),
}

/// Builder for [`ResilienceEngine`].
pub struct EngineBuilder<S> {
    source: Option<RepositorySource>,
    config: EngineConfig,
    sink: S,
    settings: RuntimeSettings,
    shared_counters: Option<Option<Arc<dyn KvStore>>>,
}

impl EngineBuilder<NullSink> {
    fn new() -> Self {
        Self {
            source: None,
            config: EngineConfig::default(),
            sink: NullSink,
            settings: RuntimeSettings::default(),
            shared_counters: None,
        }
    }
}

impl<S> EngineBuilder<S> {
    /// Resolve policies through `repository` as-is.
    pub fn repository(mut self, repository: Arc<dyn PolicyRepository>) -> Self {
        self.source = Some(RepositorySource::Repository(repository));
        self
    }

    /// Keep policies in `store` behind a cache sized by `EngineConfig::repository_cache`.
    /// The store also holds shared rate-limit counters unless [`Self::shared_counters`] says
    /// otherwise.
    pub fn store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.source = Some(RepositorySource::Store(store));
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Where rate limiters keep shared counters; `None` counts per instance only.
    pub fn shared_counters(mut self, store: Option<Arc<dyn KvStore>>) -> Self {
        self.shared_counters = Some(store);
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.settings.sleeper = sleeper;
        self
    }

    pub fn breaker_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.settings.breaker_clock = clock;
        self
    }

    pub fn limiter_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.settings.limiter_clock = clock;
        self
    }

    pub fn retry_table(mut self, table: RetryTable) -> Self {
        self.settings.retry_table = table;
        self
    }

    pub fn sink<S2>(self, sink: S2) -> EngineBuilder<S2> {
        EngineBuilder {
            source: self.source,
            config: self.config,
            sink,
            settings: self.settings,
            shared_counters: self.shared_counters,
        }
    }

    pub fn build(self) -> Result<ResilienceEngine<S>, ConfigError> {
        self.config.validate()?;
        let mut settings = self.settings;
        settings.rate_limit_namespace = self.config.rate_limit_namespace.clone();
        settings.shared_counter_retry = self.config.shared_counter_retry;

        let repository: Arc<dyn PolicyRepository> = match self.source {
            Some(RepositorySource::Repository(repository)) => {
                settings.shared_counters = self.shared_counters.flatten();
                repository
            }
            Some(RepositorySource::Store(store)) => {
                settings.shared_counters =
                    self.shared_counters.unwrap_or_else(|| Some(store.clone()));
                let kv = KvPolicyRepository::with_buffer(store, self.config.watch_buffer);
                Arc::new(CachedPolicyRepository::new(kv, &self.config.repository_cache))
            }
            None => return Err(ConfigError::new("repository", "a repository or store is required")),
        };

        Ok(ResilienceEngine {
            repository,
            registry: RuntimeRegistry::new(settings),
            config: self.config,
            sink: self.sink,
        })
    }
}

/// Composition root consulted by every protected call.
pub struct ResilienceEngine<S = NullSink> {
    repository: Arc<dyn PolicyRepository>,
    registry: RuntimeRegistry,
    config: EngineConfig,
    sink: S,
}

impl<S> std::fmt::Debug for ResilienceEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceEngine")
            .field("repository", &self.repository)
            .field("config", &self.config)
            .field("loaded_policies", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl ResilienceEngine<NullSink> {
    pub fn builder() -> EngineBuilder<NullSink> {
        EngineBuilder::new()
    }
}

enum Resolved {
    Protected(Arc<PolicyRuntime>),
    /// Fail-open while the store is unreachable.
    Unprotected,
}

impl<S> ResilienceEngine<S>
where
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    pub fn repository(&self) -> &Arc<dyn PolicyRepository> {
        &self.repository
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &RuntimeRegistry {
        &self.registry
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Run `work` under the policy stored as `name`.
    ///
    /// `work` is called once per attempt and must be safe to repeat when the policy retries.
    ///
    /// # Errors
    /// - `PolicyNotFound`, `InvalidConfig`/`Decode` when the policy cannot be resolved;
    /// - `BackingStoreUnavailable` when the store is down and the fail mode gives no policy;
    /// - any rejection or failure from [`Self::execute_with_policy`].
    pub async fn execute<T, E, F, Fut>(
        &self,
        ctx: &CallContext,
        name: &str,
        work: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: Classify + Send,
    {
        let span = tracing::info_span!(
            target: TARGET,
            "resilience.execute",
            policy = %name,
            correlation_id = %ctx.correlation_id()
        );
        async move {
            let started = Instant::now();
            let result = match self.resolve(ctx, name).await {
                Ok(Resolved::Protected(runtime)) => self.run_gates(ctx, &runtime, work).await,
                Ok(Resolved::Unprotected) => self.run_unprotected(ctx, work).await,
                Err(e) => Err(e),
            };
            self.finish(ctx, name, started, result).await
        }
        .instrument(span)
        .await
    }

    /// Run `work` under an explicit policy, bypassing the repository.
    ///
    /// The policy's settings always apply, whatever version the repository holds for the same
    /// name. Runtime state (breaker counters, limiter windows, bulkhead permits) is shared with
    /// calls made by name, and the next call by name applies the repository settings again.
    pub async fn execute_with_policy<T, E, F, Fut>(
        &self,
        ctx: &CallContext,
        policy: &Policy,
        work: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: Classify + Send,
    {
        let name = policy.name();
        let span = tracing::info_span!(
            target: TARGET,
            "resilience.execute",
            policy = %name,
            correlation_id = %ctx.correlation_id()
        );
        async move {
            let started = Instant::now();
            let runtime = self.registry.apply(policy.clone());
            let result = self.run_gates(ctx, &runtime, work).await;
            self.finish(ctx, name, started, result).await
        }
        .instrument(span)
        .await
    }

    async fn resolve<E>(&self, ctx: &CallContext, name: &str) -> Result<Resolved, ResilienceError<E>> {
        let reason = match self.repository.get(name).await {
            Ok(policy) => return Ok(Resolved::Protected(self.registry.upsert(policy))),
            Err(RepositoryError::Unavailable(reason)) => reason,
            Err(e) => {
                if e.is_not_found() && self.registry.remove(name).is_some() {
                    tracing::info!(target: TARGET, policy = %name, "policy no longer stored, runtime dropped");
                }
                tracing::warn!(
                    target: TARGET,
                    policy = %name,
                    correlation_id = %ctx.correlation_id(),
                    error = %e,
                    "policy could not be resolved"
                );
                return Err(e.into());
            }
        };

        let fail_mode = self.config.fail_mode;
        let fallback = match fail_mode {
            FailMode::FailOpen => Some(Resolved::Unprotected),
            FailMode::FailClosed => None,
            FailMode::LastKnownGood => self.registry.get(name).map(Resolved::Protected),
        };
        tracing::warn!(
            target: TARGET,
            policy = %name,
            correlation_id = %ctx.correlation_id(),
            %fail_mode,
            fallback = fallback.is_some(),
            %reason,
            "policy store unavailable"
        );
        fallback.ok_or(ResilienceError::BackingStoreUnavailable { reason })
    }

    async fn run_unprotected<T, E, F, Fut>(
        &self,
        ctx: &CallContext,
        mut work: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => Err(ResilienceError::Cancelled),
            result = work() => result.map_err(ResilienceError::Inner),
        }
    }

    async fn run_gates<T, E, F, Fut>(
        &self,
        ctx: &CallContext,
        runtime: &PolicyRuntime,
        mut work: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: Classify + Send,
    {
        let name = runtime.policy().name();

        if let Some(limiter) = runtime.limiter() {
            let check = limiter.check(ctx.rate_limit_key()).await;
            if let Some(mode) = check.mode_change {
                self.emit(ctx, name, RateLimitEvent::ModeChanged { mode }).await;
            }
            if let Decision::Denied { retry_after } = check.decision {
                self.rejected(ctx, name, ErrorKind::RateLimited, RateLimitEvent::Rejected { retry_after })
                    .await;
                return Err(ResilienceError::RateLimited { retry_after });
            }
        }

        let _bulkhead_permit = match runtime.bulkhead() {
            None => None,
            Some(bulkhead) => match bulkhead.admit(ctx.cancellation()).await {
                Ok(permit) => {
                    let max = bulkhead.config().max_concurrent();
                    self.emit(ctx, name, BulkheadEvent::Acquired { in_flight: bulkhead.in_flight(), max })
                        .await;
                    if let Some(waited) = permit.waited() {
                        let depth = bulkhead.queue_depth();
                        self.emit(ctx, name, BulkheadEvent::Queued { waited, depth }).await;
                    }
                    Some(permit)
                }
                Err(BulkheadRejection::Full { in_flight, max, queued }) => {
                    self.rejected(
                        ctx,
                        name,
                        ErrorKind::BulkheadFull,
                        BulkheadEvent::Rejected { in_flight, max, queued },
                    )
                    .await;
                    return Err(ResilienceError::BulkheadFull { in_flight, max, queued });
                }
                Err(BulkheadRejection::QueueTimeout { waited }) => {
                    self.rejected(ctx, name, ErrorKind::QueueTimeout, BulkheadEvent::QueueTimeout { waited })
                        .await;
                    return Err(ResilienceError::QueueTimeout { waited });
                }
                Err(BulkheadRejection::Cancelled) => return Err(ResilienceError::Cancelled),
            },
        };

        let breaker_permit = match runtime.breaker() {
            None => None,
            Some(breaker) => match breaker.try_acquire() {
                Ok(permit) => {
                    if let Some(transition) = permit.transition() {
                        self.emit(ctx, name, CircuitBreakerEvent::from(transition)).await;
                    }
                    Some(permit)
                }
                Err(rejection) => {
                    self.rejected(
                        ctx,
                        name,
                        ErrorKind::CircuitOpen,
                        CircuitBreakerEvent::Rejected {
                            failure_count: rejection.failure_count,
                            retry_after: rejection.retry_after,
                        },
                    )
                    .await;
                    return Err(ResilienceError::CircuitOpen {
                        policy: name.to_string(),
                        failure_count: rejection.failure_count,
                        retry_after: rejection.retry_after,
                    });
                }
            },
        };

        let policy_timeout = runtime.timeout();
        let requested = ctx.timeout();
        let started = Instant::now();
        let mut retries = Vec::new();
        let result = runtime
            .retry()
            .execute(
                ctx.cancellation(),
                |_attempt| {
                    let call = work();
                    async move {
                        let attempt = async { call.await.map_err(ResilienceError::Inner) };
                        let outcome = match (policy_timeout, requested) {
                            (Some(policy), requested) => policy.run(requested, attempt).await,
                            (None, Some(limit)) if !limit.is_zero() => {
                                timeout::with_limit(limit, attempt).await
                            }
                            (None, _) => attempt.await,
                        };
                        if let Err(ResilienceError::Timeout { timeout, .. }) = &outcome {
                            self.emit(ctx, name, TimeoutEvent::Occurred { timeout: *timeout }).await;
                        }
                        outcome
                    }
                },
                |attempt| retries.push(attempt),
            )
            .await;

        for r in retries {
            self.emit(ctx, name, RetryEvent::Attempt { attempt: r.attempt, delay: r.delay, cause: r.cause })
                .await;
        }
        if let Err(ResilienceError::RetryExhausted { attempts, .. }) = &result {
            self.emit(
                ctx,
                name,
                RetryEvent::Exhausted { attempts: *attempts, total_duration: started.elapsed() },
            )
            .await;
        }

        if let Some(permit) = breaker_permit {
            let transition = match &result {
                Err(e) if e.is_cancelled() => None,
                Ok(_) => permit.record(true),
                Err(_) => permit.record(false),
            };
            if let Some(transition) = transition {
                self.emit(ctx, name, CircuitBreakerEvent::from(transition)).await;
            }
        }

        result
    }

    async fn finish<T, E: Classify>(
        &self,
        ctx: &CallContext,
        name: &str,
        started: Instant,
        result: Result<T, ResilienceError<E>>,
    ) -> Result<T, ResilienceError<E>> {
        let duration = started.elapsed();
        let outcome = match &result {
            Ok(_) => RequestOutcome::Success { duration },
            Err(e) => RequestOutcome::Failure { duration, kind: e.kind() },
        };
        self.emit(ctx, name, outcome).await;
        result
    }

    async fn rejected(
        &self,
        ctx: &CallContext,
        name: &str,
        kind: ErrorKind,
        event: impl Into<ResilienceEvent>,
    ) {
        let event = event.into();
        tracing::warn!(
            target: TARGET,
            policy = %name,
            correlation_id = %ctx.correlation_id(),
            kind = %kind,
            detail = %event,
            "call rejected"
        );
        self.emit(ctx, name, event).await;
    }

    async fn emit(&self, ctx: &CallContext, name: &str, event: impl Into<ResilienceEvent>) {
        emit_best_effort(self.sink.clone(), TelemetryEvent::new(name, ctx.correlation_id(), event))
            .await;
    }

    /// Apply a repository change to the loaded runtimes.
    ///
    /// Created/updated events carrying the policy swap it in without resetting breaker or
    /// limiter state; events without a body evict the runtime so the next call reloads it.
    pub fn apply_event(&self, event: PolicyEvent) {
        match (event.kind, event.policy) {
            (PolicyEventKind::Created | PolicyEventKind::Updated, Some(policy)) => {
                let runtime = self.registry.upsert(policy);
                tracing::info!(
                    target: TARGET,
                    policy = %event.policy_name,
                    version = runtime.policy().version(),
                    kind = %event.kind,
                    "policy reloaded"
                );
            }
            (kind, _) => {
                let dropped = self.registry.remove(&event.policy_name).is_some();
                tracing::info!(
                    target: TARGET,
                    policy = %event.policy_name,
                    version = event.version,
                    %kind,
                    dropped,
                    "policy runtime evicted"
                );
            }
        }
    }

    /// Breaker snapshot of every loaded policy, sorted by name.
    pub fn circuit_states(&self) -> Vec<(String, CircuitSnapshot)> {
        self.registry.circuit_states()
    }

    /// Force the named policy's breaker closed.
    pub async fn reset_circuit(&self, name: &str) -> Result<Option<CircuitTransition>, RegistryError> {
        let transition = self.registry.reset_circuit(name)?;
        if let Some(transition) = transition {
            emit_best_effort(
                self.sink.clone(),
                TelemetryEvent::new(name, "operator", CircuitBreakerEvent::from(transition)),
            )
            .await;
        }
        Ok(transition)
    }

    /// Drop the runtime state of `name`; the next call rebuilds it from the repository.
    pub fn evict(&self, name: &str) -> bool {
        self.registry.remove(name).is_some()
    }

    /// Follow the repository's change stream until `cancel` fires.
    pub fn spawn_watcher(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let mut watch = self.repository.watch(cancel);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = watch.recv().await {
                engine.apply_event(event);
            }
            tracing::debug!(target: TARGET, "policy watcher stopped");
        })
    }
}
