use super::{
    policy_key, PolicyEvent, PolicyEventKind, PolicyRepository, PolicyWatch, RepositoryError,
    POLICY_SET_KEY,
};
use crate::clock::{Clock, SystemClock};
use crate::policy::{self, Policy};
use crate::store::KvStore;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const TARGET: &str = "resilience_policy::repository";

/// Repository backed by a [`KvStore`], the single source of truth for policies.
///
/// Writes are plain single-key sets: concurrent saves of one name from different processes are
/// last-write-wins.
#[derive(Debug)]
pub struct KvPolicyRepository {
    store: Arc<dyn KvStore>,
    events: broadcast::Sender<PolicyEvent>,
    clock: Arc<dyn Clock>,
}

impl KvPolicyRepository {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_buffer(store, 256)
    }

    /// `buffer` bounds how far a watcher may fall behind before skipping events.
    pub fn with_buffer(store: Arc<dyn KvStore>, buffer: usize) -> Self {
        let (events, _) = broadcast::channel(buffer.max(1));
        Self { store, events, clock: Arc::new(SystemClock) }
    }

    /// Timestamps written on save come from `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn load(&self, name: &str) -> Result<Option<Policy>, RepositoryError> {
        let Some(bytes) = self.store.get(&policy_key(name)).await? else {
            return Ok(None);
        };
        policy::decode(&bytes)
            .map(Some)
            .map_err(|source| RepositoryError::Decode { name: name.to_string(), source })
    }

    fn publish(&self, event: PolicyEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl PolicyRepository for KvPolicyRepository {
    async fn get(&self, name: &str) -> Result<Policy, RepositoryError> {
        tracing::debug!(target: TARGET, policy = name, "loading policy");
        self.load(name).await?.ok_or_else(|| RepositoryError::NotFound { name: name.to_string() })
    }

    async fn save(&self, policy: Policy) -> Result<Policy, RepositoryError> {
        let name = policy.name().to_string();
        let previous = match self.load(&name).await {
            Ok(previous) => previous,
            Err(RepositoryError::Decode { source, .. }) => {
                tracing::warn!(target: TARGET, policy = %name, error = %source, "overwriting undecodable policy");
                None
            }
            Err(e) => return Err(e),
        };

        let now = self.clock.now_utc();
        let (kind, saved) = match previous {
            Some(prev) => (
                PolicyEventKind::Updated,
                policy.with_revision(prev.version().saturating_add(1), prev.created_at(), now),
            ),
            None => (PolicyEventKind::Created, policy.with_revision(1, now, now)),
        };

        let bytes = policy::encode(&saved)
            .map_err(|source| RepositoryError::Encode { name: name.clone(), source })?;
        self.store.set(&policy_key(&name), bytes, None).await?;
        self.store.set_add(POLICY_SET_KEY, &name).await?;

        tracing::info!(target: TARGET, policy = %name, version = saved.version(), %kind, "policy saved");
        self.publish(PolicyEvent::saved(kind, saved.clone()));
        Ok(saved)
    }

    async fn delete(&self, name: &str) -> Result<(), RepositoryError> {
        let version = match self.load(name).await {
            Ok(Some(p)) => p.version(),
            Ok(None) => 0,
            Err(RepositoryError::Decode { .. }) => 0,
            Err(e) => return Err(e),
        };

        let existed = self.store.delete(&policy_key(name)).await?;
        self.store.set_remove(POLICY_SET_KEY, name).await?;
        if !existed {
            return Err(RepositoryError::NotFound { name: name.to_string() });
        }

        tracing::info!(target: TARGET, policy = name, version, "policy deleted");
        self.publish(PolicyEvent::deleted(name, version, self.clock.now_utc()));
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Policy>, RepositoryError> {
        let names = self.store.set_members(POLICY_SET_KEY).await?;
        let mut policies = Vec::with_capacity(names.len());
        for name in names {
            match self.load(&name).await {
                Ok(Some(p)) => policies.push(p),
                Ok(None) => {
                    tracing::warn!(target: TARGET, policy = %name, "listed policy vanished before fetch");
                }
                Err(RepositoryError::Decode { source, .. }) => {
                    tracing::error!(target: TARGET, policy = %name, error = %source, "skipping undecodable policy");
                }
                Err(e) => return Err(e),
            }
        }
        policies.sort_by(|a, b| a.name().cmp(b.name()));
        tracing::debug!(target: TARGET, count = policies.len(), "policies listed");
        Ok(policies)
    }

    async fn exists(&self, name: &str) -> Result<bool, RepositoryError> {
        Ok(self.store.get(&policy_key(name)).await?.is_some())
    }

    fn watch(&self, cancel: CancellationToken) -> PolicyWatch {
        PolicyWatch::new(self.events.subscribe(), cancel)
    }
}
