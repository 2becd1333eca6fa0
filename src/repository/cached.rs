use super::{PolicyRepository, PolicyWatch, RepositoryError};
use crate::config::CacheConfig;
use crate::policy::Policy;
use async_trait::async_trait;
use moka::future::Cache;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

const TARGET: &str = "resilience_policy::repository";

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Cache-aside decorator over any [`PolicyRepository`].
///
/// Point lookups (`get`, `exists`) may be stale for up to the cache TTL when another process
/// writes the same policy. `list` always goes to the inner repository. Errors are never cached.
pub struct CachedPolicyRepository<R> {
    inner: R,
    cache: Cache<String, Policy>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<R: PolicyRepository> CachedPolicyRepository<R> {
    pub fn new(inner: R, config: &CacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(config.ttl)
            .build();
        Self { inner, cache, hits: AtomicU64::new(0), misses: AtomicU64::new(0) }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub async fn stats(&self) -> CacheStats {
        self.cache.run_pending_tasks().await;
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.cache.entry_count(),
        }
    }
}

impl<R: fmt::Debug> fmt::Debug for CachedPolicyRepository<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedPolicyRepository")
            .field("inner", &self.inner)
            .field("entries", &self.cache.entry_count())
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("misses", &self.misses.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl<R: PolicyRepository> PolicyRepository for CachedPolicyRepository<R> {
    async fn get(&self, name: &str) -> Result<Policy, RepositoryError> {
        if let Some(policy) = self.cache.get(name).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(target: TARGET, policy = name, "policy cache hit");
            return Ok(policy);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(target: TARGET, policy = name, "policy cache miss");

        let policy = self.inner.get(name).await?;
        self.cache.insert(name.to_string(), policy.clone()).await;
        Ok(policy)
    }

    async fn save(&self, policy: Policy) -> Result<Policy, RepositoryError> {
        let saved = self.inner.save(policy).await?;
        self.cache.insert(saved.name().to_string(), saved.clone()).await;
        Ok(saved)
    }

    async fn delete(&self, name: &str) -> Result<(), RepositoryError> {
        self.cache.invalidate(name).await;
        self.inner.delete(name).await
    }

    async fn list(&self) -> Result<Vec<Policy>, RepositoryError> {
        self.inner.list().await
    }

    async fn exists(&self, name: &str) -> Result<bool, RepositoryError> {
        if self.cache.contains_key(name) {
            return Ok(true);
        }
        self.inner.exists(name).await
    }

    fn watch(&self, cancel: CancellationToken) -> PolicyWatch {
        self.inner.watch(cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::KvPolicyRepository;
    use crate::store::InMemoryKvStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn cached(ttl: Duration) -> (CachedPolicyRepository<KvPolicyRepository>, InMemoryKvStore) {
        let store = InMemoryKvStore::new();
        let inner = KvPolicyRepository::new(Arc::new(store.clone()));
        (CachedPolicyRepository::new(inner, &CacheConfig { max_capacity: 100, ttl }), store)
    }

    #[tokio::test]
    async fn second_get_is_served_from_cache() {
        let (repo, store) = cached(Duration::from_secs(300));
        repo.inner().save(Policy::builder("orders").build().unwrap()).await.unwrap();

        repo.get("orders").await.unwrap();
        store.set_available(false);
        let cached = repo.get("orders").await.unwrap();
        assert_eq!(cached.name(), "orders");
        assert!(repo.exists("orders").await.unwrap());

        let stats = repo.stats().await;
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[tokio::test]
    async fn save_writes_through_and_refreshes_entry() {
        let (repo, store) = cached(Duration::from_secs(300));
        repo.save(Policy::builder("orders").build().unwrap()).await.unwrap();
        let saved = repo.save(Policy::builder("orders").build().unwrap()).await.unwrap();
        assert_eq!(saved.version(), 2);

        store.set_available(false);
        assert_eq!(repo.get("orders").await.unwrap().version(), 2);
    }

    #[tokio::test]
    async fn delete_invalidates_before_delegating() {
        let (repo, _) = cached(Duration::from_secs(300));
        repo.save(Policy::builder("orders").build().unwrap()).await.unwrap();
        repo.delete("orders").await.unwrap();
        assert!(repo.get("orders").await.unwrap_err().is_not_found());
        assert!(!repo.exists("orders").await.unwrap());
    }

    #[tokio::test]
    async fn list_bypasses_cache() {
        let (repo, store) = cached(Duration::from_secs(300));
        repo.save(Policy::builder("orders").build().unwrap()).await.unwrap();
        store.set_available(false);
        assert!(repo.list().await.unwrap_err().is_unavailable());
    }

    #[tokio::test]
    async fn stale_read_until_ttl_then_refetched() {
        let (repo, store) = cached(Duration::from_millis(50));
        let other_process = KvPolicyRepository::new(Arc::new(store.clone()));
        repo.save(Policy::builder("orders").build().unwrap()).await.unwrap();
        other_process.save(Policy::builder("orders").build().unwrap()).await.unwrap();

        assert_eq!(repo.get("orders").await.unwrap().version(), 1);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(repo.get("orders").await.unwrap().version(), 2);
    }
}
