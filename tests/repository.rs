use futures::StreamExt;
use resilience_policy::config::CacheConfig;
use resilience_policy::repository::{
    CachedPolicyRepository, KvPolicyRepository, PolicyEventKind, PolicyRepository, RepositoryError,
};
use resilience_policy::{
    BulkheadConfig, Clock, InMemoryKvStore, KvStore, ManualClock, Policy, RetryConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn cache(ttl: Duration) -> CacheConfig {
    CacheConfig { max_capacity: 100, ttl }
}

fn retry(attempts: u32) -> RetryConfig {
    RetryConfig::new(attempts, Duration::from_millis(10), Duration::from_secs(1), 2.0, 10.0).unwrap()
}

#[tokio::test]
async fn save_then_get_round_trips_with_store_controlled_revision() {
    let store: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
    let clock = ManualClock::starting_at(1_700_000_000_000);
    let repo = CachedPolicyRepository::new(
        KvPolicyRepository::new(store).with_clock(Arc::new(clock.clone())),
        &cache(Duration::from_secs(300)),
    );

    let policy = Policy::builder("orders").retry(retry(3)).build().unwrap();
    let first = repo.save(policy.clone()).await.unwrap();
    assert_eq!(first.version(), 1);
    assert!(first.same_settings(&policy));
    assert_eq!(first.created_at(), clock.now_utc());

    clock.advance(60_000);
    let second = repo.save(first.clone().into_builder().retry(retry(5)).build().unwrap()).await.unwrap();
    assert_eq!(second.version(), 2);
    assert_eq!(second.created_at(), first.created_at());
    assert_eq!(second.updated_at(), clock.now_utc());

    assert_eq!(repo.get("orders").await.unwrap(), second);
    assert!(repo.exists("orders").await.unwrap());
    assert!(!repo.exists("nobody").await.unwrap());
}

#[tokio::test]
async fn list_bypasses_stale_cache_entries() {
    let store: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
    let reader = CachedPolicyRepository::new(KvPolicyRepository::new(store.clone()), &cache(Duration::from_secs(300)));
    let writer = KvPolicyRepository::new(store);

    writer.save(Policy::builder("a").build().unwrap()).await.unwrap();
    writer.save(Policy::builder("b").build().unwrap()).await.unwrap();
    reader.get("a").await.unwrap();

    writer.delete("a").await.unwrap();

    // Point lookups may serve the cached copy until the TTL runs out...
    assert_eq!(reader.get("a").await.unwrap().name(), "a");
    // ...but listing never does.
    let names: Vec<_> = reader.list().await.unwrap().into_iter().map(|p| p.name().to_string()).collect();
    assert_eq!(names, vec!["b"]);
}

#[tokio::test]
async fn deleting_through_the_cache_is_visible_immediately() {
    let store: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
    let repo = CachedPolicyRepository::new(KvPolicyRepository::new(store), &cache(Duration::from_secs(300)));
    repo.save(Policy::builder("gone").build().unwrap()).await.unwrap();
    repo.get("gone").await.unwrap();

    repo.delete("gone").await.unwrap();
    assert_eq!(repo.get("gone").await, Err(RepositoryError::NotFound { name: "gone".into() }));
    assert!(repo.delete("gone").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn cache_serves_reads_during_an_outage() {
    let store = Arc::new(InMemoryKvStore::new());
    let repo = CachedPolicyRepository::new(KvPolicyRepository::new(store.clone()), &cache(Duration::from_secs(300)));
    let bulkhead = BulkheadConfig::new(4, 0, Duration::ZERO).unwrap();
    repo.save(Policy::builder("cached").bulkhead(bulkhead).build().unwrap()).await.unwrap();

    store.set_available(false);
    assert_eq!(repo.get("cached").await.unwrap().name(), "cached");
    assert!(repo.get("uncached").await.unwrap_err().is_unavailable());
    assert!(repo.list().await.unwrap_err().is_unavailable());
    assert!(repo.save(Policy::builder("new").build().unwrap()).await.unwrap_err().is_unavailable());

    let stats = repo.stats().await;
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.entries, 1);
}

#[tokio::test]
async fn watch_streams_changes_until_cancelled() {
    let store: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
    let repo = KvPolicyRepository::new(store);
    let cancel = CancellationToken::new();
    let mut stream = Box::pin(repo.watch(cancel.clone()).into_stream());

    repo.save(Policy::builder("w").build().unwrap()).await.unwrap();
    repo.save(Policy::builder("w").retry(retry(2)).build().unwrap()).await.unwrap();
    repo.delete("w").await.unwrap();

    let events: Vec<_> = stream.as_mut().take(3).collect().await;
    let kinds: Vec<_> = events.iter().map(|e| (e.kind, e.version)).collect();
    assert_eq!(
        kinds,
        vec![(PolicyEventKind::Created, 1), (PolicyEventKind::Updated, 2), (PolicyEventKind::Deleted, 2)]
    );
    assert!(events[1].policy.as_ref().unwrap().retry().is_some());
    assert!(events[2].policy.is_none());

    cancel.cancel();
    repo.save(Policy::builder("after").build().unwrap()).await.unwrap();
    assert!(stream.next().await.is_none());
}
