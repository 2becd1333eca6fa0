//! Backing store client: a minimal key/value interface with per-key TTL.
//!
//! The repository keeps policies here and the rate limiter keeps shared window counters here.
//! Any store with single-key atomic writes and expiry (Redis is the reference deployment) can
//! implement [`KvStore`].

use crate::clock::{Clock, SystemClock};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Errors surfaced by a [`KvStore`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or timed out.
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
    /// The key holds a value of a different shape (e.g. a set where bytes were expected).
    #[error("key {key:?} holds a value of the wrong type")]
    WrongType { key: String },
    /// The key holds bytes that are not a decimal counter.
    #[error("key {key:?} does not hold an integer")]
    NotAnInteger { key: String },
}

/// Key/value operations the engine relies on.
#[async_trait]
pub trait KvStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write `value`; `ttl = None` keeps it until deleted.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Remove `key`; returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically increment a decimal counter, creating it at 1. `ttl` is applied when the
    /// counter is created.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Keys starting with `prefix`, in lexical order.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<u64>,
}

/// In-process [`KvStore`] with TTL support and a switch to simulate outages.
///
/// Clones share the same data.
#[derive(Debug, Clone)]
pub struct InMemoryKvStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    available: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Expiry is evaluated against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
            clock,
        }
    }

    /// Simulate an outage: while `false`, every operation fails with `Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Remaining TTL of `key`, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now_millis();
        let entries = self.lock();
        let expires_at = entries.get(key)?.expires_at?;
        Some(Duration::from_millis(expires_at.saturating_sub(now)))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock after checking availability, dropping expired entries on the way.
    fn live(&self) -> Result<(MutexGuard<'_, HashMap<String, Entry>>, u64), StoreError> {
        if !self.is_available() {
            return Err(StoreError::Unavailable("in-memory store marked unavailable".into()));
        }
        let now = self.clock.now_millis();
        let mut entries = self.lock();
        entries.retain(|_, e| e.expires_at.map_or(true, |at| at > now));
        Ok((entries, now))
    }

    fn expiry(now: u64, ttl: Duration) -> u64 {
        now.saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let (entries, _) = self.live()?;
        match entries.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Bytes(bytes)) => Ok(Some(bytes.clone())),
            Some(Value::Set(_)) => Err(StoreError::WrongType { key: key.to_string() }),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError> {
        let (mut entries, now) = self.live()?;
        let expires_at = ttl.map(|ttl| Self::expiry(now, ttl));
        entries.insert(key.to_string(), Entry { value: Value::Bytes(value), expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let (mut entries, _) = self.live()?;
        Ok(entries.remove(key).is_some())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let (mut entries, now) = self.live()?;
        match entries.get_mut(key) {
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Bytes(b"1".to_vec()),
                        expires_at: Some(Self::expiry(now, ttl)),
                    },
                );
                Ok(1)
            }
            Some(Entry { value: Value::Bytes(bytes), .. }) => {
                let current: u64 = std::str::from_utf8(bytes)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| StoreError::NotAnInteger { key: key.to_string() })?;
                let next = current.saturating_add(1);
                *bytes = next.to_string().into_bytes();
                Ok(next)
            }
            Some(_) => Err(StoreError::WrongType { key: key.to_string() }),
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let (mut entries, _) = self.live()?;
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry { value: Value::Set(BTreeSet::new()), expires_at: None });
        match &mut entry.value {
            Value::Set(members) => {
                members.insert(member.to_string());
                Ok(())
            }
            Value::Bytes(_) => Err(StoreError::WrongType { key: key.to_string() }),
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let (mut entries, _) = self.live()?;
        match entries.get_mut(key).map(|e| &mut e.value) {
            None => Ok(()),
            Some(Value::Set(members)) => {
                members.remove(member);
                if members.is_empty() {
                    entries.remove(key);
                }
                Ok(())
            }
            Some(Value::Bytes(_)) => Err(StoreError::WrongType { key: key.to_string() }),
        }
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let (entries, _) = self.live()?;
        match entries.get(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::Set(members)) => Ok(members.iter().cloned().collect()),
            Some(Value::Bytes(_)) => Err(StoreError::WrongType { key: key.to_string() }),
        }
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let (entries, _) = self.live()?;
        let mut keys: Vec<String> =
            entries.keys().filter(|k| k.starts_with(prefix)).cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn values_expire_with_ttl() {
        let clock = ManualClock::new();
        let store = InMemoryKvStore::with_clock(Arc::new(clock.clone()));
        store.set("a", b"1".to_vec(), Some(Duration::from_secs(10))).await.unwrap();
        store.set("b", b"2".to_vec(), None).await.unwrap();
        assert_eq!(store.ttl("a"), Some(Duration::from_secs(10)));

        clock.advance(10_000);
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.get("b").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn incr_creates_with_ttl_and_counts() {
        let clock = ManualClock::new();
        let store = InMemoryKvStore::with_clock(Arc::new(clock.clone()));
        assert_eq!(store.incr("c", Duration::from_secs(2)).await.unwrap(), 1);
        assert_eq!(store.incr("c", Duration::from_secs(2)).await.unwrap(), 2);
        assert_eq!(store.get("c").await.unwrap(), Some(b"2".to_vec()));

        clock.advance(2_000);
        assert_eq!(store.incr("c", Duration::from_secs(2)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sets_track_members() {
        let store = InMemoryKvStore::new();
        store.set_add("s", "b").await.unwrap();
        store.set_add("s", "a").await.unwrap();
        store.set_add("s", "a").await.unwrap();
        assert_eq!(store.set_members("s").await.unwrap(), vec!["a", "b"]);
        store.set_remove("s", "a").await.unwrap();
        assert_eq!(store.set_members("s").await.unwrap(), vec!["b"]);
        assert!(matches!(store.get("s").await, Err(StoreError::WrongType { .. })));
    }

    #[tokio::test]
    async fn scan_filters_by_prefix() {
        let store = InMemoryKvStore::new();
        store.set("p:2", vec![], None).await.unwrap();
        store.set("p:1", vec![], None).await.unwrap();
        store.set("q:1", vec![], None).await.unwrap();
        assert_eq!(store.scan("p:").await.unwrap(), vec!["p:1", "p:2"]);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_operation() {
        let store = InMemoryKvStore::new();
        store.set("k", b"v".to_vec(), None).await.unwrap();
        store.set_available(false);
        assert!(matches!(store.get("k").await, Err(StoreError::Unavailable(_))));
        assert!(matches!(store.incr("n", Duration::from_secs(1)).await, Err(StoreError::Unavailable(_))));
        store.set_available(true);
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
    }
}
