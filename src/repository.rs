//! Policy persistence.
//!
//! [`PolicyRepository`] is the contract the engine resolves policies through.
//! [`KvPolicyRepository`] keeps policies in a [`KvStore`](crate::store::KvStore) and
//! [`CachedPolicyRepository`] decorates any repository with a bounded TTL cache.
//!
//! Key layout:
//!
//! | Key | Value |
//! |---|---|
//! | `resilience:policy:{name}` | policy JSON (see [`crate::policy::codec`]) |
//! | `resilience:policies` | set of every policy name |

use crate::policy::{CodecError, Policy};
use crate::store::StoreError;
use crate::ResilienceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;

pub mod cached;
pub mod kv;
pub mod watch;

pub use cached::{CacheStats, CachedPolicyRepository};
pub use kv::KvPolicyRepository;
pub use watch::PolicyWatch;

/// Prefix of every stored policy key.
pub const POLICY_KEY_PREFIX: &str = "resilience:policy:";
/// Set holding the name of every stored policy.
pub const POLICY_SET_KEY: &str = "resilience:policies";

pub fn policy_key(name: &str) -> String {
    format!("{POLICY_KEY_PREFIX}{name}")
}

/// What happened to a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyEventKind {
    Created,
    Updated,
    Deleted,
}

impl PolicyEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyEventKind::Created => "created",
            PolicyEventKind::Updated => "updated",
            PolicyEventKind::Deleted => "deleted",
        }
    }
}

impl fmt::Display for PolicyEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Change notification published by [`PolicyRepository::watch`].
///
/// Serializes as `{"kind", "policy_name", "version", "timestamp"}`. In-process subscribers also
/// receive the saved policy for created/updated events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyEvent {
    pub kind: PolicyEventKind,
    pub policy_name: String,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub policy: Option<Policy>,
}

impl PolicyEvent {
    /// Created/updated event carrying `policy`.
    pub fn saved(kind: PolicyEventKind, policy: Policy) -> Self {
        Self {
            kind,
            policy_name: policy.name().to_string(),
            version: policy.version(),
            timestamp: policy.updated_at(),
            policy: Some(policy),
        }
    }

    pub fn deleted(name: impl Into<String>, version: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: PolicyEventKind::Deleted,
            policy_name: name.into(),
            version,
            timestamp,
            policy: None,
        }
    }
}

/// Repository failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("policy {name:?} not found")]
    NotFound { name: String },
    /// The backing store failed; distinct from a missing policy.
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
    #[error("stored policy {name:?} could not be decoded: {source}")]
    Decode {
        name: String,
        #[source]
        source: CodecError,
    },
    #[error("policy {name:?} could not be encoded: {source}")]
    Encode {
        name: String,
        #[source]
        source: CodecError,
    },
}

impl RepositoryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RepositoryError::NotFound { .. })
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, RepositoryError::Unavailable(_))
    }
}

impl From<StoreError> for RepositoryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(reason) => RepositoryError::Unavailable(reason),
            other => RepositoryError::Unavailable(other.to_string()),
        }
    }
}

impl<E> From<RepositoryError> for ResilienceError<E> {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::NotFound { name } => ResilienceError::PolicyNotFound { name },
            RepositoryError::Unavailable(reason) => {
                ResilienceError::BackingStoreUnavailable { reason }
            }
            RepositoryError::Decode { source, .. } | RepositoryError::Encode { source, .. } => {
                source.into()
            }
        }
    }
}

/// Storage contract for policies.
#[async_trait]
pub trait PolicyRepository: Send + Sync + fmt::Debug {
    async fn get(&self, name: &str) -> Result<Policy, RepositoryError>;

    /// Persist `policy` and return the stored copy with its new version and timestamps.
    async fn save(&self, policy: Policy) -> Result<Policy, RepositoryError>;

    /// Remove a policy; `NotFound` if it does not exist.
    async fn delete(&self, name: &str) -> Result<(), RepositoryError>;

    /// Every stored policy, sorted by name.
    async fn list(&self) -> Result<Vec<Policy>, RepositoryError>;

    async fn exists(&self, name: &str) -> Result<bool, RepositoryError>;

    /// Subscribe to changes made through this repository until `cancel` fires.
    fn watch(&self, cancel: CancellationToken) -> PolicyWatch;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ConfigError;

    #[test]
    fn event_serializes_wire_fields_only() {
        let policy = Policy::builder("orders").build().unwrap();
        let event = PolicyEvent::saved(PolicyEventKind::Created, policy);
        let json = serde_json::to_value(&event).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 4);
        assert_eq!(obj["kind"], "created");
        assert_eq!(obj["policy_name"], "orders");
        assert_eq!(obj["version"], 1);
        assert!(obj["timestamp"].is_string());

        let back: PolicyEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind, PolicyEventKind::Created);
        assert!(back.policy.is_none());
    }

    #[test]
    fn repository_errors_map_to_engine_errors() {
        let not_found: ResilienceError<std::io::Error> =
            RepositoryError::NotFound { name: "x".into() }.into();
        assert!(matches!(not_found, ResilienceError::PolicyNotFound { ref name } if name == "x"));

        let down: ResilienceError<std::io::Error> = RepositoryError::Unavailable("down".into()).into();
        assert!(matches!(down, ResilienceError::BackingStoreUnavailable { .. }));

        let invalid: ResilienceError<std::io::Error> = RepositoryError::Decode {
            name: "x".into(),
            source: CodecError::Invalid(ConfigError::new("retry.max_attempts", "must be >= 1")),
        }
        .into();
        assert!(matches!(invalid, ResilienceError::InvalidConfig(_)));
    }

    #[test]
    fn store_errors_are_unavailable() {
        let e: RepositoryError = StoreError::NotAnInteger { key: "k".into() }.into();
        assert!(e.is_unavailable());
        assert!(!e.is_not_found());
    }
}
