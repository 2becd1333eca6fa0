//! Engine configuration.
//!
//! Every field has a default, so `{}` is a valid configuration. Durations use the same string
//! format as policy payloads (`"150ms"`, `"5m"`).
//!
//! ```
//! use resilience_policy::config::{EngineConfig, FailMode};
//! use std::time::Duration;
//!
//! let cfg = EngineConfig::from_json(r#"{"fail_mode": "fail_closed", "repository_cache": {"ttl": "30s"}}"#).unwrap();
//! assert_eq!(cfg.fail_mode, FailMode::FailClosed);
//! assert_eq!(cfg.repository_cache.ttl, Duration::from_secs(30));
//! assert_eq!(cfg.repository_cache.max_capacity, 1000);
//! ```

use crate::policy::duration::serde_str;
use crate::policy::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// What `execute` does when the policy cannot be loaded because the backing store is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailMode {
    /// Run the work once with no protection.
    FailOpen,
    /// Reject the call with `BackingStoreUnavailable`.
    FailClosed,
    /// Use the last policy this engine resolved for the name, however old.
    #[default]
    LastKnownGood,
}

impl FailMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailMode::FailOpen => "fail_open",
            FailMode::FailClosed => "fail_closed",
            FailMode::LastKnownGood => "last_known_good",
        }
    }
}

impl fmt::Display for FailMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy repository cache settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_capacity: u64,
    #[serde(with = "serde_str")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_capacity: 1000, ttl: Duration::from_secs(300) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub fail_mode: FailMode,
    /// Prefix of shared rate-limit counter keys.
    pub rate_limit_namespace: String,
    /// How long a limiter counts locally before trying the shared store again.
    #[serde(with = "serde_str")]
    pub shared_counter_retry: Duration,
    pub repository_cache: CacheConfig,
    /// Capacity of the policy change channel.
    pub watch_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fail_mode: FailMode::default(),
            rate_limit_namespace: "ratelimit".to_string(),
            shared_counter_retry: Duration::from_secs(5),
            repository_cache: CacheConfig::default(),
            watch_buffer: 256,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let cfg: EngineConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::new("engine", e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit_namespace.is_empty()
            || self.rate_limit_namespace.chars().any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(ConfigError::new(
                "rate_limit_namespace",
                "must be non-empty without whitespace",
            ));
        }
        if self.shared_counter_retry.is_zero() {
            return Err(ConfigError::new("shared_counter_retry", "must be > 0"));
        }
        if self.repository_cache.max_capacity == 0 {
            return Err(ConfigError::new("repository_cache.max_capacity", "must be >= 1"));
        }
        if self.repository_cache.ttl.is_zero() {
            return Err(ConfigError::new("repository_cache.ttl", "must be > 0"));
        }
        if self.watch_buffer == 0 {
            return Err(ConfigError::new("watch_buffer", "must be >= 1"));
        }
        Ok(())
    }
}
