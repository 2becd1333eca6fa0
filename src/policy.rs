//! The policy aggregate: a named, versioned bundle of resilience settings.
//!
//! A missing sub-configuration disables that protection for every call made under the policy.

pub mod codec;
pub mod configs;
pub mod duration;

pub use codec::{decode, encode, CodecError};
pub use configs::{
    BulkheadConfig, CircuitBreakerConfig, ConfigError, RateLimitAlgorithm, RateLimitConfig,
    RetryConfig, TimeoutConfig,
};

use chrono::{DateTime, Utc};

/// Longest accepted policy name, in bytes.
pub const MAX_NAME_LEN: usize = 128;

/// Named, versioned resilience configuration.
///
/// `version`, `created_at` and `updated_at` are controlled by the repository on save; callers
/// build policies through [`Policy::builder`].
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    name: String,
    version: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    circuit_breaker: Option<CircuitBreakerConfig>,
    retry: Option<RetryConfig>,
    timeout: Option<TimeoutConfig>,
    rate_limit: Option<RateLimitConfig>,
    bulkhead: Option<BulkheadConfig>,
}

impl Policy {
    /// Start building a policy named `name`.
    ///
    /// # Examples
    /// ```
    /// use resilience_policy::{Policy, RetryConfig};
    /// use std::time::Duration;
    ///
    /// let policy = Policy::builder("payments-db")
    ///     .retry(RetryConfig::new(3, Duration::from_millis(100), Duration::from_secs(2), 2.0, 20.0).unwrap())
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(policy.version(), 1);
    /// assert!(policy.circuit_breaker().is_none());
    /// ```
    pub fn builder(name: impl Into<String>) -> PolicyBuilder {
        PolicyBuilder::new(name.into())
    }

    /// Rebuild from this policy, keeping name, version and timestamps.
    pub fn into_builder(self) -> PolicyBuilder {
        PolicyBuilder { policy: self }
    }

    /// Copy of this policy carrying store-controlled metadata.
    pub fn with_revision(
        mut self,
        version: u64,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        self.version = version;
        self.created_at = created_at;
        self.updated_at = updated_at;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreakerConfig> {
        self.circuit_breaker.as_ref()
    }

    pub fn retry(&self) -> Option<&RetryConfig> {
        self.retry.as_ref()
    }

    pub fn timeout(&self) -> Option<&TimeoutConfig> {
        self.timeout.as_ref()
    }

    pub fn rate_limit(&self) -> Option<&RateLimitConfig> {
        self.rate_limit.as_ref()
    }

    pub fn bulkhead(&self) -> Option<&BulkheadConfig> {
        self.bulkhead.as_ref()
    }

    /// True when at least one protection is configured.
    pub fn has_any_pattern(&self) -> bool {
        self.circuit_breaker.is_some()
            || self.retry.is_some()
            || self.timeout.is_some()
            || self.rate_limit.is_some()
            || self.bulkhead.is_some()
    }

    /// Equality ignoring the store-controlled version and timestamps.
    pub fn same_settings(&self, other: &Policy) -> bool {
        self.name == other.name
            && self.circuit_breaker == other.circuit_breaker
            && self.retry == other.retry
            && self.timeout == other.timeout
            && self.rate_limit == other.rate_limit
            && self.bulkhead == other.bulkhead
    }
}

/// Policy names end up inside store keys, so they may not contain whitespace or control
/// characters.
pub fn validate_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::new("name", "must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ConfigError::new(
            "name",
            format!("must be at most {} bytes (got {})", MAX_NAME_LEN, name.len()),
        ));
    }
    if let Some(c) = name.chars().find(|c| c.is_whitespace() || c.is_control()) {
        return Err(ConfigError::new("name", format!("contains forbidden character {:?}", c)));
    }
    Ok(())
}

/// Builder for [`Policy`]; validation of the name happens in [`PolicyBuilder::build`].
#[derive(Debug, Clone)]
pub struct PolicyBuilder {
    policy: Policy,
}

impl PolicyBuilder {
    fn new(name: String) -> Self {
        let now = Utc::now();
        Self {
            policy: Policy {
                name,
                version: 1,
                created_at: now,
                updated_at: now,
                circuit_breaker: None,
                retry: None,
                timeout: None,
                rate_limit: None,
                bulkhead: None,
            },
        }
    }

    pub fn circuit_breaker(mut self, cfg: CircuitBreakerConfig) -> Self {
        self.policy.circuit_breaker = Some(cfg);
        self
    }

    pub fn retry(mut self, cfg: RetryConfig) -> Self {
        self.policy.retry = Some(cfg);
        self
    }

    pub fn timeout(mut self, cfg: TimeoutConfig) -> Self {
        self.policy.timeout = Some(cfg);
        self
    }

    pub fn rate_limit(mut self, cfg: RateLimitConfig) -> Self {
        self.policy.rate_limit = Some(cfg);
        self
    }

    pub fn bulkhead(mut self, cfg: BulkheadConfig) -> Self {
        self.policy.bulkhead = Some(cfg);
        self
    }

    /// Remove every sub-configuration, disabling all protections.
    pub fn clear(mut self) -> Self {
        self.policy.circuit_breaker = None;
        self.policy.retry = None;
        self.policy.timeout = None;
        self.policy.rate_limit = None;
        self.policy.bulkhead = None;
        self
    }

    pub fn without_circuit_breaker(mut self) -> Self {
        self.policy.circuit_breaker = None;
        self
    }

    pub fn without_retry(mut self) -> Self {
        self.policy.retry = None;
        self
    }

    pub fn without_rate_limit(mut self) -> Self {
        self.policy.rate_limit = None;
        self
    }

    pub fn without_bulkhead(mut self) -> Self {
        self.policy.bulkhead = None;
        self
    }

    pub fn without_timeout(mut self) -> Self {
        self.policy.timeout = None;
        self
    }

    pub fn build(self) -> Result<Policy, ConfigError> {
        validate_name(&self.policy.name)?;
        Ok(self.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn rejects_bad_names() {
        assert!(Policy::builder("").build().is_err());
        assert!(Policy::builder("has space").build().is_err());
        assert!(Policy::builder("tab\tname").build().is_err());
        assert!(Policy::builder("x".repeat(MAX_NAME_LEN + 1)).build().is_err());
        assert!(Policy::builder("s3-uploads:eu").build().is_ok());
    }

    #[test]
    fn new_policy_starts_at_version_one_with_nothing_enabled() {
        let p = Policy::builder("empty").build().unwrap();
        assert_eq!(p.version(), 1);
        assert_eq!(p.created_at(), p.updated_at());
        assert!(!p.has_any_pattern());
    }

    #[test]
    fn into_builder_keeps_revision() {
        let p = Policy::builder("cache")
            .timeout(TimeoutConfig::new(Duration::from_millis(50), Duration::from_millis(200)).unwrap())
            .build()
            .unwrap();
        let stamped = p.clone().with_revision(7, p.created_at(), p.updated_at());
        let rebuilt = stamped.clone().into_builder().without_timeout().build().unwrap();
        assert_eq!(rebuilt.version(), 7);
        assert!(rebuilt.timeout().is_none());
        assert!(!rebuilt.same_settings(&stamped));
        assert!(stamped.same_settings(&p));
    }
}
