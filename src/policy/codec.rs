//! Canonical JSON encoding of a [`Policy`].
//!
//! Field names are stable and durations are written as strings (see [`super::duration`]).
//! Decoding runs every constructor check, so a payload either yields a fully valid policy or
//! an error.

use super::configs::{
    BulkheadConfig, CircuitBreakerConfig, ConfigError, RateLimitConfig, RetryConfig,
    TimeoutConfig,
};
use super::duration::{self, DurationError};
use super::Policy;
use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Errors produced while encoding or decoding a policy payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The payload is not valid JSON or has the wrong shape.
    #[error("malformed policy payload: {0}")]
    Malformed(String),
    /// A duration field could not be parsed.
    #[error("malformed policy payload: {field}: {source}")]
    BadDuration {
        field: &'static str,
        #[source]
        source: DurationError,
    },
    /// The payload is well-formed but violates a policy invariant.
    #[error("policy payload rejected: {0}")]
    Invalid(#[from] ConfigError),
    #[error("failed to encode policy: {0}")]
    Encode(String),
}

impl CodecError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CodecError::Invalid(_) => ErrorKind::InvalidConfig,
            _ => ErrorKind::Decode,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PolicyDto {
    name: String,
    version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    circuit_breaker: Option<CircuitBreakerDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retry: Option<RetryDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout: Option<TimeoutDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rate_limit: Option<RateLimitDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bulkhead: Option<BulkheadDto>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CircuitBreakerDto {
    failure_threshold: u32,
    success_threshold: u32,
    timeout: String,
    probe_count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct RetryDto {
    max_attempts: u32,
    base_delay: String,
    max_delay: String,
    multiplier: f64,
    jitter_percent: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct TimeoutDto {
    default: String,
    max: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RateLimitDto {
    algorithm: String,
    limit: u32,
    window: String,
    burst_size: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct BulkheadDto {
    max_concurrent: usize,
    max_queue: usize,
    queue_timeout: String,
}

/// Serialize `policy` to its canonical JSON form.
pub fn encode(policy: &Policy) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(&to_dto(policy)).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Parse and validate a policy payload.
///
/// # Examples
/// ```
/// use resilience_policy::policy::{decode, encode};
/// use resilience_policy::Policy;
///
/// let policy = Policy::builder("search").build().unwrap();
/// let bytes = encode(&policy).unwrap();
/// assert_eq!(decode(&bytes).unwrap(), policy);
/// assert!(decode(br#"{"name": ""}"#).is_err());
/// ```
pub fn decode(bytes: &[u8]) -> Result<Policy, CodecError> {
    let dto: PolicyDto =
        serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;
    from_dto(dto)
}

fn to_dto(policy: &Policy) -> PolicyDto {
    PolicyDto {
        name: policy.name().to_string(),
        version: policy.version(),
        circuit_breaker: policy.circuit_breaker().map(|cb| CircuitBreakerDto {
            failure_threshold: cb.failure_threshold(),
            success_threshold: cb.success_threshold(),
            timeout: duration::format(cb.open_timeout()),
            probe_count: cb.probe_count(),
        }),
        retry: policy.retry().map(|r| RetryDto {
            max_attempts: r.max_attempts(),
            base_delay: duration::format(r.base_delay()),
            max_delay: duration::format(r.max_delay()),
            multiplier: r.multiplier(),
            jitter_percent: r.jitter_percent(),
        }),
        timeout: policy.timeout().map(|t| TimeoutDto {
            default: duration::format(t.default_timeout()),
            max: duration::format(t.max_timeout()),
        }),
        rate_limit: policy.rate_limit().map(|rl| RateLimitDto {
            algorithm: rl.algorithm().as_str().to_string(),
            limit: rl.limit(),
            window: duration::format(rl.window()),
            burst_size: rl.burst_size(),
        }),
        bulkhead: policy.bulkhead().map(|b| BulkheadDto {
            max_concurrent: b.max_concurrent(),
            max_queue: b.max_queue(),
            queue_timeout: duration::format(b.queue_timeout()),
        }),
        created_at: policy.created_at(),
        updated_at: policy.updated_at(),
    }
}

fn parse_duration(field: &'static str, raw: &str) -> Result<Duration, CodecError> {
    duration::parse(raw).map_err(|source| CodecError::BadDuration { field, source })
}

fn from_dto(dto: PolicyDto) -> Result<Policy, CodecError> {
    let mut builder = Policy::builder(dto.name);

    if let Some(cb) = dto.circuit_breaker {
        builder = builder.circuit_breaker(CircuitBreakerConfig::new(
            cb.failure_threshold,
            cb.success_threshold,
            parse_duration("circuit_breaker.timeout", &cb.timeout)?,
            cb.probe_count,
        )?);
    }
    if let Some(r) = dto.retry {
        builder = builder.retry(RetryConfig::new(
            r.max_attempts,
            parse_duration("retry.base_delay", &r.base_delay)?,
            parse_duration("retry.max_delay", &r.max_delay)?,
            r.multiplier,
            r.jitter_percent,
        )?);
    }
    if let Some(t) = dto.timeout {
        builder = builder.timeout(TimeoutConfig::new(
            parse_duration("timeout.default", &t.default)?,
            parse_duration("timeout.max", &t.max)?,
        )?);
    }
    if let Some(rl) = dto.rate_limit {
        builder = builder.rate_limit(RateLimitConfig::new(
            rl.algorithm.parse()?,
            rl.limit,
            parse_duration("rate_limit.window", &rl.window)?,
            rl.burst_size,
        )?);
    }
    if let Some(b) = dto.bulkhead {
        builder = builder.bulkhead(BulkheadConfig::new(
            b.max_concurrent,
            b.max_queue,
            parse_duration("bulkhead.queue_timeout", &b.queue_timeout)?,
        )?);
    }

    if dto.version == 0 {
        return Err(ConfigError::new("version", "must be >= 1").into());
    }
    if dto.updated_at < dto.created_at {
        return Err(ConfigError::new("updated_at", "must not precede created_at").into());
    }

    Ok(builder.build()?.with_revision(dto.version, dto.created_at, dto.updated_at))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(body: &str) -> Vec<u8> {
        format!(
            r#"{{"name":"svc","version":3,{}"created_at":"2024-05-01T10:00:00Z","updated_at":"2024-05-02T10:00:00Z"}}"#,
            body
        )
        .into_bytes()
    }

    #[test]
    fn decodes_go_style_durations() {
        let policy = decode(&payload(
            r#""circuit_breaker":{"failure_threshold":5,"success_threshold":2,"timeout":"30s","probe_count":1},
               "retry":{"max_attempts":3,"base_delay":"100ms","max_delay":"1m0s","multiplier":2,"jitter_percent":0.1},"#,
        ))
        .unwrap();
        assert_eq!(policy.version(), 3);
        let cb = policy.circuit_breaker().unwrap();
        assert_eq!(cb.open_timeout(), Duration::from_secs(30));
        let retry = policy.retry().unwrap();
        assert_eq!(retry.max_delay(), Duration::from_secs(60));
        assert_eq!(retry.multiplier(), 2.0);
    }

    #[test]
    fn invariant_violations_are_invalid_config() {
        let err = decode(&payload(
            r#""bulkhead":{"max_concurrent":0,"max_queue":1,"queue_timeout":"1s"},"#,
        ))
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);

        let err = decode(&payload(
            r#""rate_limit":{"algorithm":"token_bucket","limit":1,"window":"1s","burst_size":0},"#,
        ))
        .unwrap_err();
        assert!(matches!(err, CodecError::Invalid(ref e) if e.field() == "rate_limit.algorithm"));
    }

    #[test]
    fn malformed_payloads_are_decode_errors() {
        assert_eq!(decode(b"not json").unwrap_err().kind(), ErrorKind::Decode);
        assert_eq!(decode(b"{}").unwrap_err().kind(), ErrorKind::Decode);

        let err = decode(&payload(r#""timeout":{"default":"fast","max":"1s"},"#)).unwrap_err();
        assert!(matches!(err, CodecError::BadDuration { field: "timeout.default", .. }));

        let err = decode(&payload(
            r#""retry":{"max_attempts":-1,"base_delay":"1s","max_delay":"1s","multiplier":1,"jitter_percent":0},"#,
        ))
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);
    }

    #[test]
    fn absent_sections_stay_absent() {
        let policy = decode(&payload("")).unwrap();
        assert!(!policy.has_any_pattern());
        let json: serde_json::Value = serde_json::from_slice(&encode(&policy).unwrap()).unwrap();
        assert!(json.get("retry").is_none());
        assert_eq!(json["created_at"], "2024-05-01T10:00:00Z");
    }
}
