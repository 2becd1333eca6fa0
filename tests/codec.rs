use resilience_policy::policy::{decode, encode, CodecError};
use resilience_policy::{ErrorKind, Policy, RateLimitAlgorithm, RateLimitConfig};
use std::time::Duration;

const FULL: &str = r#"{
    "name": "checkout",
    "version": 4,
    "circuit_breaker": {"failure_threshold": 5, "success_threshold": 2, "timeout": "30s", "probe_count": 2},
    "retry": {"max_attempts": 3, "base_delay": "100ms", "max_delay": "2s", "multiplier": 2.0, "jitter_percent": 20},
    "timeout": {"default": "1.5s", "max": "1m"},
    "rate_limit": {"algorithm": "sliding_window", "limit": 100, "window": "1m0s", "burst_size": 10},
    "bulkhead": {"max_concurrent": 8, "max_queue": 16, "queue_timeout": "250ms"},
    "created_at": "2024-03-01T12:00:00Z",
    "updated_at": "2024-03-02T08:30:00Z"
}"#;

fn with_field(path: &[&str], value: serde_json::Value) -> Vec<u8> {
    let mut doc: serde_json::Value = serde_json::from_str(FULL).unwrap();
    let (last, parents) = path.split_last().unwrap();
    let mut target = &mut doc;
    for p in parents {
        target = target.get_mut(*p).unwrap();
    }
    target[*last] = value;
    serde_json::to_vec(&doc).unwrap()
}

#[test]
fn decodes_every_section() {
    let p = decode(FULL.as_bytes()).unwrap();
    assert_eq!(p.name(), "checkout");
    assert_eq!(p.version(), 4);

    let cb = p.circuit_breaker().unwrap();
    assert_eq!((cb.failure_threshold(), cb.success_threshold(), cb.probe_count()), (5, 2, 2));
    assert_eq!(cb.open_timeout(), Duration::from_secs(30));

    let retry = p.retry().unwrap();
    assert_eq!(retry.base_delay(), Duration::from_millis(100));
    assert_eq!(retry.jitter_percent(), 20.0);

    let timeout = p.timeout().unwrap();
    assert_eq!(timeout.default_timeout(), Duration::from_millis(1500));
    assert_eq!(timeout.max_timeout(), Duration::from_secs(60));

    let rl = p.rate_limit().unwrap();
    assert_eq!(rl.algorithm(), RateLimitAlgorithm::SlidingWindow);
    assert_eq!(rl.window(), Duration::from_secs(60));

    let bulkhead = p.bulkhead().unwrap();
    assert_eq!(bulkhead.queue_timeout(), Duration::from_millis(250));
    assert_eq!(p.updated_at().to_rfc3339(), "2024-03-02T08:30:00+00:00");
}

#[test]
fn sections_are_optional() {
    let raw = br#"{"name": "bare", "version": 1,
        "created_at": "2024-01-01T00:00:00Z", "updated_at": "2024-01-01T00:00:00Z"}"#;
    let p = decode(raw).unwrap();
    assert!(!p.has_any_pattern());
}

#[test]
fn encode_then_decode_preserves_the_policy() {
    let original = decode(FULL.as_bytes()).unwrap();
    let again = decode(&encode(&original).unwrap()).unwrap();
    assert_eq!(again, original);
}

#[test]
fn longest_accepted_window_survives_the_codec() {
    let window = resilience_policy::policy::duration::MAX;
    let policy = Policy::builder("archive")
        .rate_limit(RateLimitConfig::new(RateLimitAlgorithm::FixedWindow, 1, window, 0).unwrap())
        .build()
        .unwrap();
    let decoded = decode(&encode(&policy).unwrap()).unwrap();
    assert_eq!(decoded.rate_limit().unwrap().window(), window);
}

#[test]
fn encoded_form_uses_stable_field_names_and_duration_strings() {
    let p = decode(FULL.as_bytes()).unwrap();
    let value: serde_json::Value = serde_json::from_slice(&encode(&p).unwrap()).unwrap();
    assert_eq!(value["circuit_breaker"]["timeout"], "30s");
    assert_eq!(value["timeout"]["default"], "1.5s");
    assert_eq!(value["rate_limit"]["window"], "1m0s");
    assert_eq!(value["rate_limit"]["algorithm"], "sliding_window");

    let bare = Policy::builder("bare").build().unwrap();
    let value: serde_json::Value = serde_json::from_slice(&encode(&bare).unwrap()).unwrap();
    assert!(value.get("retry").is_none());
}

#[test]
fn invariant_violations_are_invalid_config() {
    let cases = [
        with_field(&["circuit_breaker", "failure_threshold"], 0.into()),
        with_field(&["retry", "max_delay"], "10ms".into()),
        with_field(&["retry", "multiplier"], 0.5.into()),
        with_field(&["timeout", "max"], "1s".into()),
        with_field(&["rate_limit", "algorithm"], "token_bucket".into()),
        with_field(&["bulkhead", "max_concurrent"], 0.into()),
        with_field(&["name"], "".into()),
    ];
    for raw in cases {
        let err = decode(&raw).unwrap_err();
        assert!(matches!(err, CodecError::Invalid(_)), "{err}");
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }
}

#[test]
fn malformed_payloads_are_decode_errors() {
    let bad_duration = with_field(&["bulkhead", "queue_timeout"], "soon".into());
    let err = decode(&bad_duration).unwrap_err();
    assert!(matches!(err, CodecError::BadDuration { field: "bulkhead.queue_timeout", .. }));
    assert_eq!(err.kind(), ErrorKind::Decode);

    let wrong_type = with_field(&["circuit_breaker", "probe_count"], "two".into());
    assert!(matches!(decode(&wrong_type), Err(CodecError::Malformed(_))));
    assert!(matches!(decode(b"not json"), Err(CodecError::Malformed(_))));
    assert!(matches!(decode(br#"{"version": 1}"#), Err(CodecError::Malformed(_))));
}
