//! Tests for configuration validation

use prometheus_dispatch::config::RuntimeConfig;

#[test]
fn test_runtime_config_validation() {
    let valid = RuntimeConfig::new().with_worker_count(4).with_heartbeat(100, 1_000);
    assert!(valid.validate().is_ok());
}

#[test]
fn test_runtime_config_invalid_worker_count() {
    let invalid = RuntimeConfig::new().with_worker_count(0);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_runtime_config_invalid_queue_depth() {
    let invalid = RuntimeConfig::new().with_max_queue_depth(0);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_runtime_config_timeout_must_exceed_interval() {
    assert!(RuntimeConfig::new().with_heartbeat(100, 100).validate().is_err());
    assert!(RuntimeConfig::new().with_heartbeat(0, 100).validate().is_err());
}

#[test]
fn test_runtime_config_from_json_partial() {
    let cfg = RuntimeConfig::from_json_str(r#"{"worker_count": 3, "inline_threshold_bytes": 512}"#).unwrap();
    assert_eq!(cfg.worker_count, 3);
    assert_eq!(cfg.inline_threshold_bytes, 512);
    assert_eq!(cfg.max_queue_depth, RuntimeConfig::default().max_queue_depth);
    assert!(cfg.catch_panics);
}

#[test]
fn test_runtime_config_from_json_rejects_invalid() {
    assert!(RuntimeConfig::from_json_str(r#"{"worker_count": 0}"#).is_err());
    let err = RuntimeConfig::from_json_str("{not json").unwrap_err();
    assert!(err.starts_with("parse error"), "{err}");
}

#[test]
fn test_runtime_config_json_round_trip() {
    let cfg = RuntimeConfig::new().with_worker_count(2).with_catch_panics(false);
    let encoded = serde_json::to_string(&cfg).unwrap();
    assert_eq!(RuntimeConfig::from_json_str(&encoded).unwrap(), cfg);
}
