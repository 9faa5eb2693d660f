//! Tests for configuration validation

use std::collections::HashMap;

use worker_watchdog_pool::config::PoolConfig;
use worker_watchdog_pool::util::ResourceLimits;

#[test]
fn test_pool_config_defaults() {
    let cfg = PoolConfig::default();
    assert_eq!(cfg.max_concurrent, 3);
    assert_eq!(cfg.timeout_ms, 900_000);
    assert_eq!(cfg.heartbeat_warn_ms, 60_000);
    assert_eq!(cfg.heartbeat_kill_ms, 300_000);
    assert_eq!(cfg.heartbeat_check_interval_ms, 5_000);
    assert_eq!(cfg.kill_grace_ms, 5_000);
    assert_eq!(cfg.progress_marker, "[PROGRESS]");
    assert!(cfg.resource_limits.is_none());
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_pool_config_invalid_max_concurrent() {
    let invalid = PoolConfig {
        max_concurrent: 0,
        ..PoolConfig::default()
    };
    assert!(invalid.validate().is_err());
}

#[test]
fn test_pool_config_kill_below_warn() {
    let invalid = PoolConfig {
        heartbeat_warn_ms: 10_000,
        heartbeat_kill_ms: 5_000,
        ..PoolConfig::default()
    };
    let err = invalid.validate().unwrap_err();
    assert!(err.contains("heartbeat_kill_ms"));
}

#[test]
fn test_pool_config_invalid_grace() {
    let invalid = PoolConfig {
        kill_grace_ms: 0,
        ..PoolConfig::default()
    };
    assert!(invalid.validate().is_err());
}

#[test]
fn test_pool_config_invalid_limits() {
    let invalid = PoolConfig {
        resource_limits: Some(ResourceLimits {
            max_cpu_percent: Some(0.0),
            max_memory_bytes: None,
        }),
        ..PoolConfig::default()
    };
    assert!(invalid.validate().is_err());
}

#[test]
fn test_from_json_partial() {
    let json = r#"{
        "max_concurrent": 5,
        "heartbeat_warn_ms": 1000,
        "heartbeat_kill_ms": 5000,
        "resource_limits": { "max_memory_bytes": 1073741824 }
    }"#;
    let cfg = PoolConfig::from_json_str(json).expect("valid config");
    assert_eq!(cfg.max_concurrent, 5);
    assert_eq!(cfg.heartbeat_kill_ms, 5000);
    assert_eq!(cfg.timeout_ms, 900_000);
    let limits = cfg.resource_limits.unwrap();
    assert_eq!(limits.max_memory_bytes, Some(1_073_741_824));
    assert_eq!(limits.max_cpu_percent, None);
}

#[test]
fn test_from_json_invalid() {
    assert!(PoolConfig::from_json_str("not json").is_err());
    assert!(PoolConfig::from_json_str(r#"{"max_concurrent": 0}"#).is_err());
}

#[test]
fn test_from_lookup() {
    let vars: HashMap<&str, &str> = [
        ("WORKER_POOL_MAX_CONCURRENT", "8"),
        ("WORKER_POOL_KILL_GRACE_MS", " 2500 "),
        ("WORKER_POOL_PROGRESS_MARKER", "##"),
        ("WORKER_POOL_MAX_CPU_PERCENT", "75.5"),
    ]
    .into_iter()
    .collect();
    let cfg = PoolConfig::from_lookup(|key| vars.get(key).map(|v| (*v).to_string())).unwrap();
    assert_eq!(cfg.max_concurrent, 8);
    assert_eq!(cfg.kill_grace_ms, 2500);
    assert_eq!(cfg.progress_marker, "##");
    assert_eq!(cfg.resource_limits.unwrap().max_cpu_percent, Some(75.5));
    assert_eq!(cfg.heartbeat_warn_ms, 60_000);
}

#[test]
fn test_from_lookup_rejects_garbage() {
    let err = PoolConfig::from_lookup(|key| {
        (key == "WORKER_POOL_TIMEOUT_MS").then(|| "soon".to_string())
    })
    .unwrap_err();
    assert!(err.contains("WORKER_POOL_TIMEOUT_MS"));
}

#[test]
fn test_watchdog_config_mapping() {
    let cfg = PoolConfig {
        heartbeat_check_interval_ms: 250,
        ..PoolConfig::default()
    };
    let wd = cfg.watchdog_config();
    assert_eq!(wd.check_interval.as_millis(), 250);
    assert_eq!(wd.warn_ms, cfg.heartbeat_warn_ms);
    assert_eq!(wd.kill_ms, cfg.heartbeat_kill_ms);
}
