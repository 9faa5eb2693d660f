//! Tests for utility functions

use worker_watchdog_pool::util::{
    duration_ms, init_tracing, log_filter, new_task_id, now_ms, ResourceLimits, ResourceUsage,
    TaskId, DEFAULT_LOG_FILTER,
};

#[test]
fn test_task_ids_are_unique() {
    let a: TaskId = new_task_id();
    let b: TaskId = new_task_id();
    assert_ne!(a, b);
    assert_eq!(a.len(), 36);
}

#[test]
fn test_now_ms_is_after_2020() {
    assert!(now_ms() > 1_577_836_800_000);
}

#[test]
fn test_duration_ms() {
    assert_eq!(duration_ms(std::time::Duration::from_millis(1500)), 1500);
    assert_eq!(duration_ms(std::time::Duration::MAX), u64::MAX);
}

#[test]
fn test_resource_limits_memory_only() {
    let limits = ResourceLimits {
        max_cpu_percent: None,
        max_memory_bytes: Some(100),
    };
    let usage = ResourceUsage {
        cpu_percent: 100.0,
        memory_bytes: 50,
    };
    assert!(!limits.is_exceeded_by(&usage));
}

#[test]
fn test_init_tracing_installs_once() {
    init_tracing();
    assert!(!init_tracing());
    tracing::info!(task_id = "t1", "logging after init");
}

#[test]
fn test_default_log_filter_parses() {
    assert!(DEFAULT_LOG_FILTER.contains("worker_watchdog_pool=info"));
    let _filter = log_filter();
}
