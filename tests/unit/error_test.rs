//! Tests for error types

use worker_watchdog_pool::core::{PoolError, TimerError, WorkerFailure};

#[test]
fn test_duplicate_task_error() {
    let err = PoolError::DuplicateTask("task-1".to_string());
    assert_eq!(format!("{}", err), "duplicate task: task-1");
}

#[test]
fn test_queue_full_error() {
    let err = PoolError::QueueFull("max queue depth 4 reached".to_string());
    assert_eq!(format!("{}", err), "queue full: max queue depth 4 reached");
}

#[test]
fn test_timer_error_is_transparent() {
    let err: PoolError = TimerError::Validation("interval is zero".to_string()).into();
    assert_eq!(format!("{}", err), "invalid timer parameters: interval is zero");
}

#[test]
fn test_timer_operation_error_names_timer() {
    let err = TimerError::Operation {
        timer: Some(3),
        message: "boom".to_string(),
    };
    assert_eq!(format!("{}", err), "timer operation failed (timer 3): boom");

    let err = TimerError::Operation {
        timer: None,
        message: "iteration cap reached".to_string(),
    };
    assert_eq!(format!("{}", err), "timer operation failed: iteration cap reached");
}

#[test]
fn test_worker_failure_messages() {
    assert_eq!(
        WorkerFailure::UnexpectedExit { code: Some(2) }.to_string(),
        "unexpected exit (code 2)"
    );
    assert_eq!(
        WorkerFailure::UnexpectedExit { code: None }.to_string(),
        "unexpected exit (code none)"
    );
    assert_eq!(
        WorkerFailure::DeadlineExceeded { timeout_ms: 900 }.to_string(),
        "time budget of 900 ms exceeded"
    );
}
