//! Error types for pool, clock and worker operations.

use thiserror::Error;

use crate::util::serde::TaskId;

/// Errors produced synchronously by the pool and admission gate API.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A worker is already active under this task id.
    #[error("duplicate task: {0}")]
    DuplicateTask(TaskId),
    /// Admission queue is full.
    #[error("queue full: {0}")]
    QueueFull(String),
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A scheduling call was rejected.
    #[error(transparent)]
    Timer(#[from] TimerError),
    /// The worker process could not be started.
    #[error("spawn failed: {0}")]
    Spawn(String),
    /// `cleanup` is in progress; no new workers are accepted.
    #[error("pool is shutting down")]
    ShuttingDown,
}

/// Errors produced by scheduling clocks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimerError {
    /// Invalid schedule parameters; rejected before anything is scheduled.
    #[error("invalid timer parameters: {0}")]
    Validation(String),
    /// A timer callback failed or the clock could not complete an operation.
    #[error("timer operation failed{}: {message}", .timer.map(|t| format!(" (timer {t})")).unwrap_or_default())]
    Operation {
        /// Timer id involved, if the failure belongs to one timer.
        timer: Option<u64>,
        /// Failure description.
        message: String,
    },
}

/// Worker-level failures. These never cross the pool boundary as errors;
/// they are rendered into lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerFailure {
    /// The worker could not be spawned.
    #[error("spawn failure: {0}")]
    SpawnFailure(String),
    /// The worker exited with a non-success status.
    #[error("unexpected exit (code {})", .code.map_or_else(|| "none".to_string(), |c| c.to_string()))]
    UnexpectedExit {
        /// Exit code, if the worker exited normally.
        code: Option<i32>,
    },
    /// No activity within the heartbeat kill threshold.
    #[error("heartbeat stall after {silence_ms} ms of silence")]
    HeartbeatStall {
        /// Observed silence in milliseconds.
        silence_ms: u64,
    },
    /// The overall time budget elapsed.
    #[error("time budget of {timeout_ms} ms exceeded")]
    DeadlineExceeded {
        /// Configured budget in milliseconds.
        timeout_ms: u64,
    },
    /// Resource usage above the configured limits (advisory).
    #[error("resource usage above limits")]
    ResourceExhaustion,
}

/// Application-facing result using anyhow for callbacks and glue code.
pub type AppResult<T> = Result<T, anyhow::Error>;
