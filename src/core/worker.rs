//! Worker handle abstraction and the pool's per-worker record types.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::core::clock::TimerHandle;
use crate::core::error::WorkerFailure;
use crate::util::serde::{ResourceUsage, TaskId};

/// Control surface of a spawned worker.
///
/// The pool never inspects a worker's internals; it only sends the two stop
/// signals and asks whether the worker is gone.
pub trait WorkerHandle: Send + 'static {
    /// OS process id, if the worker is a process.
    fn pid(&self) -> Option<u32> {
        None
    }

    /// Ask the worker to stop (e.g. `SIGTERM`).
    ///
    /// # Errors
    ///
    /// Propagates the OS error from signalling the worker.
    fn graceful_stop(&mut self) -> std::io::Result<()>;

    /// Stop the worker unconditionally (e.g. `SIGKILL`).
    ///
    /// # Errors
    ///
    /// Propagates the OS error from signalling the worker.
    fn force_stop(&mut self) -> std::io::Result<()>;

    /// Whether the worker has already exited.
    fn has_exited(&mut self) -> bool;
}

/// Lifecycle status of a registered worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Spawned and being monitored.
    Running,
    /// Exited successfully.
    Completed,
    /// Spawn error or failure exit.
    Failed,
    /// Time budget or heartbeat expired; termination in flight.
    TimedOut,
    /// Terminated by the pool.
    Killed,
}

impl WorkerStatus {
    /// Whether the worker still occupies a pool slot.
    #[must_use]
    pub const fn occupies_slot(self) -> bool {
        matches!(self, Self::Running | Self::TimedOut)
    }

    /// Whether no further transition can happen.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Killed)
    }
}

/// How a worker's process ended, as reported by the exit callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exit with a success status.
    Success,
    /// Exit with a failure status or an error while waiting on the worker.
    Failure(WorkerFailure),
}

impl From<std::process::ExitStatus> for ExitOutcome {
    fn from(status: std::process::ExitStatus) -> Self {
        if status.success() {
            Self::Success
        } else {
            Self::Failure(WorkerFailure::UnexpectedExit {
                code: status.code(),
            })
        }
    }
}

/// Read-only snapshot of a worker record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Task identifier.
    pub task_id: TaskId,
    /// OS process id, if known.
    pub pid: Option<u32>,
    /// Registration time (clock milliseconds).
    pub started_at_ms: u64,
    /// Last activity time (clock milliseconds).
    pub last_activity_ms: u64,
    /// Cumulative output bytes observed.
    pub bytes_received: u64,
    /// Most recent progress marker text.
    pub last_progress: Option<String>,
    /// Current status.
    pub status: WorkerStatus,
    /// Whether a heartbeat warning is outstanding.
    pub heartbeat_warned: bool,
    /// Whether a graceful stop has been sent.
    pub terminating: bool,
    /// Recent resource samples, oldest first.
    pub resource_samples: Vec<ResourceUsage>,
}

/// Authoritative per-worker state. Lives only inside the pool registry.
pub(crate) struct WorkerRecord<H> {
    pub task_id: TaskId,
    pub handle: std::sync::Arc<parking_lot::Mutex<H>>,
    pub pid: Option<u32>,
    pub started_at_ms: u64,
    pub last_activity_ms: u64,
    pub bytes_received: u64,
    pub last_progress: Option<String>,
    pub status: WorkerStatus,
    pub heartbeat_warned: bool,
    /// Distinguishes a re-registration under the same id from the record a
    /// stale timer was armed for.
    pub generation: u64,
    /// Graceful stop sent, forceful stop pending.
    pub terminating: bool,
    /// Grace timer of an in-flight termination.
    pub termination: Option<TimerHandle>,
    /// Overall time-budget timer.
    pub deadline: Option<TimerHandle>,
    pub samples: VecDeque<ResourceUsage>,
    pub sample_capacity: usize,
}

impl<H: WorkerHandle> WorkerRecord<H> {
    pub fn new(
        task_id: TaskId,
        handle: H,
        now_ms: u64,
        sample_capacity: usize,
        generation: u64,
    ) -> Self {
        let pid = handle.pid();
        Self {
            task_id,
            handle: std::sync::Arc::new(parking_lot::Mutex::new(handle)),
            pid,
            started_at_ms: now_ms,
            last_activity_ms: now_ms,
            bytes_received: 0,
            last_progress: None,
            status: WorkerStatus::Running,
            heartbeat_warned: false,
            generation,
            terminating: false,
            termination: None,
            deadline: None,
            samples: VecDeque::with_capacity(sample_capacity),
            sample_capacity,
        }
    }
}

impl<H> WorkerRecord<H> {
    /// Advance activity; the timestamp never moves backwards.
    pub fn touch(&mut self, now_ms: u64, bytes: u64, progress: Option<String>) {
        self.last_activity_ms = self.last_activity_ms.max(now_ms);
        self.bytes_received = self.bytes_received.saturating_add(bytes);
        if progress.is_some() {
            self.last_progress = progress;
        }
        self.heartbeat_warned = false;
    }

    pub fn push_sample(&mut self, usage: ResourceUsage) {
        if self.sample_capacity == 0 {
            return;
        }
        if self.samples.len() >= self.sample_capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(usage);
    }

    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            task_id: self.task_id.clone(),
            pid: self.pid,
            started_at_ms: self.started_at_ms,
            last_activity_ms: self.last_activity_ms,
            bytes_received: self.bytes_received,
            last_progress: self.last_progress.clone(),
            status: self.status,
            heartbeat_warned: self.heartbeat_warned,
            terminating: self.terminating,
            resource_samples: self.samples.iter().copied().collect(),
        }
    }
}
