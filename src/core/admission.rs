//! Task admission gate: FIFO waiting room in front of the process pool.
//!
//! A submission either goes straight to the caller's [`SpawnStep`] or waits
//! until a terminal event frees a slot. A task released by the gate keeps
//! counting against capacity until the pool reports a terminal or
//! `process-removed` event for it, so a release racing its own
//! `register_process` never over-admits.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::core::error::{AppResult, PoolError};
use crate::core::events::{EventSink, PoolEvent};
use crate::core::process_pool::ProcessPoolManager;
use crate::core::worker::WorkerHandle;
use crate::infra::queue::{InMemoryQueue, QueueEntry, TaskQueue};
use crate::util::serde::TaskId;

/// The caller's "start this task now" step. Runs outside every lock.
///
/// An implementation is expected to spawn the worker and register it with the
/// pool. Returning `Err` reports a spawn failure for the task.
pub trait SpawnStep<P>: Send + Sync {
    /// Start `task_id` with its submission payload.
    ///
    /// # Errors
    ///
    /// Any failure to start the worker.
    fn spawn(&self, task_id: &str, payload: P) -> AppResult<()>;
}

impl<P, F> SpawnStep<P> for F
where
    F: Fn(&str, P) -> AppResult<()> + Send + Sync,
{
    fn spawn(&self, task_id: &str, payload: P) -> AppResult<()> {
        self(task_id, payload)
    }
}

/// Result of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Handed to the spawn step.
    Released,
    /// Waiting; `position` is 1-based.
    Queued {
        /// Position in the queue at submission time.
        position: usize,
    },
}

struct GateState<P> {
    queue: Box<dyn TaskQueue<P> + Send>,
    released: HashSet<TaskId>,
}

impl<P> GateState<P> {
    fn occupancy(&self, active: &[TaskId]) -> usize {
        self.released.len() + active.iter().filter(|id| !self.released.contains(*id)).count()
    }
}

struct GateInner<P, H: WorkerHandle> {
    pool: ProcessPoolManager<H>,
    spawn: Arc<dyn SpawnStep<P>>,
    state: Mutex<GateState<P>>,
}

/// FIFO admission in front of a [`ProcessPoolManager`].
pub struct AdmissionGate<P, H: WorkerHandle> {
    inner: Arc<GateInner<P, H>>,
}

impl<P, H: WorkerHandle> Clone for AdmissionGate<P, H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P, H> AdmissionGate<P, H>
where
    P: Send + 'static,
    H: WorkerHandle,
{
    /// Create a gate with an in-memory queue bounded by the pool's
    /// `max_queue_depth`, subscribed to the pool's events.
    pub fn new(pool: ProcessPoolManager<H>, spawn: Arc<dyn SpawnStep<P>>) -> Self {
        let depth = pool.config().max_queue_depth;
        Self::with_queue(pool, spawn, Box::new(InMemoryQueue::new(depth)))
    }

    /// Create a gate on a caller-supplied queue backend.
    pub fn with_queue(
        pool: ProcessPoolManager<H>,
        spawn: Arc<dyn SpawnStep<P>>,
        queue: Box<dyn TaskQueue<P> + Send>,
    ) -> Self {
        let inner = Arc::new(GateInner {
            pool,
            spawn,
            state: Mutex::new(GateState {
                queue,
                released: HashSet::new(),
            }),
        });
        let listener: Weak<GateInner<P, H>> = Arc::downgrade(&inner);
        inner.pool.subscribe(Arc::new(GateListener { gate: listener }));
        Self { inner }
    }

    /// Submit a task. While the pool is shutting down every submission waits
    /// in the queue.
    ///
    /// # Errors
    ///
    /// [`PoolError::DuplicateTask`] if the id is waiting, released or active;
    /// [`PoolError::QueueFull`] if it would have to wait and the queue is full.
    pub fn submit(&self, task_id: &str, payload: P) -> Result<Admission, PoolError> {
        let active = self.inner.pool.get_active_task_ids();
        let enqueued_at_ms = self.inner.pool.clock().now_ms();
        let holding = self.inner.pool.is_shutting_down();
        let mut state = self.inner.state.lock();
        if state.released.contains(task_id)
            || state.queue.contains(task_id)
            || active.iter().any(|id| id == task_id)
        {
            tracing::warn!(task_id, "duplicate submission rejected");
            return Err(PoolError::DuplicateTask(task_id.to_string()));
        }

        let max = self.inner.pool.config().max_concurrent;
        if !holding && state.queue.is_empty() && state.occupancy(&active) < max {
            state.released.insert(task_id.to_string());
            drop(state);
            tracing::info!(task_id, "task released immediately");
            self.inner.run_spawn(task_id, payload);
            return Ok(Admission::Released);
        }

        let position = state.queue.enqueue(QueueEntry {
            task_id: task_id.to_string(),
            payload,
            enqueued_at_ms,
        })?;
        drop(state);
        tracing::info!(task_id, position, "task queued");
        Ok(Admission::Queued { position })
    }

    /// Remove a waiting task. Returns whether it was waiting.
    pub fn cancel(&self, task_id: &str) -> bool {
        let removed = self.inner.state.lock().queue.remove(task_id).is_some();
        if removed {
            tracing::info!(task_id, "queued task cancelled");
        }
        removed
    }

    /// Release waiting tasks while capacity allows. Returns how many; always
    /// zero while the pool is shutting down.
    pub fn drain(&self) -> usize {
        self.inner.drain()
    }

    /// Number of waiting tasks.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Waiting task ids, oldest first.
    #[must_use]
    pub fn queued_task_ids(&self) -> Vec<TaskId> {
        self.inner.state.lock().queue.task_ids()
    }

    /// Tasks released but not yet reported finished.
    #[must_use]
    pub fn released_count(&self) -> usize {
        self.inner.state.lock().released.len()
    }

    /// Pool this gate feeds.
    #[must_use]
    pub fn pool(&self) -> &ProcessPoolManager<H> {
        &self.inner.pool
    }
}

impl<P, H> GateInner<P, H>
where
    P: Send + 'static,
    H: WorkerHandle,
{
    fn run_spawn(&self, task_id: &str, payload: P) {
        if let Err(e) = self.spawn.spawn(task_id, payload) {
            self.pool.report_spawn_failure(task_id, format!("{e:#}"));
        }
    }

    fn drain(&self) -> usize {
        if self.pool.is_shutting_down() {
            tracing::debug!("pool shutting down, queue held");
            return 0;
        }
        let max = self.pool.config().max_concurrent;
        let mut released = 0;
        loop {
            let active = self.pool.get_active_task_ids();
            let entry = {
                let mut state = self.state.lock();
                if state.occupancy(&active) >= max {
                    break;
                }
                let Some(entry) = state.queue.dequeue() else {
                    break;
                };
                state.released.insert(entry.task_id.clone());
                entry
            };
            tracing::info!(task_id = %entry.task_id, "queued task released");
            released += 1;
            self.run_spawn(&entry.task_id, entry.payload);
        }
        released
    }

    fn on_event(&self, event: &PoolEvent) {
        if !(event.is_terminal() || matches!(event, PoolEvent::ProcessRemoved { .. })) {
            return;
        }
        self.state.lock().released.remove(event.task_id());
        self.drain();
    }
}

/// Event sink feeding terminal events back into the gate.
struct GateListener<P, H: WorkerHandle> {
    gate: Weak<GateInner<P, H>>,
}

impl<P, H> EventSink for GateListener<P, H>
where
    P: Send + 'static,
    H: WorkerHandle,
{
    fn publish(&self, event: &PoolEvent) {
        if let Some(gate) = self.gate.upgrade() {
            gate.on_event(event);
        }
    }
}
