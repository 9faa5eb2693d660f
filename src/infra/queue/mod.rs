//! Waiting-task queue backends.

pub mod memory;

pub use memory::InMemoryQueue;

use crate::core::error::PoolError;
use crate::util::serde::TaskId;

/// A task waiting for a free worker slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry<P> {
    /// Task identifier.
    pub task_id: TaskId,
    /// Submission payload handed to the spawn step on release.
    pub payload: P,
    /// Submission time (clock milliseconds).
    pub enqueued_at_ms: u64,
}

/// Abstraction for queue backends. Ordering is strictly FIFO.
pub trait TaskQueue<P> {
    /// Append an entry and return its 1-based position.
    ///
    /// # Errors
    ///
    /// [`PoolError::QueueFull`] at maximum depth, [`PoolError::DuplicateTask`]
    /// if the id is already waiting.
    fn enqueue(&mut self, entry: QueueEntry<P>) -> Result<usize, PoolError>;
    /// Remove and return the oldest entry.
    fn dequeue(&mut self) -> Option<QueueEntry<P>>;
    /// Remove a waiting entry by id.
    fn remove(&mut self, task_id: &str) -> Option<QueueEntry<P>>;
    /// Whether `task_id` is waiting.
    fn contains(&self, task_id: &str) -> bool;
    /// Waiting ids, oldest first.
    fn task_ids(&self) -> Vec<TaskId>;
    /// Maximum depth allowed for this queue.
    fn max_depth(&self) -> usize;
    /// Current depth.
    fn len(&self) -> usize;
    /// Whether nothing is waiting.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
