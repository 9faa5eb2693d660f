//! Infrastructure adapters for the admission queue.

pub mod queue;
pub use queue::{InMemoryQueue, QueueEntry, TaskQueue};
