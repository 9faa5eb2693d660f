//! In-memory FIFO queue.

use std::collections::VecDeque;

use super::{QueueEntry, TaskQueue};
use crate::core::error::PoolError;
use crate::util::serde::TaskId;

/// In-memory queue storing waiting tasks in arrival order.
pub struct InMemoryQueue<P> {
    max_depth: usize,
    entries: VecDeque<QueueEntry<P>>,
}

impl<P> InMemoryQueue<P> {
    /// Create a new in-memory queue with a maximum depth.
    #[must_use]
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            entries: VecDeque::with_capacity(max_depth.min(1024)),
        }
    }
}

impl<P> TaskQueue<P> for InMemoryQueue<P> {
    fn enqueue(&mut self, entry: QueueEntry<P>) -> Result<usize, PoolError> {
        if self.contains(&entry.task_id) {
            return Err(PoolError::DuplicateTask(entry.task_id));
        }
        if self.len() >= self.max_depth() {
            return Err(PoolError::QueueFull(format!(
                "max queue depth {} reached",
                self.max_depth
            )));
        }
        self.entries.push_back(entry);
        Ok(self.entries.len())
    }

    fn dequeue(&mut self) -> Option<QueueEntry<P>> {
        self.entries.pop_front()
    }

    fn remove(&mut self, task_id: &str) -> Option<QueueEntry<P>> {
        let index = self.entries.iter().position(|e| e.task_id == task_id)?;
        self.entries.remove(index)
    }

    fn contains(&self, task_id: &str) -> bool {
        self.entries.iter().any(|e| e.task_id == task_id)
    }

    fn task_ids(&self) -> Vec<TaskId> {
        self.entries.iter().map(|e| e.task_id.clone()).collect()
    }

    fn max_depth(&self) -> usize {
        self.max_depth
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> QueueEntry<String> {
        QueueEntry {
            task_id: id.to_string(),
            payload: format!("payload-{id}"),
            enqueued_at_ms: 0,
        }
    }

    #[test]
    fn test_fifo_order() {
        let mut q = InMemoryQueue::new(10);
        assert_eq!(q.enqueue(entry("a")).unwrap(), 1);
        assert_eq!(q.enqueue(entry("b")).unwrap(), 2);
        assert_eq!(q.enqueue(entry("c")).unwrap(), 3);

        assert_eq!(q.dequeue().unwrap().task_id, "a");
        assert_eq!(q.dequeue().unwrap().task_id, "b");
        assert_eq!(q.dequeue().unwrap().task_id, "c");
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn test_queue_full() {
        let mut q = InMemoryQueue::new(2);
        q.enqueue(entry("a")).unwrap();
        q.enqueue(entry("b")).unwrap();
        assert!(matches!(q.enqueue(entry("c")), Err(PoolError::QueueFull(_))));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut q = InMemoryQueue::new(4);
        q.enqueue(entry("a")).unwrap();
        assert!(matches!(
            q.enqueue(entry("a")),
            Err(PoolError::DuplicateTask(id)) if id == "a"
        ));
    }

    #[test]
    fn test_remove_keeps_order() {
        let mut q = InMemoryQueue::new(4);
        for id in ["a", "b", "c"] {
            q.enqueue(entry(id)).unwrap();
        }
        assert_eq!(q.remove("b").unwrap().payload, "payload-b");
        assert!(q.remove("b").is_none());
        assert_eq!(q.task_ids(), vec!["a".to_string(), "c".to_string()]);
        assert!(!q.is_empty());
    }
}
