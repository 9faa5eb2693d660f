//! Lifecycle events and event sinks.
//!
//! The pool publishes typed [`PoolEvent`]s to every subscribed [`EventSink`].
//! Publication always happens after internal locks are released, so a sink
//! may call back into the pool (the admission gate does exactly that).

use std::collections::VecDeque;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::util::serde::{ResourceUsage, TaskId};

/// Lifecycle event emitted by the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PoolEvent {
    /// Worker registered and monitoring started.
    ProcessStarted {
        /// Task identifier.
        task_id: TaskId,
        /// OS process id, when the handle has one.
        pid: Option<u32>,
    },
    /// Worker exited successfully.
    ProcessCompleted {
        /// Task identifier.
        task_id: TaskId,
        /// Always `true`; failures are reported as [`PoolEvent::ProcessFailed`].
        success: bool,
    },
    /// Worker failed to spawn or exited with a failure status.
    ProcessFailed {
        /// Task identifier.
        task_id: TaskId,
        /// Failure description.
        error: String,
    },
    /// Worker exceeded its heartbeat or time budget; a kill follows.
    ProcessTimeout {
        /// Task identifier.
        task_id: TaskId,
    },
    /// Worker terminated by the pool.
    ProcessKilled {
        /// Task identifier.
        task_id: TaskId,
    },
    /// Worker has been silent for at least `threshold_ms`.
    HeartbeatWarning {
        /// Task identifier.
        task_id: TaskId,
        /// Warning threshold that was crossed.
        threshold_ms: u64,
    },
    /// Worker resource usage is above the configured limits (advisory).
    ResourceWarning {
        /// Task identifier.
        task_id: TaskId,
        /// The offending sample.
        usage: ResourceUsage,
    },
    /// Worker record removed by `unregister_process`.
    ProcessRemoved {
        /// Task identifier.
        task_id: TaskId,
    },
}

impl PoolEvent {
    /// Task this event belongs to.
    #[must_use]
    pub fn task_id(&self) -> &str {
        match self {
            Self::ProcessStarted { task_id, .. }
            | Self::ProcessCompleted { task_id, .. }
            | Self::ProcessFailed { task_id, .. }
            | Self::ProcessTimeout { task_id }
            | Self::ProcessKilled { task_id }
            | Self::HeartbeatWarning { task_id, .. }
            | Self::ResourceWarning { task_id, .. }
            | Self::ProcessRemoved { task_id } => task_id,
        }
    }

    /// Short event name as used on the wire.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ProcessStarted { .. } => "process-started",
            Self::ProcessCompleted { .. } => "process-completed",
            Self::ProcessFailed { .. } => "process-failed",
            Self::ProcessTimeout { .. } => "process-timeout",
            Self::ProcessKilled { .. } => "process-killed",
            Self::HeartbeatWarning { .. } => "heartbeat-warning",
            Self::ResourceWarning { .. } => "resource-warning",
            Self::ProcessRemoved { .. } => "process-removed",
        }
    }

    /// Whether this is the single terminal event of a task.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ProcessCompleted { .. } | Self::ProcessFailed { .. } | Self::ProcessKilled { .. }
        )
    }
}

/// Event sink abstraction.
pub trait EventSink: Send + Sync {
    /// Receive one event.
    fn publish(&self, event: &PoolEvent);
}

/// In-memory sink keeping the most recent events, for tests and dev.
pub struct InMemoryEventSink {
    events: Mutex<VecDeque<PoolEvent>>,
    max_events: usize,
}

impl InMemoryEventSink {
    /// Create a new in-memory sink with a bounded buffer.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_events.min(1024))),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    #[must_use]
    pub fn events(&self) -> Vec<PoolEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Stored events for one task, in emission order.
    #[must_use]
    pub fn events_for(&self, task_id: &str) -> Vec<PoolEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.task_id() == task_id)
            .cloned()
            .collect()
    }

    /// Event names for one task, in emission order.
    #[must_use]
    pub fn names_for(&self, task_id: &str) -> Vec<&'static str> {
        self.events_for(task_id).iter().map(PoolEvent::name).collect()
    }

    /// Drop all stored events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for InMemoryEventSink {
    fn publish(&self, event: &PoolEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event.clone());
    }
}

/// Sink forwarding events into an unbounded crossbeam channel.
pub struct ChannelEventSink {
    tx: Sender<PoolEvent>,
}

impl ChannelEventSink {
    /// Create a sink and the receiver it feeds.
    #[must_use]
    pub fn new() -> (Self, Receiver<PoolEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn publish(&self, event: &PoolEvent) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(event.clone());
    }
}

/// Fan-out of events to all subscribed sinks.
#[derive(Default)]
pub struct EventBus {
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    pub fn subscribe(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().push(sink);
    }

    /// Add a channel sink and return its receiver.
    pub fn subscribe_channel(&self) -> Receiver<PoolEvent> {
        let (sink, rx) = ChannelEventSink::new();
        self.subscribe(Arc::new(sink));
        rx
    }

    /// Number of subscribed sinks.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sinks.read().len()
    }

    /// Deliver `event` to every sink. The sink list lock is not held while
    /// sinks run.
    pub fn publish(&self, event: &PoolEvent) {
        match event {
            PoolEvent::HeartbeatWarning { .. } | PoolEvent::ResourceWarning { .. } => {
                tracing::warn!(task_id = %event.task_id(), event = event.name(), "pool event");
            }
            PoolEvent::ProcessFailed { error, .. } => {
                tracing::warn!(task_id = %event.task_id(), error = %error, "pool event: process-failed");
            }
            PoolEvent::ProcessTimeout { .. } => {
                tracing::warn!(task_id = %event.task_id(), "pool event: process-timeout");
            }
            _ => tracing::info!(task_id = %event.task_id(), event = event.name(), "pool event"),
        }
        let sinks: Vec<Arc<dyn EventSink>> = self.sinks.read().clone();
        for sink in sinks {
            sink.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn killed(id: &str) -> PoolEvent {
        PoolEvent::ProcessKilled {
            task_id: id.to_string(),
        }
    }

    #[test]
    fn in_memory_sink_overflow() {
        let sink = InMemoryEventSink::new(2);
        sink.publish(&killed("a"));
        sink.publish(&killed("b"));
        sink.publish(&killed("c"));
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].task_id(), "b");
        assert_eq!(events[1].task_id(), "c");
    }

    #[test]
    fn bus_fans_out_to_every_sink() {
        let bus = EventBus::new();
        let memory = Arc::new(InMemoryEventSink::new(16));
        bus.subscribe(memory.clone());
        let rx = bus.subscribe_channel();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(&killed("t1"));
        assert_eq!(memory.names_for("t1"), vec!["process-killed"]);
        assert_eq!(rx.try_recv().unwrap(), killed("t1"));
    }

    #[test]
    fn serializes_with_kebab_case_tag() {
        let event = PoolEvent::HeartbeatWarning {
            task_id: "t1".into(),
            threshold_ms: 1000,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "heartbeat-warning");
        assert_eq!(json["threshold_ms"], 1000);
        let back: PoolEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn terminal_classification() {
        assert!(killed("x").is_terminal());
        assert!(!PoolEvent::ProcessTimeout {
            task_id: "x".into()
        }
        .is_terminal());
        assert!(!PoolEvent::ProcessRemoved {
            task_id: "x".into()
        }
        .is_terminal());
    }
}
