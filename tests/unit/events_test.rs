//! Tests for lifecycle events and sinks

use std::sync::Arc;

use worker_watchdog_pool::core::{EventBus, InMemoryEventSink, PoolEvent};
use worker_watchdog_pool::util::ResourceUsage;

#[test]
fn test_event_wire_format() {
    let event = PoolEvent::ProcessStarted {
        task_id: "t1".to_string(),
        pid: Some(42),
    };
    let json = serde_json::to_string(&event).unwrap();
    assert_eq!(json, r#"{"type":"process-started","task_id":"t1","pid":42}"#);
}

#[test]
fn test_resource_warning_carries_usage() {
    let event = PoolEvent::ResourceWarning {
        task_id: "t1".to_string(),
        usage: ResourceUsage {
            cpu_percent: 97.5,
            memory_bytes: 2048,
        },
    };
    let value = serde_json::to_value(&event).unwrap();
    assert_eq!(value["type"], "resource-warning");
    assert_eq!(value["usage"]["memory_bytes"], 2048);
    assert_eq!(event.name(), "resource-warning");
    assert!(!event.is_terminal());
}

#[test]
fn test_bus_without_subscribers() {
    let bus = EventBus::new();
    assert_eq!(bus.subscriber_count(), 0);
    bus.publish(&PoolEvent::ProcessTimeout {
        task_id: "t1".to_string(),
    });
}

#[test]
fn test_memory_sink_filters_by_task() {
    let bus = EventBus::new();
    let sink = Arc::new(InMemoryEventSink::new(8));
    bus.subscribe(sink.clone());

    bus.publish(&PoolEvent::ProcessStarted {
        task_id: "a".to_string(),
        pid: None,
    });
    bus.publish(&PoolEvent::ProcessStarted {
        task_id: "b".to_string(),
        pid: None,
    });
    bus.publish(&PoolEvent::ProcessCompleted {
        task_id: "a".to_string(),
        success: true,
    });

    assert_eq!(sink.names_for("a"), vec!["process-started", "process-completed"]);
    assert_eq!(sink.names_for("b"), vec!["process-started"]);
    sink.clear();
    assert!(sink.events().is_empty());
}
