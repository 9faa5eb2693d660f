//! Tests for builder modules

use std::sync::Arc;

use worker_watchdog_pool::builders::OrchestratorBuilder;
use worker_watchdog_pool::config::PoolConfig;
use worker_watchdog_pool::core::{
    AppResult, InMemoryEventSink, PoolError, SpawnStep, VirtualClock, WorkerHandle,
};

struct Idle;

impl WorkerHandle for Idle {
    fn graceful_stop(&mut self) -> std::io::Result<()> {
        Ok(())
    }
    fn force_stop(&mut self) -> std::io::Result<()> {
        Ok(())
    }
    fn has_exited(&mut self) -> bool {
        false
    }
}

#[test]
fn test_builder_keeps_config() {
    let config = PoolConfig {
        max_concurrent: 7,
        ..PoolConfig::default()
    };
    let builder = OrchestratorBuilder::new(config);
    assert_eq!(builder.config().max_concurrent, 7);
}

#[test]
fn test_builder_rejects_invalid_config() {
    let config = PoolConfig {
        max_queue_depth: 0,
        ..PoolConfig::default()
    };
    let result = OrchestratorBuilder::new(config)
        .with_clock(Arc::new(VirtualClock::new()))
        .build_pool::<Idle>();
    assert!(matches!(result, Err(PoolError::InvalidConfig(_))));
}

#[test]
fn test_builder_subscribes_sinks() {
    let sink = Arc::new(InMemoryEventSink::new(16));
    let pool = OrchestratorBuilder::new(PoolConfig::default())
        .with_clock(Arc::new(VirtualClock::new()))
        .with_sink(sink.clone())
        .build_pool::<Idle>()
        .unwrap();

    pool.register_process("t1", Idle).unwrap();
    assert_eq!(sink.names_for("t1"), vec!["process-started"]);
}

#[test]
fn test_builder_gate_uses_pool() {
    let gate = OrchestratorBuilder::new(PoolConfig {
        max_concurrent: 1,
        ..PoolConfig::default()
    })
    .with_clock(Arc::new(VirtualClock::new()))
    .build_gate::<(), Idle, _>(|pool| {
        let pool = pool.clone();
        let step = move |id: &str, (): ()| -> AppResult<()> {
            pool.register_process(id, Idle)?;
            Ok(())
        };
        let step: Arc<dyn SpawnStep<()>> = Arc::new(step);
        step
    })
    .unwrap();

    gate.submit("a", ()).unwrap();
    gate.submit("b", ()).unwrap();
    assert_eq!(gate.pool().get_active_process_count(), 1);
    assert_eq!(gate.queued_len(), 1);
}

#[tokio::test]
async fn test_builder_defaults_to_tokio_clock() {
    let pool = OrchestratorBuilder::new(PoolConfig::default())
        .build_pool::<Idle>()
        .unwrap();
    assert!(pool.clock().now_ms() > 0);
}
