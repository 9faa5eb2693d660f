//! # Worker Watchdog Pool
//!
//! A bounded pool for long-running worker subprocesses (typically AI-assisted
//! coding agents) that can be slow, silent, or hung.
//!
//! The crate tracks worker lifecycle and capacity, infers liveness from
//! activity signals, and terminates misbehaving workers with a graceful stop
//! followed by a forceful one. Every time-based decision goes through an
//! injected [`SchedulingClock`](core::SchedulingClock), so the exact same
//! watchdog and timeout logic runs against tokio timers in production and a
//! fully controllable [`VirtualClock`](core::VirtualClock) in tests.
//!
//! ## Components
//!
//! - **Scheduling clock**: `schedule_once` / `schedule_repeating` /
//!   `schedule_immediate` with cancellable handles. Two implementations:
//!   [`TokioClock`](core::TokioClock) and [`VirtualClock`](core::VirtualClock).
//! - **Watchdog**: repeating per-worker check that emits heartbeat warnings
//!   and escalates silent workers to a timeout.
//! - **Resource sampler**: optional CPU/memory sampling polled by the watchdog.
//! - **Process pool manager**: worker registry, capacity, two-phase
//!   termination and lifecycle events.
//! - **Admission gate**: FIFO queue that releases work as slots free up.
//!
//! ## Deterministic timing
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use worker_watchdog_pool::builders::OrchestratorBuilder;
//! use worker_watchdog_pool::config::PoolConfig;
//! use worker_watchdog_pool::core::VirtualClock;
//!
//! let clock = Arc::new(VirtualClock::new());
//! let pool = OrchestratorBuilder::new(PoolConfig::default())
//!     .with_clock(clock.clone())
//!     .build_pool::<MyHandle>()?;
//! let events = pool.subscribe_channel();
//!
//! pool.register_process("task-1", handle)?;
//! clock.advance_time(Duration::from_secs(61));
//! // events now holds a `heartbeat-warning` for task-1
//! ```
//!
//! For complete examples, see:
//! - `tests/process_pool_test.rs` - lifecycle and watchdog scenarios
//! - `tests/admission_gate_test.rs` - capacity and FIFO release

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core orchestration: clocks, watchdog, pool manager, admission gate.
pub mod core;
/// Configuration models for the pool and watchdog thresholds.
pub mod config;
/// Builders to construct pools and gates from configuration.
pub mod builders;
/// Infrastructure adapters (admission queue backends).
pub mod infra;
/// Runtime adapters: tokio spawner and child-process workers.
#[cfg(feature = "tokio-runtime")]
pub mod runtime;
/// Shared utilities.
pub mod util;
