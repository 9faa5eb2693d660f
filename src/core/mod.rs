//! Core orchestration: clock, watchdog, pool, and admission.

pub mod admission;
pub mod clock;
pub mod error;
pub mod events;
pub mod process_pool;
pub mod sampler;
pub mod watchdog;
pub mod worker;

pub use admission::{Admission, AdmissionGate, SpawnStep};
pub use clock::{
    timer_fn, ClockMetrics, SchedulingClock, TimerCallback, TimerHandle, VirtualClock,
    DEFAULT_MAX_ITERATIONS,
};
#[cfg(feature = "tokio-runtime")]
pub use clock::{TokioClock, DEFAULT_MAX_DELAY};
pub use error::{AppResult, PoolError, TimerError, WorkerFailure};
pub use events::{ChannelEventSink, EventBus, EventSink, InMemoryEventSink, PoolEvent};
pub use process_pool::ProcessPoolManager;
pub use sampler::{ManualSampler, ProcfsSampler, ResourceSampler};
pub use watchdog::{ActivitySnapshot, Watchdog, WatchdogConfig, WatchdogDelegate};
pub use worker::{ExitOutcome, ProcessInfo, WorkerHandle, WorkerStatus};
