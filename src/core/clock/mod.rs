//! Scheduling clock abstraction.
//!
//! Every time-based decision in the pool (watchdog checks, time budgets, the
//! grace window between graceful and forceful termination) is expressed as a
//! timer on a [`SchedulingClock`]. Production code injects a [`TokioClock`];
//! tests inject a [`VirtualClock`] and drive time explicitly, which makes the
//! same logic fully deterministic.

mod virtual_clock;
#[cfg(feature = "tokio-runtime")]
mod tokio_clock;

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::error::{AppResult, TimerError};

pub use virtual_clock::{VirtualClock, DEFAULT_MAX_ITERATIONS};
#[cfg(feature = "tokio-runtime")]
pub use tokio_clock::{TokioClock, DEFAULT_MAX_DELAY};

/// Boxed timer callback. Returning `Err` (or panicking) is recorded as a
/// [`TimerError::Operation`] and never stops other timers.
pub type TimerCallback = Box<dyn FnMut() -> AppResult<()> + Send + 'static>;

/// Box a closure as a [`TimerCallback`].
pub fn timer_fn<F>(f: F) -> TimerCallback
where
    F: FnMut() -> AppResult<()> + Send + 'static,
{
    Box::new(f)
}

/// Opaque, cancellable token returned by every scheduling call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Numeric id, unique per clock instance.
    #[must_use]
    pub const fn id(self) -> u64 {
        self.0
    }
}

/// Counters exposed by a clock for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockMetrics {
    /// Timers scheduled.
    pub scheduled: u64,
    /// Callback invocations (a repeating timer counts once per firing).
    pub fired: u64,
    /// Timers cancelled before they were exhausted.
    pub cancelled: u64,
    /// Callback invocations that failed.
    pub errors: u64,
}

/// "Run this callback after/every N time units".
///
/// Both implementations satisfy the same contract:
/// - a cancelled handle never fires again; cancelling twice or after the
///   final firing is a no-op,
/// - immediate callbacks run before delayed timers due at the same instant,
/// - a failing callback is recorded and reported, never propagated.
pub trait SchedulingClock: Send + Sync {
    /// Current time in milliseconds as seen by this clock.
    fn now_ms(&self) -> u64;

    /// Invoke `callback` once after `delay`.
    ///
    /// # Errors
    ///
    /// [`TimerError::Validation`] if the delay exceeds the clock's maximum.
    fn schedule_once(
        &self,
        delay: Duration,
        callback: TimerCallback,
    ) -> Result<TimerHandle, TimerError>;

    /// Invoke `callback` every `interval` until cancelled.
    ///
    /// # Errors
    ///
    /// [`TimerError::Validation`] if `interval` is zero or above the maximum.
    fn schedule_repeating(
        &self,
        interval: Duration,
        callback: TimerCallback,
    ) -> Result<TimerHandle, TimerError>;

    /// Invoke `callback` at the next scheduling opportunity.
    fn schedule_immediate(&self, callback: TimerCallback) -> TimerHandle;

    /// Prevent future firings of `handle`. Idempotent.
    fn cancel(&self, handle: TimerHandle);

    /// Cancel every outstanding timer created through this clock.
    fn cancel_all(&self);

    /// Handles not yet cancelled or permanently fired.
    fn active_count(&self) -> usize;

    /// Snapshot of the clock's counters.
    fn metrics(&self) -> ClockMetrics;

    /// Most recent callback failures, oldest first.
    fn errors(&self) -> Vec<TimerError>;
}

/// Upper bound on retained [`TimerError`] records per clock.
const MAX_RECORDED_ERRORS: usize = 64;

/// Lock-free counters behind [`ClockMetrics`].
#[derive(Debug, Default)]
pub(crate) struct ClockCounters {
    scheduled: AtomicU64,
    fired: AtomicU64,
    cancelled: AtomicU64,
    errors: AtomicU64,
}

impl ClockCounters {
    pub(crate) fn scheduled(&self) {
        self.scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fired(&self) {
        self.fired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cancelled(&self, count: u64) {
        self.cancelled.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ClockMetrics {
        ClockMetrics {
            scheduled: self.scheduled.load(Ordering::Relaxed),
            fired: self.fired.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Bounded record of callback failures.
#[derive(Debug, Default)]
pub(crate) struct TimerErrorLog {
    entries: Mutex<VecDeque<TimerError>>,
}

impl TimerErrorLog {
    pub(crate) fn record(&self, counters: &ClockCounters, error: TimerError) {
        counters.errors.fetch_add(1, Ordering::Relaxed);
        tracing::error!(error = %error, "timer callback failed");
        let mut entries = self.entries.lock();
        if entries.len() >= MAX_RECORDED_ERRORS {
            entries.pop_front();
        }
        entries.push_back(error);
    }

    pub(crate) fn snapshot(&self) -> Vec<TimerError> {
        self.entries.lock().iter().cloned().collect()
    }
}

/// Run a callback, converting both `Err` returns and panics into
/// [`TimerError::Operation`].
pub(crate) fn invoke_callback(id: u64, callback: &mut TimerCallback) -> Result<(), TimerError> {
    match catch_unwind(AssertUnwindSafe(|| callback())) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(TimerError::Operation {
            timer: Some(id),
            message: format!("{e:#}"),
        }),
        Err(panic) => Err(TimerError::Operation {
            timer: Some(id),
            message: format!("callback panicked: {}", panic_message(panic.as_ref())),
        }),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}
