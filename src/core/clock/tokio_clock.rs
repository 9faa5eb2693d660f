//! Real-time clock backed by tokio timers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::{
    invoke_callback, ClockCounters, ClockMetrics, SchedulingClock, TimerCallback, TimerErrorLog,
    TimerHandle,
};
use crate::core::error::TimerError;
use crate::util::clock::{duration_ms, now_ms};

/// Longest delay or interval accepted by default (24 hours).
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// State shared between the clock and its timer tasks.
struct Shared {
    /// `None` until the spawned task's abort handle is stored.
    timers: Mutex<HashMap<u64, Option<AbortHandle>>>,
    next_id: AtomicU64,
    counters: ClockCounters,
    error_log: TimerErrorLog,
}

impl Shared {
    fn fire(&self, id: u64, callback: &mut TimerCallback) {
        self.counters.fired();
        if let Err(error) = invoke_callback(id, callback) {
            self.error_log.record(&self.counters, error);
        }
    }

    fn is_active(&self, id: u64) -> bool {
        self.timers.lock().contains_key(&id)
    }

    /// Remove a timer that has permanently fired. Returns `false` if it was
    /// cancelled first.
    fn retire(&self, id: u64) -> bool {
        self.timers.lock().remove(&id).is_some()
    }
}

/// Production clock. Each timer is a tokio task; cancellation aborts it.
///
/// `now_ms()` is wall-clock milliseconds captured at construction plus a
/// monotonic offset, so it never goes backwards.
pub struct TokioClock {
    handle: tokio::runtime::Handle,
    origin: Instant,
    origin_ms: u64,
    max_delay: Duration,
    shared: Arc<Shared>,
}

impl TokioClock {
    /// Create a clock that spawns its timers on `handle`.
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle,
            origin: Instant::now(),
            origin_ms: now_ms(),
            max_delay: DEFAULT_MAX_DELAY,
            shared: Arc::new(Shared {
                timers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                counters: ClockCounters::default(),
                error_log: TimerErrorLog::default(),
            }),
        }
    }

    /// Create a clock on the runtime of the current context.
    ///
    /// # Errors
    ///
    /// [`TimerError::Operation`] when called outside a tokio runtime.
    pub fn current() -> Result<Self, TimerError> {
        tokio::runtime::Handle::try_current()
            .map(Self::new)
            .map_err(|e| TimerError::Operation {
                timer: None,
                message: format!("no tokio runtime available: {e}"),
            })
    }

    /// Override the maximum accepted delay/interval.
    #[must_use]
    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    fn validate(&self, what: &str, value: Duration) -> Result<(), TimerError> {
        if value > self.max_delay {
            return Err(TimerError::Validation(format!(
                "{what} {value:?} exceeds maximum {:?}",
                self.max_delay
            )));
        }
        Ok(())
    }

    /// Register a slot, spawn the task, then store its abort handle.
    fn spawn_timer<F>(&self, make_task: F) -> TimerHandle
    where
        F: FnOnce(u64, Arc<Shared>) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>,
    {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.timers.lock().insert(id, None);
        let join = self.handle.spawn(make_task(id, Arc::clone(&self.shared)));
        if let Some(slot) = self.shared.timers.lock().get_mut(&id) {
            *slot = Some(join.abort_handle());
        }
        self.shared.counters.scheduled();
        TimerHandle::new(id)
    }
}

impl std::fmt::Debug for TokioClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioClock")
            .field("now_ms", &self.now_ms())
            .field("active", &self.active_count())
            .field("max_delay", &self.max_delay)
            .finish_non_exhaustive()
    }
}

impl SchedulingClock for TokioClock {
    fn now_ms(&self) -> u64 {
        self.origin_ms
            .saturating_add(duration_ms(self.origin.elapsed()))
    }

    fn schedule_once(
        &self,
        delay: Duration,
        mut callback: TimerCallback,
    ) -> Result<TimerHandle, TimerError> {
        self.validate("delay", delay)?;
        Ok(self.spawn_timer(move |id, shared| {
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                if shared.retire(id) {
                    shared.fire(id, &mut callback);
                }
            })
        }))
    }

    fn schedule_repeating(
        &self,
        interval: Duration,
        mut callback: TimerCallback,
    ) -> Result<TimerHandle, TimerError> {
        if interval.is_zero() {
            return Err(TimerError::Validation(
                "repeating interval must be greater than zero".into(),
            ));
        }
        self.validate("interval", interval)?;
        Ok(self.spawn_timer(move |id, shared| {
            Box::pin(async move {
                let mut ticker =
                    tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if !shared.is_active(id) {
                        break;
                    }
                    shared.fire(id, &mut callback);
                }
            })
        }))
    }

    fn schedule_immediate(&self, mut callback: TimerCallback) -> TimerHandle {
        self.spawn_timer(move |id, shared| {
            Box::pin(async move {
                if shared.retire(id) {
                    shared.fire(id, &mut callback);
                }
            })
        })
    }

    fn cancel(&self, handle: TimerHandle) {
        let removed = self.shared.timers.lock().remove(&handle.id());
        if let Some(slot) = removed {
            if let Some(abort) = slot {
                abort.abort();
            }
            self.shared.counters.cancelled(1);
        }
    }

    fn cancel_all(&self) {
        let drained: Vec<Option<AbortHandle>> =
            self.shared.timers.lock().drain().map(|(_, slot)| slot).collect();
        let count = drained.len();
        for abort in drained.into_iter().flatten() {
            abort.abort();
        }
        self.shared.counters.cancelled(count as u64);
        debug!(count, "cancelled all tokio timers");
    }

    fn active_count(&self) -> usize {
        self.shared.timers.lock().len()
    }

    fn metrics(&self) -> ClockMetrics {
        self.shared.counters.snapshot()
    }

    fn errors(&self) -> Vec<TimerError> {
        self.shared.error_log.snapshot()
    }
}

impl Drop for TokioClock {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
