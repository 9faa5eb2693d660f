//! Virtual-time clock: time only moves when the caller says so.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{
    invoke_callback, ClockCounters, ClockMetrics, SchedulingClock, TimerCallback, TimerErrorLog,
    TimerHandle,
};
use crate::core::error::TimerError;
use crate::util::clock::duration_ms;

/// Default cap on firings performed by a single [`VirtualClock::run_all_timers`].
pub const DEFAULT_MAX_ITERATIONS: usize = 10_000;

/// Immediate callbacks sort ahead of delayed ones due at the same instant.
const CLASS_IMMEDIATE: u8 = 0;
const CLASS_DELAYED: u8 = 1;

/// Ordering key of a pending fire event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct FireKey {
    at_ms: u64,
    class: u8,
    seq: u64,
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    Once,
    Repeating { interval_ms: u64 },
}

struct TimerEntry {
    kind: TimerKind,
    key: FireKey,
    /// `None` while the callback is executing.
    callback: Option<TimerCallback>,
}

struct ClockState {
    now_ms: u64,
    next_seq: u64,
    next_id: u64,
    pending: BTreeMap<FireKey, u64>,
    timers: HashMap<u64, TimerEntry>,
}

impl ClockState {
    fn key(&mut self, at_ms: u64, class: u8) -> FireKey {
        let seq = self.next_seq;
        self.next_seq += 1;
        FireKey { at_ms, class, seq }
    }

    fn insert(&mut self, kind: TimerKind, key: FireKey, callback: TimerCallback) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(key, id);
        self.timers.insert(
            id,
            TimerEntry {
                kind,
                key,
                callback: Some(callback),
            },
        );
        TimerHandle::new(id)
    }
}

/// Deterministic clock for tests and simulations.
///
/// Pending events are ordered by (fire time, class, schedule sequence), so
/// two runs with the same schedule calls fire in exactly the same order.
/// Callbacks run on the thread calling [`advance_time`](Self::advance_time)
/// with no clock lock held; they may schedule or cancel timers freely.
pub struct VirtualClock {
    state: Mutex<ClockState>,
    max_iterations: usize,
    counters: ClockCounters,
    error_log: TimerErrorLog,
}

impl VirtualClock {
    /// Create a clock at time 0.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Create a clock at `start_ms`.
    #[must_use]
    pub fn starting_at(start_ms: u64) -> Self {
        Self {
            state: Mutex::new(ClockState {
                now_ms: start_ms,
                next_seq: 0,
                next_id: 1,
                pending: BTreeMap::new(),
                timers: HashMap::new(),
            }),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            counters: ClockCounters::default(),
            error_log: TimerErrorLog::default(),
        }
    }

    /// Override the [`run_all_timers`](Self::run_all_timers) iteration cap.
    #[must_use]
    pub const fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Number of fire events waiting in the queue.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Move time forward by `delta`, firing every event due on the way.
    ///
    /// While a callback runs, `now_ms()` reports that event's fire time.
    /// Returns the number of callbacks invoked.
    pub fn advance_time(&self, delta: Duration) -> usize {
        let target = {
            let state = self.state.lock();
            state.now_ms.saturating_add(duration_ms(delta))
        };
        let mut fired = 0;
        while self.fire_next(Some(target)) {
            fired += 1;
        }
        let mut state = self.state.lock();
        state.now_ms = state.now_ms.max(target);
        trace!(now_ms = state.now_ms, fired, "virtual clock advanced");
        fired
    }

    /// Jump to absolute time `t_ms`, firing everything due on the way.
    ///
    /// # Errors
    ///
    /// [`TimerError::Validation`] if `t_ms` is earlier than the current time.
    pub fn set_current_time(&self, t_ms: u64) -> Result<usize, TimerError> {
        let now = self.now_ms();
        if t_ms < now {
            return Err(TimerError::Validation(format!(
                "cannot move virtual time backwards from {now} ms to {t_ms} ms"
            )));
        }
        Ok(self.advance_time(Duration::from_millis(t_ms - now)))
    }

    /// Fire the earliest pending event until none remain.
    ///
    /// # Errors
    ///
    /// [`TimerError::Operation`] if events are still pending after the
    /// iteration cap, which happens when a repeating timer keeps re-arming.
    pub fn run_all_timers(&self) -> Result<usize, TimerError> {
        let mut fired = 0;
        while self.fire_next(None) {
            fired += 1;
            if fired >= self.max_iterations && self.pending_count() > 0 {
                let error = TimerError::Operation {
                    timer: None,
                    message: format!(
                        "run_all_timers stopped after {fired} iterations with timers still pending"
                    ),
                };
                self.error_log.record(&self.counters, error.clone());
                return Err(error);
            }
        }
        debug!(fired, "virtual clock drained");
        Ok(fired)
    }

    /// Fire the earliest event due at or before `deadline` (any event when
    /// `None`). Returns `false` if nothing was due.
    fn fire_next(&self, deadline: Option<u64>) -> bool {
        let (id, key, mut callback) = {
            let mut state = self.state.lock();
            let Some((&key, &id)) = state.pending.iter().next() else {
                return false;
            };
            if deadline.is_some_and(|d| key.at_ms > d) {
                return false;
            }
            state.pending.remove(&key);
            state.now_ms = state.now_ms.max(key.at_ms);
            let Some(callback) = state.timers.get_mut(&id).and_then(|e| e.callback.take()) else {
                return true;
            };
            (id, key, callback)
        };

        self.counters.fired();
        if let Err(error) = invoke_callback(id, &mut callback) {
            self.error_log.record(&self.counters, error);
        }

        let leftover = {
            let mut state = self.state.lock();
            let kind = state.timers.get(&id).map(|e| e.kind);
            match kind {
                Some(TimerKind::Repeating { interval_ms }) => {
                    let next = state.key(key.at_ms.saturating_add(interval_ms), CLASS_DELAYED);
                    state.pending.insert(next, id);
                    if let Some(entry) = state.timers.get_mut(&id) {
                        entry.key = next;
                        entry.callback = Some(callback);
                    }
                    None
                }
                Some(TimerKind::Once) => {
                    state.timers.remove(&id);
                    Some(callback)
                }
                // Cancelled while running.
                None => Some(callback),
            }
        };
        drop(leftover);
        true
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VirtualClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("VirtualClock")
            .field("now_ms", &state.now_ms)
            .field("pending", &state.pending.len())
            .field("active", &state.timers.len())
            .finish_non_exhaustive()
    }
}

impl SchedulingClock for VirtualClock {
    fn now_ms(&self) -> u64 {
        self.state.lock().now_ms
    }

    fn schedule_once(
        &self,
        delay: Duration,
        callback: TimerCallback,
    ) -> Result<TimerHandle, TimerError> {
        let handle = {
            let mut state = self.state.lock();
            let at = state.now_ms.saturating_add(duration_ms(delay));
            let key = state.key(at, CLASS_DELAYED);
            state.insert(TimerKind::Once, key, callback)
        };
        self.counters.scheduled();
        Ok(handle)
    }

    fn schedule_repeating(
        &self,
        interval: Duration,
        callback: TimerCallback,
    ) -> Result<TimerHandle, TimerError> {
        let interval_ms = duration_ms(interval);
        if interval_ms == 0 {
            return Err(TimerError::Validation(format!(
                "repeating interval must be at least 1 ms, got {interval:?}"
            )));
        }
        let handle = {
            let mut state = self.state.lock();
            let at = state.now_ms.saturating_add(interval_ms);
            let key = state.key(at, CLASS_DELAYED);
            state.insert(TimerKind::Repeating { interval_ms }, key, callback)
        };
        self.counters.scheduled();
        Ok(handle)
    }

    fn schedule_immediate(&self, callback: TimerCallback) -> TimerHandle {
        let handle = {
            let mut state = self.state.lock();
            let now = state.now_ms;
            let key = state.key(now, CLASS_IMMEDIATE);
            state.insert(TimerKind::Once, key, callback)
        };
        self.counters.scheduled();
        handle
    }

    fn cancel(&self, handle: TimerHandle) {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.timers.remove(&handle.id());
            if let Some(entry) = &removed {
                state.pending.remove(&entry.key);
            }
            removed
        };
        if removed.is_some() {
            self.counters.cancelled(1);
        }
    }

    fn cancel_all(&self) {
        let removed: Vec<TimerEntry> = {
            let mut state = self.state.lock();
            state.pending.clear();
            state.timers.drain().map(|(_, entry)| entry).collect()
        };
        self.counters.cancelled(removed.len() as u64);
    }

    fn active_count(&self) -> usize {
        self.state.lock().timers.len()
    }

    fn metrics(&self) -> ClockMetrics {
        self.counters.snapshot()
    }

    fn errors(&self) -> Vec<TimerError> {
        self.error_log.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::timer_fn;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> TimerCallback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_for = Arc::clone(&log);
        let make = move |label: &str| {
            let log = Arc::clone(&log_for);
            let label = label.to_string();
            timer_fn(move || {
                log.lock().push(label.clone());
                Ok(())
            })
        };
        (log, make)
    }

    #[test]
    fn immediate_runs_before_delayed_due_at_same_instant() {
        let clock = VirtualClock::new();
        let (log, make) = recorder();
        clock.schedule_once(Duration::ZERO, make("zero-delay")).unwrap();
        clock.schedule_immediate(make("immediate"));
        clock.advance_time(Duration::ZERO);
        assert_eq!(*log.lock(), vec!["immediate", "zero-delay"]);
    }

    #[test]
    fn same_fire_time_keeps_schedule_order() {
        let clock = VirtualClock::new();
        let (log, make) = recorder();
        clock.schedule_once(Duration::from_millis(10), make("a")).unwrap();
        clock.schedule_once(Duration::from_millis(10), make("b")).unwrap();
        clock.schedule_once(Duration::from_millis(5), make("c")).unwrap();
        clock.advance_time(Duration::from_millis(10));
        assert_eq!(*log.lock(), vec!["c", "a", "b"]);
    }

    #[test]
    fn now_reflects_fire_time_inside_callback() {
        let clock = Arc::new(VirtualClock::starting_at(100));
        let seen = Arc::new(Mutex::new(None));
        let (c, s) = (Arc::clone(&clock), Arc::clone(&seen));
        clock
            .schedule_once(
                Duration::from_millis(30),
                timer_fn(move || {
                    *s.lock() = Some(c.now_ms());
                    Ok(())
                }),
            )
            .unwrap();
        clock.advance_time(Duration::from_millis(1_000));
        assert_eq!(*seen.lock(), Some(130));
        assert_eq!(clock.now_ms(), 1_100);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let clock = VirtualClock::new();
        let (_, make) = recorder();
        let err = clock
            .schedule_repeating(Duration::ZERO, make("never"))
            .unwrap_err();
        assert!(matches!(err, TimerError::Validation(_)));
        assert_eq!(clock.active_count(), 0);
    }

    #[test]
    fn set_current_time_rejects_the_past() {
        let clock = VirtualClock::starting_at(50);
        assert!(matches!(
            clock.set_current_time(49),
            Err(TimerError::Validation(_))
        ));
        assert_eq!(clock.set_current_time(80).unwrap(), 0);
        assert_eq!(clock.now_ms(), 80);
    }

    #[test]
    fn callback_may_cancel_itself() {
        let clock = Arc::new(VirtualClock::new());
        let count = Arc::new(Mutex::new(0));
        let handle_slot: Arc<Mutex<Option<TimerHandle>>> = Arc::new(Mutex::new(None));
        let (c, n, slot) = (Arc::clone(&clock), Arc::clone(&count), Arc::clone(&handle_slot));
        let handle = clock
            .schedule_repeating(
                Duration::from_millis(10),
                timer_fn(move || {
                    *n.lock() += 1;
                    if let Some(h) = *slot.lock() {
                        c.cancel(h);
                    }
                    Ok(())
                }),
            )
            .unwrap();
        *handle_slot.lock() = Some(handle);
        clock.advance_time(Duration::from_millis(100));
        assert_eq!(*count.lock(), 1);
        assert_eq!(clock.active_count(), 0);
        assert_eq!(clock.pending_count(), 0);
    }

    #[test]
    fn run_all_timers_hits_cap_on_repeating() {
        let clock = VirtualClock::new().with_max_iterations(50);
        let (_, make) = recorder();
        clock
            .schedule_repeating(Duration::from_millis(1), make("tick"))
            .unwrap();
        let err = clock.run_all_timers().unwrap_err();
        assert!(matches!(err, TimerError::Operation { timer: None, .. }));
        assert_eq!(clock.errors().len(), 1);
    }

    #[test]
    fn run_all_timers_drains_chained_timers() {
        let clock = Arc::new(VirtualClock::new());
        let (log, make) = recorder();
        let inner = make("second");
        let c = Arc::clone(&clock);
        let mut inner = Some(inner);
        let log_first = Arc::clone(&log);
        clock
            .schedule_once(
                Duration::from_millis(500),
                timer_fn(move || {
                    log_first.lock().push("first".into());
                    if let Some(cb) = inner.take() {
                        c.schedule_once(Duration::from_millis(500), cb)?;
                    }
                    Ok(())
                }),
            )
            .unwrap();
        assert_eq!(clock.run_all_timers().unwrap(), 2);
        assert_eq!(*log.lock(), vec!["first", "second"]);
        assert_eq!(clock.now_ms(), 1_000);
    }

    #[test]
    fn metrics_track_lifecycle() {
        let clock = VirtualClock::new();
        let (_, make) = recorder();
        let keep = clock.schedule_once(Duration::from_millis(1), make("a")).unwrap();
        let drop_me = clock.schedule_once(Duration::from_millis(2), make("b")).unwrap();
        clock.cancel(drop_me);
        clock.cancel(drop_me);
        clock.advance_time(Duration::from_millis(5));
        clock.cancel(keep);
        let m = clock.metrics();
        assert_eq!(m.scheduled, 2);
        assert_eq!(m.fired, 1);
        assert_eq!(m.cancelled, 1);
        assert_eq!(m.errors, 0);
    }
}
