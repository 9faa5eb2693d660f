//! Heartbeat watchdog.
//!
//! A worker is considered alive while it produces activity. The watchdog
//! schedules one repeating check per monitored task and escalates on silence:
//! a single warning once `warn_ms` is crossed, a stall once `kill_ms` is
//! crossed. It also polls the optional [`ResourceSampler`] on the same cadence.
//!
//! The watchdog never touches worker records directly; everything goes through
//! a [`WatchdogDelegate`] held by weak reference, so a pending check never
//! keeps a dropped pool alive.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::clock::{timer_fn, SchedulingClock, TimerHandle};
use crate::core::error::TimerError;
use crate::core::sampler::ResourceSampler;
use crate::util::serde::{ResourceLimits, ResourceUsage, TaskId};

/// Thresholds driving the watchdog.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchdogConfig {
    /// Period of the per-task check.
    pub check_interval: Duration,
    /// Silence after which a heartbeat warning is emitted.
    pub warn_ms: u64,
    /// Silence after which the worker is declared stalled.
    pub kill_ms: u64,
    /// Advisory resource limits.
    pub resource_limits: Option<ResourceLimits>,
}

/// Liveness data the watchdog needs for one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivitySnapshot {
    /// Last activity time (clock milliseconds).
    pub last_activity_ms: u64,
    /// Whether a warning is already outstanding for the current silence.
    pub heartbeat_warned: bool,
    /// OS process id, passed to the sampler.
    pub pid: Option<u32>,
}

/// Callbacks from the watchdog into the owner of the worker records.
pub trait WatchdogDelegate: Send + Sync {
    /// Current activity of a running worker; `None` ends monitoring.
    fn activity(&self, task_id: &str) -> Option<ActivitySnapshot>;

    /// Silence crossed the warning threshold. `observed_activity_ms` is the
    /// activity time the decision was based on; activity reported after it
    /// voids the warning.
    fn on_heartbeat_warning(&self, task_id: &str, threshold_ms: u64, observed_activity_ms: u64);

    /// Silence crossed the kill threshold. Returns whether the stall was
    /// acted on; monitoring stops only then. A delegate that has seen activity
    /// newer than `observed_activity_ms` returns `false`.
    fn on_stall(&self, task_id: &str, silence_ms: u64, observed_activity_ms: u64) -> bool;

    /// Store a fresh resource sample.
    fn record_resource_sample(&self, task_id: &str, usage: ResourceUsage);

    /// A sample crossed the configured limits.
    fn on_resource_warning(&self, task_id: &str, usage: ResourceUsage);
}

struct Monitor {
    timer: TimerHandle,
    resource_flagged: bool,
    /// Last pid handed to the sampler.
    pid: Option<u32>,
}

struct Inner {
    clock: Arc<dyn SchedulingClock>,
    config: WatchdogConfig,
    sampler: Option<Arc<dyn ResourceSampler>>,
    monitors: Mutex<HashMap<TaskId, Monitor>>,
    delegate: Weak<dyn WatchdogDelegate>,
}

/// Per-task liveness monitor.
pub struct Watchdog {
    inner: Arc<Inner>,
}

impl Watchdog {
    /// Create a watchdog reporting to `delegate`.
    #[must_use]
    pub fn new(
        clock: Arc<dyn SchedulingClock>,
        config: WatchdogConfig,
        sampler: Option<Arc<dyn ResourceSampler>>,
        delegate: Weak<dyn WatchdogDelegate>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                clock,
                config,
                sampler,
                monitors: Mutex::new(HashMap::new()),
                delegate,
            }),
        }
    }

    /// Thresholds in use.
    #[must_use]
    pub fn config(&self) -> &WatchdogConfig {
        &self.inner.config
    }

    /// Start the repeating check for `task_id`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Propagates the clock's validation error for the check interval.
    pub fn start_monitoring(&self, task_id: &str) -> Result<(), TimerError> {
        let weak = Arc::downgrade(&self.inner);
        let id = task_id.to_string();
        let timer = self.inner.clock.schedule_repeating(
            self.inner.config.check_interval,
            timer_fn(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.check(&id);
                }
                Ok(())
            }),
        )?;
        let previous = self.inner.monitors.lock().insert(
            task_id.to_string(),
            Monitor {
                timer,
                resource_flagged: false,
                pid: None,
            },
        );
        if let Some(previous) = previous {
            self.inner.release(task_id, &previous);
        }
        tracing::debug!(task_id, "watchdog monitoring started");
        Ok(())
    }

    /// Cancel the check for `task_id`. Unknown ids are ignored.
    pub fn stop_monitoring(&self, task_id: &str) {
        self.inner.stop(task_id);
    }

    /// Cancel every check.
    pub fn stop_all(&self) {
        let drained: Vec<(TaskId, Monitor)> = self.inner.monitors.lock().drain().collect();
        for (task_id, monitor) in &drained {
            self.inner.release(task_id, monitor);
        }
        tracing::debug!(count = drained.len(), "watchdog stopped all monitors");
    }

    /// Run one check for `task_id` now.
    pub fn check(&self, task_id: &str) {
        self.inner.check(task_id);
    }

    /// Whether `task_id` has an active check.
    #[must_use]
    pub fn is_monitoring(&self, task_id: &str) -> bool {
        self.inner.monitors.lock().contains_key(task_id)
    }

    /// Number of active checks.
    #[must_use]
    pub fn monitored_count(&self) -> usize {
        self.inner.monitors.lock().len()
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop_all();
    }
}

impl Inner {
    fn stop(&self, task_id: &str) {
        let removed = self.monitors.lock().remove(task_id);
        if let Some(monitor) = removed {
            self.release(task_id, &monitor);
            tracing::debug!(task_id, "watchdog monitoring stopped");
        }
    }

    /// Cancel a removed monitor's timer and drop the sampler's state for it.
    fn release(&self, task_id: &str, monitor: &Monitor) {
        self.clock.cancel(monitor.timer);
        if let Some(sampler) = &self.sampler {
            sampler.forget(task_id, monitor.pid);
        }
    }

    fn check(&self, task_id: &str) {
        let Some(delegate) = self.delegate.upgrade() else {
            self.stop(task_id);
            return;
        };
        let Some(snapshot) = delegate.activity(task_id) else {
            self.stop(task_id);
            return;
        };

        let observed = snapshot.last_activity_ms;
        let silence = self.clock.now_ms().saturating_sub(observed);
        if silence >= self.config.kill_ms {
            if delegate.on_stall(task_id, silence, observed) {
                tracing::warn!(task_id, silence_ms = silence, "worker stalled");
                self.stop(task_id);
            } else {
                tracing::debug!(task_id, silence_ms = silence, "stall declined by delegate");
            }
            return;
        }
        if silence >= self.config.warn_ms && !snapshot.heartbeat_warned {
            delegate.on_heartbeat_warning(task_id, self.config.warn_ms, observed);
        }

        self.sample(delegate.as_ref(), task_id, snapshot.pid);
    }

    fn sample(&self, delegate: &dyn WatchdogDelegate, task_id: &str, pid: Option<u32>) {
        let Some(sampler) = &self.sampler else {
            return;
        };
        if let Some(monitor) = self.monitors.lock().get_mut(task_id) {
            monitor.pid = pid;
        }
        let Some(usage) = sampler.sample(task_id, pid) else {
            return;
        };
        delegate.record_resource_sample(task_id, usage);

        let exceeded = self
            .config
            .resource_limits
            .as_ref()
            .is_some_and(|limits| limits.is_exceeded_by(&usage));
        let newly_flagged = {
            let mut monitors = self.monitors.lock();
            let Some(monitor) = monitors.get_mut(task_id) else {
                return;
            };
            let newly = exceeded && !monitor.resource_flagged;
            monitor.resource_flagged = exceeded;
            newly
        };
        if newly_flagged {
            delegate.on_resource_warning(task_id, usage);
        }
    }
}
