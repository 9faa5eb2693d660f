//! Process pool manager: worker registry, capacity, and two-phase termination.
//!
//! The registry is the single owner of every [`WorkerRecord`]. All timing
//! (time budget, heartbeat checks, the grace window) goes through the injected
//! [`SchedulingClock`], so the same code runs against real and virtual time.
//!
//! Lock discipline: the registry mutex is never held while signalling a
//! worker, scheduling or cancelling a timer, or publishing an event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;

use crate::config::PoolConfig;
use crate::core::clock::{timer_fn, SchedulingClock, TimerHandle};
use crate::core::error::{PoolError, WorkerFailure};
use crate::core::events::{EventBus, EventSink, PoolEvent};
use crate::core::sampler::ResourceSampler;
use crate::core::watchdog::{ActivitySnapshot, Watchdog, WatchdogDelegate};
use crate::core::worker::{ExitOutcome, ProcessInfo, WorkerHandle, WorkerRecord, WorkerStatus};
use crate::util::serde::{ResourceUsage, TaskId};

/// Bounded pool of monitored workers.
///
/// Cloning is cheap and yields another handle to the same pool.
pub struct ProcessPoolManager<H: WorkerHandle> {
    inner: Arc<PoolInner<H>>,
}

impl<H: WorkerHandle> Clone for ProcessPoolManager<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PoolInner<H: WorkerHandle> {
    config: PoolConfig,
    clock: Arc<dyn SchedulingClock>,
    registry: Mutex<HashMap<TaskId, WorkerRecord<H>>>,
    watchdog: Watchdog,
    events: EventBus,
    generations: AtomicU64,
    /// Nesting depth of in-progress `cleanup` calls.
    shutting_down: AtomicUsize,
    self_ref: Weak<PoolInner<H>>,
}

/// Holds the pool in shutdown for the lifetime of one `cleanup` call.
struct ShutdownGuard<'a>(&'a AtomicUsize);

impl<'a> ShutdownGuard<'a> {
    fn enter(depth: &'a AtomicUsize) -> Self {
        depth.fetch_add(1, Ordering::SeqCst);
        Self(depth)
    }
}

impl Drop for ShutdownGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<H: WorkerHandle> ProcessPoolManager<H> {
    /// Create a pool on `clock`, optionally sampling resources with `sampler`.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidConfig`] when `config` fails validation.
    pub fn new(
        config: PoolConfig,
        clock: Arc<dyn SchedulingClock>,
        sampler: Option<Arc<dyn ResourceSampler>>,
    ) -> Result<Self, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;
        let inner = Arc::new_cyclic(|weak: &Weak<PoolInner<H>>| {
            let delegate: Weak<dyn WatchdogDelegate> = weak.clone();
            PoolInner {
                watchdog: Watchdog::new(
                    Arc::clone(&clock),
                    config.watchdog_config(),
                    sampler,
                    delegate,
                ),
                config,
                clock,
                registry: Mutex::new(HashMap::new()),
                events: EventBus::new(),
                generations: AtomicU64::new(1),
                shutting_down: AtomicUsize::new(0),
                self_ref: weak.clone(),
            }
        });
        tracing::info!(
            max_concurrent = inner.config.max_concurrent,
            timeout_ms = inner.config.timeout_ms,
            heartbeat_warn_ms = inner.config.heartbeat_warn_ms,
            heartbeat_kill_ms = inner.config.heartbeat_kill_ms,
            "process pool created"
        );
        Ok(Self { inner })
    }

    /// Pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Clock driving this pool.
    #[must_use]
    pub fn clock(&self) -> Arc<dyn SchedulingClock> {
        Arc::clone(&self.inner.clock)
    }

    /// Subscribe a sink to lifecycle events.
    pub fn subscribe(&self, sink: Arc<dyn EventSink>) {
        self.inner.events.subscribe(sink);
    }

    /// Subscribe through a channel and return its receiver.
    #[must_use]
    pub fn subscribe_channel(&self) -> Receiver<PoolEvent> {
        self.inner.events.subscribe_channel()
    }

    /// Register a freshly spawned worker and start monitoring it.
    ///
    /// # Errors
    ///
    /// [`PoolError::DuplicateTask`] if a non-terminal record exists under
    /// `task_id`; [`PoolError::ShuttingDown`] while [`cleanup`](Self::cleanup)
    /// is running; [`PoolError::Timer`] if a monitoring timer cannot be armed
    /// (nothing is registered in that case).
    pub fn register_process(&self, task_id: &str, handle: H) -> Result<(), PoolError> {
        self.inner.register(task_id, handle)
    }

    /// Remove a worker record without signalling the worker. Unknown ids are
    /// ignored.
    pub fn unregister_process(&self, task_id: &str) {
        self.inner.unregister(task_id);
    }

    /// Snapshot of one worker record.
    #[must_use]
    pub fn get_process_info(&self, task_id: &str) -> Option<ProcessInfo> {
        self.inner.registry.lock().get(task_id).map(WorkerRecord::info)
    }

    /// Snapshots of every record, sorted by task id.
    #[must_use]
    pub fn list_processes(&self) -> Vec<ProcessInfo> {
        let mut infos: Vec<ProcessInfo> =
            self.inner.registry.lock().values().map(WorkerRecord::info).collect();
        infos.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        infos
    }

    /// Whether occupying workers have reached `max_concurrent`.
    #[must_use]
    pub fn is_at_max_capacity(&self) -> bool {
        self.get_active_process_count() >= self.inner.config.max_concurrent
    }

    /// Workers currently occupying a slot (`Running` or `TimedOut`).
    #[must_use]
    pub fn get_active_process_count(&self) -> usize {
        self.inner
            .registry
            .lock()
            .values()
            .filter(|r| r.status.occupies_slot())
            .count()
    }

    /// Ids of workers occupying a slot, sorted.
    #[must_use]
    pub fn get_active_task_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .inner
            .registry
            .lock()
            .values()
            .filter(|r| r.status.occupies_slot())
            .map(|r| r.task_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Record worker activity: `bytes` of output and optionally a progress
    /// marker. Ignored for unknown or non-running workers.
    pub fn update_process_activity(&self, task_id: &str, bytes: u64, progress: Option<&str>) {
        self.inner.update_activity(task_id, bytes, progress);
    }

    /// Begin two-phase termination of `task_id`.
    ///
    /// Returns `false` if the worker is unknown, already terminal, or already
    /// terminating.
    pub fn kill_process(&self, task_id: &str) -> bool {
        self.inner.kill(task_id)
    }

    /// Begin termination of every occupying worker. Returns how many started.
    pub fn kill_all_processes(&self) -> usize {
        self.inner.kill_all()
    }

    /// Stop all monitoring, terminate every worker and clear the registry.
    ///
    /// Registrations attempted while this runs (for example from an event
    /// subscriber reacting to `process-killed`) are rejected.
    pub fn cleanup(&self) {
        self.inner.cleanup();
    }

    /// Whether a `cleanup` call is currently in progress.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.is_shutting_down()
    }

    /// Report how a worker exited.
    pub fn handle_process_exit(&self, task_id: &str, outcome: ExitOutcome) {
        self.inner.on_exit(task_id, outcome);
    }

    /// Report that a worker could not be spawned. No record is created.
    pub fn report_spawn_failure(&self, task_id: &str, error: impl std::fmt::Display) {
        let failure = WorkerFailure::SpawnFailure(error.to_string());
        tracing::error!(task_id, error = %failure, "worker spawn failed");
        self.inner.events.publish(&PoolEvent::ProcessFailed {
            task_id: task_id.to_string(),
            error: failure.to_string(),
        });
    }

    /// Number of workers the watchdog is checking.
    #[must_use]
    pub fn monitored_count(&self) -> usize {
        self.inner.watchdog.monitored_count()
    }
}

impl<H: WorkerHandle> PoolInner<H> {
    fn register(&self, task_id: &str, handle: H) -> Result<(), PoolError> {
        let now = self.clock.now_ms();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let pid = handle.pid();
        {
            let mut registry = self.registry.lock();
            // Checked under the registry lock so a registration either lands
            // before cleanup snapshots the registry or is refused.
            if self.is_shutting_down() {
                tracing::warn!(task_id, "registration rejected during cleanup");
                return Err(PoolError::ShuttingDown);
            }
            if registry
                .get(task_id)
                .is_some_and(|existing| !existing.status.is_terminal())
            {
                tracing::warn!(task_id, "duplicate registration rejected");
                return Err(PoolError::DuplicateTask(task_id.to_string()));
            }
            registry.insert(
                task_id.to_string(),
                WorkerRecord::new(
                    task_id.to_string(),
                    handle,
                    now,
                    self.config.sample_history,
                    generation,
                ),
            );
        }

        if let Err(e) = self.watchdog.start_monitoring(task_id) {
            self.registry.lock().remove(task_id);
            return Err(e.into());
        }

        let deadline = match self.arm_deadline(task_id, generation) {
            Ok(timer) => timer,
            Err(e) => {
                self.watchdog.stop_monitoring(task_id);
                self.registry.lock().remove(task_id);
                return Err(e);
            }
        };
        let stale = {
            let mut registry = self.registry.lock();
            match registry.get_mut(task_id) {
                Some(r) if r.generation == generation && r.status == WorkerStatus::Running => {
                    r.deadline = Some(deadline);
                    false
                }
                _ => true,
            }
        };
        if stale {
            self.clock.cancel(deadline);
        }

        tracing::info!(task_id, pid = ?pid, "worker registered");
        self.events.publish(&PoolEvent::ProcessStarted {
            task_id: task_id.to_string(),
            pid,
        });
        Ok(())
    }

    fn arm_deadline(&self, task_id: &str, generation: u64) -> Result<TimerHandle, PoolError> {
        let weak = self.self_ref.clone();
        let id = task_id.to_string();
        let timeout_ms = self.config.timeout_ms;
        let timer = self.clock.schedule_once(
            self.config.timeout(),
            timer_fn(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.time_out(
                        &id,
                        Some(generation),
                        None,
                        &WorkerFailure::DeadlineExceeded { timeout_ms },
                    );
                }
                Ok(())
            }),
        )?;
        Ok(timer)
    }

    fn unregister(&self, task_id: &str) {
        let removed = self.registry.lock().remove(task_id);
        let Some(record) = removed else {
            tracing::debug!(task_id, "unregister of unknown worker ignored");
            return;
        };
        self.watchdog.stop_monitoring(task_id);
        for timer in [record.deadline, record.termination].into_iter().flatten() {
            self.clock.cancel(timer);
        }
        tracing::info!(task_id, status = ?record.status, "worker unregistered");
        self.events.publish(&PoolEvent::ProcessRemoved {
            task_id: task_id.to_string(),
        });
    }

    fn update_activity(&self, task_id: &str, bytes: u64, progress: Option<&str>) {
        let now = self.clock.now_ms();
        let mut registry = self.registry.lock();
        match registry.get_mut(task_id) {
            Some(r) if r.status == WorkerStatus::Running && !r.terminating => {
                r.touch(now, bytes, progress.map(str::to_owned));
                tracing::trace!(task_id, bytes, last_activity_ms = r.last_activity_ms, "activity");
            }
            Some(r) => {
                tracing::debug!(task_id, status = ?r.status, "activity for non-running worker ignored");
            }
            None => tracing::debug!(task_id, "activity for unknown worker ignored"),
        }
    }

    /// Mark a running worker `TimedOut` and start killing it. A no-op unless
    /// the worker is still running, so only one timeout is ever reported.
    ///
    /// With `observed_activity_ms`, the timeout is dropped if the worker has
    /// reported activity since that observation. Returns whether the timeout
    /// was applied.
    fn time_out(
        &self,
        task_id: &str,
        generation: Option<u64>,
        observed_activity_ms: Option<u64>,
        reason: &WorkerFailure,
    ) -> bool {
        let deadline = {
            let mut registry = self.registry.lock();
            let Some(r) = registry.get_mut(task_id) else {
                return false;
            };
            if generation.is_some_and(|g| g != r.generation)
                || r.status != WorkerStatus::Running
                || r.terminating
            {
                return false;
            }
            if observed_activity_ms.is_some_and(|seen| r.last_activity_ms > seen) {
                tracing::debug!(task_id, "stall dropped, worker active since check");
                return false;
            }
            r.status = WorkerStatus::TimedOut;
            r.deadline.take()
        };
        if let Some(timer) = deadline {
            self.clock.cancel(timer);
        }
        tracing::warn!(task_id, reason = %reason, "worker timed out");
        self.events.publish(&PoolEvent::ProcessTimeout {
            task_id: task_id.to_string(),
        });
        self.kill(task_id);
        true
    }

    fn kill(&self, task_id: &str) -> bool {
        let (handle, generation, deadline) = {
            let mut registry = self.registry.lock();
            let Some(r) = registry.get_mut(task_id) else {
                tracing::debug!(task_id, "kill of unknown worker ignored");
                return false;
            };
            if r.status.is_terminal() || r.terminating {
                return false;
            }
            r.terminating = true;
            (Arc::clone(&r.handle), r.generation, r.deadline.take())
        };
        self.watchdog.stop_monitoring(task_id);
        if let Some(timer) = deadline {
            self.clock.cancel(timer);
        }

        let already_exited = {
            let mut worker = handle.lock();
            if worker.has_exited() {
                true
            } else {
                if let Err(e) = worker.graceful_stop() {
                    tracing::warn!(task_id, error = %e, "graceful stop failed");
                }
                false
            }
        };
        if already_exited {
            self.finish_kill(task_id, generation);
            return true;
        }
        tracing::info!(task_id, grace_ms = self.config.kill_grace_ms, "graceful stop sent");

        let weak = self.self_ref.clone();
        let id = task_id.to_string();
        let grace_handle = Arc::clone(&handle);
        let scheduled = self.clock.schedule_once(
            self.config.kill_grace(),
            timer_fn(move || {
                force_stop_if_running(&id, &grace_handle);
                if let Some(inner) = weak.upgrade() {
                    inner.finish_kill(&id, generation);
                }
                Ok(())
            }),
        );
        match scheduled {
            Ok(timer) => {
                let stale = {
                    let mut registry = self.registry.lock();
                    match registry.get_mut(task_id) {
                        Some(r) if r.generation == generation && !r.status.is_terminal() => {
                            r.termination = Some(timer);
                            false
                        }
                        _ => true,
                    }
                };
                if stale {
                    self.clock.cancel(timer);
                }
            }
            Err(e) => {
                tracing::error!(task_id, error = %e, "cannot arm grace timer, stopping forcefully");
                force_stop_if_running(task_id, &handle);
                self.finish_kill(task_id, generation);
            }
        }
        true
    }

    /// Complete a termination: `Killed` and `process-killed`, once.
    fn finish_kill(&self, task_id: &str, generation: u64) {
        let timers = {
            let mut registry = self.registry.lock();
            let Some(r) = registry.get_mut(task_id) else {
                return;
            };
            if r.generation != generation || r.status.is_terminal() {
                return;
            }
            r.status = WorkerStatus::Killed;
            r.terminating = false;
            [r.deadline.take(), r.termination.take()]
        };
        self.finalize(task_id, timers, &PoolEvent::ProcessKilled {
            task_id: task_id.to_string(),
        });
    }

    fn on_exit(&self, task_id: &str, outcome: ExitOutcome) {
        let (timers, event) = {
            let mut registry = self.registry.lock();
            let Some(r) = registry.get_mut(task_id) else {
                tracing::debug!(task_id, "exit of unknown worker ignored");
                return;
            };
            if r.status.is_terminal() {
                tracing::debug!(task_id, status = ?r.status, "exit after terminal status ignored");
                return;
            }
            let event = if r.terminating || r.status == WorkerStatus::TimedOut {
                r.status = WorkerStatus::Killed;
                PoolEvent::ProcessKilled {
                    task_id: task_id.to_string(),
                }
            } else {
                match outcome {
                    ExitOutcome::Success => {
                        r.status = WorkerStatus::Completed;
                        PoolEvent::ProcessCompleted {
                            task_id: task_id.to_string(),
                            success: true,
                        }
                    }
                    ExitOutcome::Failure(failure) => {
                        r.status = WorkerStatus::Failed;
                        PoolEvent::ProcessFailed {
                            task_id: task_id.to_string(),
                            error: failure.to_string(),
                        }
                    }
                }
            };
            r.terminating = false;
            ([r.deadline.take(), r.termination.take()], event)
        };
        self.finalize(task_id, timers, &event);
    }

    fn finalize(&self, task_id: &str, timers: [Option<TimerHandle>; 2], event: &PoolEvent) {
        self.watchdog.stop_monitoring(task_id);
        for timer in timers.into_iter().flatten() {
            self.clock.cancel(timer);
        }
        tracing::info!(task_id, event = event.name(), "worker finished");
        self.events.publish(event);
    }

    fn kill_all(&self) -> usize {
        let ids: Vec<TaskId> = self
            .registry
            .lock()
            .values()
            .filter(|r| r.status.occupies_slot() && !r.terminating)
            .map(|r| r.task_id.clone())
            .collect();
        ids.iter().filter(|id| self.kill(id)).count()
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst) > 0
    }

    fn cleanup(&self) {
        let _shutdown = ShutdownGuard::enter(&self.shutting_down);
        self.watchdog.stop_all();
        let killed = self.kill_all();
        let drained: Vec<WorkerRecord<H>> =
            self.registry.lock().drain().map(|(_, r)| r).collect();
        if drained.is_empty() {
            tracing::debug!("cleanup on empty pool");
            return;
        }

        let mut in_flight = Vec::new();
        for record in drained {
            if let Some(timer) = record.deadline {
                self.clock.cancel(timer);
            }
            // Pending grace timers keep their own handle to the worker and
            // stay armed.
            if record.status.occupies_slot() {
                in_flight.push(record.task_id);
            }
        }
        tracing::info!(killed, in_flight = in_flight.len(), "pool cleaned up");
        for task_id in in_flight {
            self.events.publish(&PoolEvent::ProcessKilled { task_id });
        }
    }

    fn is_running(&self, task_id: &str) -> bool {
        self.registry
            .lock()
            .get(task_id)
            .is_some_and(|r| r.status == WorkerStatus::Running && !r.terminating)
    }
}

fn force_stop_if_running<H: WorkerHandle>(task_id: &str, handle: &Mutex<H>) {
    let mut worker = handle.lock();
    if worker.has_exited() {
        return;
    }
    match worker.force_stop() {
        Ok(()) => tracing::warn!(task_id, "grace window elapsed, worker force-stopped"),
        Err(e) => tracing::error!(task_id, error = %e, "force stop failed"),
    }
}

impl<H: WorkerHandle> WatchdogDelegate for PoolInner<H> {
    fn activity(&self, task_id: &str) -> Option<ActivitySnapshot> {
        let registry = self.registry.lock();
        let r = registry.get(task_id)?;
        (r.status == WorkerStatus::Running && !r.terminating).then_some(ActivitySnapshot {
            last_activity_ms: r.last_activity_ms,
            heartbeat_warned: r.heartbeat_warned,
            pid: r.pid,
        })
    }

    fn on_heartbeat_warning(&self, task_id: &str, threshold_ms: u64, observed_activity_ms: u64) {
        let newly_warned = {
            let mut registry = self.registry.lock();
            registry.get_mut(task_id).is_some_and(|r| {
                let fire = r.status == WorkerStatus::Running
                    && !r.terminating
                    && !r.heartbeat_warned
                    && r.last_activity_ms <= observed_activity_ms;
                if fire {
                    r.heartbeat_warned = true;
                }
                fire
            })
        };
        if newly_warned {
            self.events.publish(&PoolEvent::HeartbeatWarning {
                task_id: task_id.to_string(),
                threshold_ms,
            });
        }
    }

    fn on_stall(&self, task_id: &str, silence_ms: u64, observed_activity_ms: u64) -> bool {
        self.time_out(
            task_id,
            None,
            Some(observed_activity_ms),
            &WorkerFailure::HeartbeatStall { silence_ms },
        )
    }

    fn record_resource_sample(&self, task_id: &str, usage: ResourceUsage) {
        if let Some(r) = self.registry.lock().get_mut(task_id) {
            r.push_sample(usage);
        }
    }

    fn on_resource_warning(&self, task_id: &str, usage: ResourceUsage) {
        if !self.is_running(task_id) {
            return;
        }
        tracing::warn!(
            task_id,
            cpu_percent = usage.cpu_percent,
            memory_bytes = usage.memory_bytes,
            error = %WorkerFailure::ResourceExhaustion,
            "resource limits exceeded"
        );
        self.events.publish(&PoolEvent::ResourceWarning {
            task_id: task_id.to_string(),
            usage,
        });
    }
}
