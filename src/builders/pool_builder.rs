//! Builder to construct a pool and its admission gate from configuration.

use std::sync::Arc;

use crate::config::PoolConfig;
use crate::core::{
    AdmissionGate, EventSink, PoolError, ProcessPoolManager, ResourceSampler, SchedulingClock,
    SpawnStep, WorkerHandle,
};

/// Assembles a [`ProcessPoolManager`] from a [`PoolConfig`] plus injected
/// collaborators.
///
/// The clock is always injected here and never read from configuration.
/// Without an explicit clock a [`TokioClock`](crate::core::TokioClock) on the
/// current runtime is used when the `tokio-runtime` feature is enabled.
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: PoolConfig,
    clock: Option<Arc<dyn SchedulingClock>>,
    sampler: Option<Arc<dyn ResourceSampler>>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl OrchestratorBuilder {
    /// Start from `config`.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Use `clock` for every timer.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn SchedulingClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Poll `sampler` on the watchdog cadence.
    #[must_use]
    pub fn with_sampler(mut self, sampler: Arc<dyn ResourceSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Subscribe `sink` before any event can be emitted.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Configuration the pool will be built with.
    #[must_use]
    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn resolve_clock(&self) -> Result<Arc<dyn SchedulingClock>, PoolError> {
        if let Some(clock) = &self.clock {
            return Ok(Arc::clone(clock));
        }
        #[cfg(feature = "tokio-runtime")]
        {
            let clock = crate::core::TokioClock::current()?;
            Ok(Arc::new(clock))
        }
        #[cfg(not(feature = "tokio-runtime"))]
        {
            Err(PoolError::InvalidConfig(
                "no clock injected and the tokio-runtime feature is disabled".into(),
            ))
        }
    }

    /// Build the pool.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidConfig`] for an invalid configuration or a missing
    /// clock; [`PoolError::Timer`] when no tokio runtime is available for the
    /// default clock.
    pub fn build_pool<H: WorkerHandle>(&self) -> Result<ProcessPoolManager<H>, PoolError> {
        self.config.validate().map_err(PoolError::InvalidConfig)?;
        let clock = self.resolve_clock()?;
        let pool = ProcessPoolManager::new(self.config.clone(), clock, self.sampler.clone())?;
        for sink in &self.sinks {
            pool.subscribe(Arc::clone(sink));
        }
        tracing::debug!(sinks = self.sinks.len(), "pool built");
        Ok(pool)
    }

    /// Build the pool and an admission gate in front of it. `make_spawn`
    /// receives the new pool so the spawn step can register its workers.
    ///
    /// # Errors
    ///
    /// Same as [`Self::build_pool`].
    pub fn build_gate<P, H, F>(&self, make_spawn: F) -> Result<AdmissionGate<P, H>, PoolError>
    where
        P: Send + 'static,
        H: WorkerHandle,
        F: FnOnce(&ProcessPoolManager<H>) -> Arc<dyn SpawnStep<P>>,
    {
        let pool = self.build_pool::<H>()?;
        let spawn = make_spawn(&pool);
        Ok(AdmissionGate::new(pool, spawn))
    }
}
