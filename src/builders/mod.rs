//! Builders wiring configuration, clock, sampler and sinks together.

pub mod pool_builder;

pub use pool_builder::OrchestratorBuilder;
