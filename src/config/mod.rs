//! Configuration models for the pool, watchdog thresholds, and timeouts.

pub mod pool;

pub use pool::{PoolConfig, DEFAULT_PROGRESS_MARKER, ENV_PREFIX};
