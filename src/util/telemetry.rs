//! Structured logging setup.
//!
//! Every lifecycle transition in the pool is logged through `tracing` with a
//! `task_id` field. Applications normally install their own subscriber; the
//! helpers here cover binaries and tests that want sensible output without
//! further setup.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset: pool lifecycle at `info`, everything
/// else at `warn`.
pub const DEFAULT_LOG_FILTER: &str = "warn,worker_watchdog_pool=info";

/// Build the filter from `RUST_LOG`, falling back to [`DEFAULT_LOG_FILTER`].
#[must_use]
pub fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Install a fmt subscriber unless one is already set. Returns whether this
/// call installed it.
pub fn init_tracing() -> bool {
    if tracing::dispatcher::has_been_set() {
        return false;
    }
    tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_target(false)
        .try_init()
        .is_ok()
}
