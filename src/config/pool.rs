//! Pool configuration structures.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::watchdog::WatchdogConfig;
use crate::util::serde::ResourceLimits;

/// Prefix of every environment variable read by [`PoolConfig::from_env`].
pub const ENV_PREFIX: &str = "WORKER_POOL_";

/// Default progress marker looked for in worker output.
pub const DEFAULT_PROGRESS_MARKER: &str = "[PROGRESS]";

/// Pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum concurrently running workers.
    pub max_concurrent: usize,
    /// Overall per-worker time budget in milliseconds.
    pub timeout_ms: u64,
    /// Silence before a heartbeat warning, in milliseconds.
    pub heartbeat_warn_ms: u64,
    /// Silence before the worker is declared stalled and killed.
    pub heartbeat_kill_ms: u64,
    /// Watchdog check period in milliseconds.
    pub heartbeat_check_interval_ms: u64,
    /// Delay between the graceful and the forceful stop signal.
    pub kill_grace_ms: u64,
    /// Maximum tasks waiting in the admission gate.
    pub max_queue_depth: usize,
    /// Resource samples kept per worker.
    pub sample_history: usize,
    /// Advisory resource limits; exceeding them only emits a warning.
    pub resource_limits: Option<ResourceLimits>,
    /// Output marker whose trailing text is recorded as progress.
    pub progress_marker: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            timeout_ms: 900_000,
            heartbeat_warn_ms: 60_000,
            heartbeat_kill_ms: 300_000,
            heartbeat_check_interval_ms: 5_000,
            kill_grace_ms: 5_000,
            max_queue_depth: 1024,
            sample_history: 16,
            resource_limits: None,
            progress_marker: DEFAULT_PROGRESS_MARKER.to_string(),
        }
    }
}

impl PoolConfig {
    /// Validate pool configuration values.
    ///
    /// # Errors
    ///
    /// A description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent == 0 {
            return Err("max_concurrent must be greater than 0".into());
        }
        if self.timeout_ms == 0 {
            return Err("timeout_ms must be greater than 0".into());
        }
        if self.heartbeat_warn_ms == 0 {
            return Err("heartbeat_warn_ms must be greater than 0".into());
        }
        if self.heartbeat_kill_ms < self.heartbeat_warn_ms {
            return Err(format!(
                "heartbeat_kill_ms ({}) must not be below heartbeat_warn_ms ({})",
                self.heartbeat_kill_ms, self.heartbeat_warn_ms
            ));
        }
        if self.heartbeat_check_interval_ms == 0 {
            return Err("heartbeat_check_interval_ms must be greater than 0".into());
        }
        if self.kill_grace_ms == 0 {
            return Err("kill_grace_ms must be greater than 0".into());
        }
        if self.max_queue_depth == 0 {
            return Err("max_queue_depth must be greater than 0".into());
        }
        if self.sample_history == 0 {
            return Err("sample_history must be greater than 0".into());
        }
        if self.progress_marker.is_empty() {
            return Err("progress_marker must not be empty".into());
        }
        if let Some(limits) = &self.resource_limits {
            if limits.max_cpu_percent.is_some_and(|cpu| cpu.is_nan() || cpu <= 0.0) {
                return Err("resource_limits.max_cpu_percent must be positive".into());
            }
            if limits.max_memory_bytes == Some(0) {
                return Err("resource_limits.max_memory_bytes must be greater than 0".into());
            }
        }
        Ok(())
    }

    /// Parse pool configuration from a JSON string and validate.
    ///
    /// Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Parse or validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from `WORKER_POOL_*` environment variables, after
    /// loading a `.env` file if one exists. Unset variables keep defaults.
    ///
    /// # Errors
    ///
    /// Unparseable variable or validation failure.
    pub fn from_env() -> Result<Self, String> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "loaded .env file");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup using the
    /// `WORKER_POOL_*` names, then validate.
    ///
    /// # Errors
    ///
    /// Unparseable value or validation failure.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        set_parsed(&mut cfg.max_concurrent, "MAX_CONCURRENT", get("MAX_CONCURRENT"))?;
        set_parsed(&mut cfg.timeout_ms, "TIMEOUT_MS", get("TIMEOUT_MS"))?;
        set_parsed(&mut cfg.heartbeat_warn_ms, "HEARTBEAT_WARN_MS", get("HEARTBEAT_WARN_MS"))?;
        set_parsed(&mut cfg.heartbeat_kill_ms, "HEARTBEAT_KILL_MS", get("HEARTBEAT_KILL_MS"))?;
        set_parsed(
            &mut cfg.heartbeat_check_interval_ms,
            "HEARTBEAT_CHECK_INTERVAL_MS",
            get("HEARTBEAT_CHECK_INTERVAL_MS"),
        )?;
        set_parsed(&mut cfg.kill_grace_ms, "KILL_GRACE_MS", get("KILL_GRACE_MS"))?;
        set_parsed(&mut cfg.max_queue_depth, "MAX_QUEUE_DEPTH", get("MAX_QUEUE_DEPTH"))?;
        set_parsed(&mut cfg.sample_history, "SAMPLE_HISTORY", get("SAMPLE_HISTORY"))?;
        if let Some(marker) = get("PROGRESS_MARKER") {
            cfg.progress_marker = marker;
        }

        let max_cpu = parse_opt::<f64>("MAX_CPU_PERCENT", get("MAX_CPU_PERCENT"))?;
        let max_mem = parse_opt::<u64>("MAX_MEMORY_BYTES", get("MAX_MEMORY_BYTES"))?;
        if max_cpu.is_some() || max_mem.is_some() {
            cfg.resource_limits = Some(ResourceLimits {
                max_cpu_percent: max_cpu,
                max_memory_bytes: max_mem,
            });
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Overall per-worker time budget.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Grace window between graceful and forceful stop.
    #[must_use]
    pub const fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Thresholds handed to the watchdog.
    #[must_use]
    pub fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            check_interval: Duration::from_millis(self.heartbeat_check_interval_ms),
            warn_ms: self.heartbeat_warn_ms,
            kill_ms: self.heartbeat_kill_ms,
            resource_limits: self.resource_limits,
        }
    }
}

fn parse_opt<T>(name: &str, raw: Option<String>) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.map(|value| {
        value
            .trim()
            .parse::<T>()
            .map_err(|e| format!("{ENV_PREFIX}{name}: invalid value `{value}`: {e}"))
    })
    .transpose()
}

fn set_parsed<T>(slot: &mut T, name: &str, raw: Option<String>) -> Result<(), String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(value) = parse_opt(name, raw)? {
        *slot = value;
    }
    Ok(())
}
