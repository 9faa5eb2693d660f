//! Shared serializable value types.

use serde::{Deserialize, Serialize};

/// Caller-supplied task identifier.
pub type TaskId = String;

/// Generate a fresh random task identifier.
#[must_use]
pub fn new_task_id() -> TaskId {
    uuid::Uuid::new_v4().to_string()
}

/// One resource-usage sample for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU usage as a percentage of the whole machine (0-100).
    pub cpu_percent: f64,
    /// Resident memory in bytes.
    pub memory_bytes: u64,
}

/// Advisory resource thresholds. `None` disables the respective check.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum CPU percentage before a warning is raised.
    #[serde(default)]
    pub max_cpu_percent: Option<f64>,
    /// Maximum resident memory in bytes before a warning is raised.
    #[serde(default)]
    pub max_memory_bytes: Option<u64>,
}

impl ResourceLimits {
    /// Whether `usage` exceeds any configured limit.
    #[must_use]
    pub fn is_exceeded_by(&self, usage: &ResourceUsage) -> bool {
        let cpu = self
            .max_cpu_percent
            .is_some_and(|max| usage.cpu_percent > max);
        let memory = self
            .max_memory_bytes
            .is_some_and(|max| usage.memory_bytes > max);
        cpu || memory
    }
}
