//! Resource sampling for running workers.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::util::serde::ResourceUsage;

/// Periodic CPU/memory sampling, polled by the watchdog on its check cadence.
pub trait ResourceSampler: Send + Sync {
    /// Sample a worker. `None` when no data is available (process gone,
    /// unsupported platform, ...).
    fn sample(&self, task_id: &str, pid: Option<u32>) -> Option<ResourceUsage>;

    /// Monitoring of `task_id` ended; drop any per-worker state kept for it.
    fn forget(&self, _task_id: &str, _pid: Option<u32>) {}
}

/// Sampler returning values set by the caller. Useful for tests and for
/// workers whose usage is reported out of band.
#[derive(Default)]
pub struct ManualSampler {
    usage: Mutex<HashMap<String, ResourceUsage>>,
    forgotten: Mutex<Vec<String>>,
}

impl ManualSampler {
    /// Create an empty sampler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the usage reported for `task_id`.
    pub fn set(&self, task_id: &str, usage: ResourceUsage) {
        self.usage.lock().insert(task_id.to_string(), usage);
    }

    /// Stop reporting usage for `task_id`.
    pub fn clear(&self, task_id: &str) {
        self.usage.lock().remove(task_id);
    }

    /// Task ids whose monitoring has ended, in order.
    #[must_use]
    pub fn forgotten(&self) -> Vec<String> {
        self.forgotten.lock().clone()
    }
}

impl ResourceSampler for ManualSampler {
    fn sample(&self, task_id: &str, _pid: Option<u32>) -> Option<ResourceUsage> {
        self.usage.lock().get(task_id).copied()
    }

    /// Values set by the caller are kept; only the release is recorded.
    fn forget(&self, task_id: &str, _pid: Option<u32>) {
        self.forgotten.lock().push(task_id.to_string());
    }
}

/// `/proc` ticks per second. Linux reports `utime`/`stime` in `USER_HZ`,
/// which is fixed at 100 for userspace.
const USER_HZ: f64 = 100.0;

/// Linux `/proc` sampler: resident memory from `status`, CPU from the
/// `utime + stime` delta since the previous sample of the same pid.
pub struct ProcfsSampler {
    cpus: f64,
    previous: Mutex<HashMap<u32, (u64, std::time::Instant)>>,
}

impl ProcfsSampler {
    /// Create a sampler normalising CPU usage over all logical cores.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new() -> Self {
        Self {
            cpus: num_cpus::get().max(1) as f64,
            previous: Mutex::new(HashMap::new()),
        }
    }

    fn read_rss_bytes(pid: u32) -> Option<u64> {
        let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
        parse_vm_rss_kb(&status).map(|kb| kb * 1024)
    }

    fn read_cpu_ticks(pid: u32) -> Option<u64> {
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        parse_stat_ticks(&stat)
    }
}

impl Default for ProcfsSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for ProcfsSampler {
    #[allow(clippy::cast_precision_loss)]
    fn sample(&self, task_id: &str, pid: Option<u32>) -> Option<ResourceUsage> {
        let pid = pid?;
        let Some(memory_bytes) = Self::read_rss_bytes(pid) else {
            tracing::trace!(task_id, pid, "no /proc data for worker");
            self.previous.lock().remove(&pid);
            return None;
        };
        let ticks = Self::read_cpu_ticks(pid)?;
        let now = std::time::Instant::now();
        let prev = self.previous.lock().insert(pid, (ticks, now));
        let cpu_percent = prev.map_or(0.0, |(prev_ticks, at)| {
            let elapsed = now.duration_since(at).as_secs_f64();
            if elapsed <= f64::EPSILON {
                return 0.0;
            }
            let busy = ticks.saturating_sub(prev_ticks) as f64 / USER_HZ;
            (busy / elapsed / self.cpus * 100.0).min(100.0)
        });
        Some(ResourceUsage {
            cpu_percent,
            memory_bytes,
        })
    }

    fn forget(&self, task_id: &str, pid: Option<u32>) {
        if let Some(pid) = pid {
            if self.previous.lock().remove(&pid).is_some() {
                tracing::trace!(task_id, pid, "cpu baseline dropped");
            }
        }
    }
}

fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

/// `utime + stime` from `/proc/<pid>/stat`. The command name may contain
/// spaces, so fields are counted after the closing parenthesis.
fn parse_stat_ticks(stat: &str) -> Option<u64> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // After comm: state is field 3, utime field 14, stime field 15.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_sampler_reports_what_was_set() {
        let sampler = ManualSampler::new();
        assert!(sampler.sample("t", None).is_none());
        let usage = ResourceUsage {
            cpu_percent: 12.5,
            memory_bytes: 4096,
        };
        sampler.set("t", usage);
        assert_eq!(sampler.sample("t", Some(1)), Some(usage));
        sampler.clear("t");
        assert!(sampler.sample("t", None).is_none());
    }

    #[test]
    fn parses_vm_rss() {
        let status = "Name:\tcat\nVmPeak:\t  9000 kB\nVmRSS:\t  1234 kB\nThreads:\t1\n";
        assert_eq!(parse_vm_rss_kb(status), Some(1234));
        assert_eq!(parse_vm_rss_kb("Name:\tkthread\n"), None);
    }

    #[test]
    fn parses_stat_ticks_with_spaces_in_comm() {
        let stat = "4242 (my worker) S 1 4242 4242 0 -1 4194560 100 0 0 0 250 50 0 0 20 0 1 0 1000 0 0";
        assert_eq!(parse_stat_ticks(stat), Some(300));
    }

    #[test]
    fn procfs_sampler_without_pid_is_none() {
        let sampler = ProcfsSampler::new();
        assert!(sampler.sample("t", None).is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn procfs_forget_drops_cpu_baseline() {
        let sampler = ProcfsSampler::new();
        let pid = std::process::id();
        assert!(sampler.sample("self", Some(pid)).is_some());
        assert!(sampler.previous.lock().contains_key(&pid));

        sampler.forget("self", Some(pid));
        assert!(sampler.previous.lock().is_empty());
        sampler.forget("self", None);
    }

    #[test]
    fn manual_sampler_records_forgotten_tasks() {
        let sampler = ManualSampler::new();
        let usage = ResourceUsage {
            cpu_percent: 1.0,
            memory_bytes: 1,
        };
        sampler.set("t", usage);
        sampler.forget("t", Some(7));
        assert_eq!(sampler.forgotten(), vec!["t"]);
        assert_eq!(sampler.sample("t", None), Some(usage));
    }
}
