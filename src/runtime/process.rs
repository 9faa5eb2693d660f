//! OS child processes as pool workers.

use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use super::tokio_spawner::Spawn;
use crate::core::error::WorkerFailure;
use crate::core::process_pool::ProcessPoolManager;
use crate::core::worker::{ExitOutcome, WorkerHandle};

/// [`WorkerHandle`] for an OS process addressed by pid.
///
/// The process itself is owned by the supervising task that waits on it;
/// this handle only signals it and observes the shared exit flag.
#[derive(Debug, Clone)]
pub struct ChildWorker {
    pid: u32,
    exited: Arc<AtomicBool>,
}

impl ChildWorker {
    /// Create a handle for `pid`. `exited` must be set once the process has
    /// been reaped.
    #[must_use]
    pub const fn new(pid: u32, exited: Arc<AtomicBool>) -> Self {
        Self { pid, exited }
    }

    #[cfg(unix)]
    fn signal(&self, signal: libc::c_int) -> io::Result<()> {
        if self.exited.load(Ordering::Acquire) {
            return Ok(());
        }
        let pid = libc::pid_t::try_from(self.pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        #[allow(unsafe_code)]
        let ret = unsafe { libc::kill(pid, signal) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
}

impl WorkerHandle for ChildWorker {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    #[cfg(unix)]
    fn graceful_stop(&mut self) -> io::Result<()> {
        self.signal(libc::SIGTERM)
    }

    #[cfg(unix)]
    fn force_stop(&mut self) -> io::Result<()> {
        self.signal(libc::SIGKILL)
    }

    #[cfg(not(unix))]
    fn graceful_stop(&mut self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "signals are only supported on unix",
        ))
    }

    #[cfg(not(unix))]
    fn force_stop(&mut self) -> io::Result<()> {
        self.graceful_stop()
    }

    fn has_exited(&mut self) -> bool {
        self.exited.load(Ordering::Acquire)
    }
}

/// Text following `marker` in `line`, trimmed.
#[must_use]
pub fn progress_text<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    line.find(marker)
        .map(|at| line[at + marker.len()..].trim())
}

/// Spawn `command` on `spawner` and run it as pool worker `task_id`.
///
/// The supervising task and both output readers run on `spawner`. The
/// supervising task registers the child, feeds every stdout/stderr line
/// into [`ProcessPoolManager::update_process_activity`] (a line containing the
/// configured progress marker also records the text after it), and reports the
/// exit status through [`ProcessPoolManager::handle_process_exit`]. A command
/// that fails to start is reported with
/// [`ProcessPoolManager::report_spawn_failure`].
pub fn launch_worker<S>(
    pool: &ProcessPoolManager<ChildWorker>,
    spawner: &S,
    task_id: &str,
    mut command: Command,
) where
    S: Spawn + Clone + Send + Sync + 'static,
{
    let pool = pool.clone();
    let task_id = task_id.to_string();
    let readers = spawner.clone();
    spawner.spawn(async move {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                pool.report_spawn_failure(&task_id, e);
                return;
            }
        };
        let Some(pid) = child.id() else {
            pool.report_spawn_failure(&task_id, "child exited before it could be registered");
            return;
        };

        let exited = Arc::new(AtomicBool::new(false));
        if let Err(e) = pool.register_process(&task_id, ChildWorker::new(pid, Arc::clone(&exited))) {
            tracing::error!(task_id = %task_id, pid, error = %e, "registration failed, killing child");
            if let Err(e) = child.start_kill() {
                tracing::warn!(task_id = %task_id, error = %e, "kill of unregistered child failed");
            }
            let _ = child.wait().await;
            return;
        }

        let marker = pool.config().progress_marker.clone();
        if let Some(stdout) = child.stdout.take() {
            readers.spawn(stream_activity(pool.clone(), task_id.clone(), marker.clone(), stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.spawn(stream_activity(pool.clone(), task_id.clone(), marker, stderr));
        }

        let outcome = match child.wait().await {
            Ok(status) => {
                tracing::debug!(task_id = %task_id, pid, status = %status, "child exited");
                ExitOutcome::from(status)
            }
            Err(e) => {
                tracing::error!(task_id = %task_id, pid, error = %e, "waiting on child failed");
                ExitOutcome::Failure(WorkerFailure::UnexpectedExit { code: None })
            }
        };
        exited.store(true, Ordering::Release);
        pool.handle_process_exit(&task_id, outcome);
    });
}

async fn stream_activity<R>(
    pool: ProcessPoolManager<ChildWorker>,
    task_id: String,
    marker: String,
    reader: R,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let bytes = u64::try_from(line.len()).unwrap_or(u64::MAX).saturating_add(1);
                pool.update_process_activity(&task_id, bytes, progress_text(&line, &marker));
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(task_id = %task_id, error = %e, "worker output stream closed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_text_after_marker() {
        assert_eq!(
            progress_text("[PROGRESS] 3/10 files", "[PROGRESS]"),
            Some("3/10 files")
        );
        assert_eq!(progress_text("log: [PROGRESS]done", "[PROGRESS]"), Some("done"));
        assert_eq!(progress_text("plain output", "[PROGRESS]"), None);
    }

    #[test]
    fn exited_child_is_not_signalled() {
        let mut worker = ChildWorker::new(u32::MAX, Arc::new(AtomicBool::new(true)));
        assert!(worker.has_exited());
        assert_eq!(worker.pid(), Some(u32::MAX));
        #[cfg(unix)]
        assert!(worker.graceful_stop().is_ok());
    }
}
