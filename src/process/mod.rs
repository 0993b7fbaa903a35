//! Child interpreter lifecycle: spawning, supervision, and teardown.

pub(crate) mod pipes;
mod spawn;

pub use spawn::{spawn_program, SpawnOptions};

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::transport::status::StatusEvent;
use crate::{Error, Result};

/// Grace period between SIGTERM and SIGKILL.
pub(crate) const TERMINATION_GRACE: Duration = Duration::from_secs(5);

/// Handle to a running child interpreter with its private pipes.
pub struct PythonProcess {
    pid: u32,
    inner: Arc<Mutex<Option<Child>>>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    data_in: Option<std::fs::File>,
    data_out: Option<std::fs::File>,
    status_events: Option<mpsc::UnboundedReceiver<StatusEvent>>,
    signal_task: Option<JoinHandle<()>>,
}

impl PythonProcess {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        pid: u32,
        child: Child,
        stdin: Option<ChildStdin>,
        stdout: Option<ChildStdout>,
        stderr: Option<ChildStderr>,
        data_in: std::fs::File,
        data_out: std::fs::File,
        status_events: mpsc::UnboundedReceiver<StatusEvent>,
        propagate_signals: bool,
    ) -> Self {
        let inner = Arc::new(Mutex::new(Some(child)));
        let signal_task =
            propagate_signals.then(|| spawn_signal_handler(Arc::clone(&inner), pid));
        Self {
            pid,
            inner,
            stdin,
            stdout,
            stderr,
            data_in: Some(data_in),
            data_out: Some(data_out),
            status_events: Some(status_events),
            signal_task,
        }
    }

    /// OS process id of the child.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Check if the child is still alive.
    pub async fn is_alive(&self) -> bool {
        if let Some(ref mut child) = *self.inner.lock().await {
            child.try_wait().ok().flatten().is_none()
        } else {
            false
        }
    }

    /// Take the child's stdin pipe.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Take the child's stdout pipe.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Take the child's stderr pipe.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Take the parent-side read end of `DATA_IN` (child output).
    pub fn take_data_in(&mut self) -> Option<std::fs::File> {
        self.data_in.take()
    }

    /// Take the parent-side write end of `DATA_OUT` (child input).
    pub fn take_data_out(&mut self) -> Option<std::fs::File> {
        self.data_out.take()
    }

    /// Take the status event stream.
    pub fn take_status_events(&mut self) -> Option<mpsc::UnboundedReceiver<StatusEvent>> {
        self.status_events.take()
    }

    /// Spawn forwarder tasks that surface child stdout/stderr through
    /// tracing, line by line.
    pub fn forward_output(&mut self) {
        let pid = self.pid;
        if let Some(stdout) = self.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!("[python {pid}] {line}");
                }
            });
        }
        if let Some(stderr) = self.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!("[python {pid}] {line}");
                }
            });
        }
    }

    /// Wait for the child to exit.
    ///
    /// Returns `Ok(())` on a clean exit, [`Error::Killed`] when the child
    /// died to a signal, and [`Error::Exit`] for any other non-zero status.
    pub async fn wait(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let child = guard.as_mut().ok_or(Error::Closed)?;
        let status = child.wait().await?;
        map_exit_status(status)
    }

    /// Gracefully stop the child: SIGTERM, wait up to the default grace
    /// period for natural exit, then force-kill.
    pub async fn terminate(&self) -> Result<()> {
        self.terminate_with_grace(TERMINATION_GRACE).await
    }

    /// [`terminate`](Self::terminate) with an explicit grace period.
    pub async fn terminate_with_grace(&self, grace: Duration) -> Result<()> {
        graceful_terminate(&self.inner, self.pid, grace).await
    }

    /// Kill the child immediately.
    pub async fn kill(&self) -> Result<()> {
        if let Some(ref mut child) = *self.inner.lock().await {
            child
                .kill()
                .await
                .map_err(|e| Error::Spawn(format!("failed to kill process: {e}")))?;
        }
        Ok(())
    }
}

impl Drop for PythonProcess {
    fn drop(&mut self) {
        if let Some(task) = self.signal_task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for PythonProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PythonProcess").field("pid", &self.pid).finish()
    }
}

fn map_exit_status(status: std::process::ExitStatus) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    match status.code() {
        Some(code) => Err(Error::Exit(code)),
        None => Err(Error::Killed),
    }
}

async fn graceful_terminate(
    inner: &Mutex<Option<Child>>,
    pid: u32,
    grace: Duration,
) -> Result<()> {
    let mut guard = inner.lock().await;
    let Some(child) = guard.as_mut() else {
        return Ok(());
    };
    if child.try_wait()?.is_some() {
        return Ok(());
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }

    let start = Instant::now();
    while start.elapsed() < grace {
        if child.try_wait().ok().flatten().is_some() {
            tracing::debug!("process {pid} terminated gracefully");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    tracing::warn!("process {pid} did not terminate gracefully, forcing kill");
    child
        .kill()
        .await
        .map_err(|e| Error::Spawn(format!("failed to kill process: {e}")))?;
    Ok(())
}

/// On SIGINT/SIGTERM, gracefully terminate the child.
fn spawn_signal_handler(inner: Arc<Mutex<Option<Child>>>, pid: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let (Ok(mut interrupt), Ok(mut terminate)) = (
                signal(SignalKind::interrupt()),
                signal(SignalKind::terminate()),
            ) else {
                return;
            };
            tokio::select! {
                _ = interrupt.recv() => {}
                _ = terminate.recv() => {}
            }
            tracing::info!("signal received, terminating child {pid}");
            let _ = graceful_terminate(&inner, pid, TERMINATION_GRACE).await;
        }
        #[cfg(not(unix))]
        {
            let _ = (inner, pid);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_exit_status() {
        use std::os::unix::process::ExitStatusExt;
        use std::process::ExitStatus;

        assert!(map_exit_status(ExitStatus::from_raw(0)).is_ok());
        assert!(matches!(
            map_exit_status(ExitStatus::from_raw(3 << 8)),
            Err(Error::Exit(3))
        ));
        // raw status 9 == killed by SIGKILL
        assert!(matches!(
            map_exit_status(ExitStatus::from_raw(9)),
            Err(Error::Killed)
        ));
    }
}
