//! Supervised execution of external worker processes.
//!
//! One supervised process per call: launch, capture stdout/stderr interleaved
//! in arrival order, enforce a wall-clock timeout, and terminate the whole
//! process group on timeout or cancellation. The supervisor never interprets
//! exit codes and never applies remediation; that is the controller's job.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use temper_types::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::watch;

/// Result of one supervised process run.
#[derive(Debug, Clone)]
pub struct SupervisorReport {
    /// Exit code of the worker; -1 when it was killed or had no code.
    pub exit_code: i32,
    /// stdout and stderr lines, interleaved in arrival order.
    pub combined_output: String,
    pub timed_out: bool,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl SupervisorReport {
    /// A zero exit that neither timed out nor was cancelled.
    pub fn is_clean_exit(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.cancelled
    }
}

/// Sender half of a cancellation pair, held by the controller's in-flight map.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Receiver half, passed into each supervised launch.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested; pends forever if the handle
    /// is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Create a linked cancel handle/token pair.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

/// Seam between the controller and process execution, so tests can substitute
/// scripted launchers.
#[async_trait]
pub trait StageLauncher: Send + Sync {
    async fn launch(
        &self,
        command: &str,
        working_dir: &Path,
        timeout: Duration,
        cancel: CancelToken,
    ) -> Result<SupervisorReport>;
}

/// Launches workers as `bash -c` children in their own process group.
#[derive(Debug, Default)]
pub struct ProcessSupervisor;

#[async_trait]
impl StageLauncher for ProcessSupervisor {
    async fn launch(
        &self,
        command: &str,
        working_dir: &Path,
        timeout: Duration,
        mut cancel: CancelToken,
    ) -> Result<SupervisorReport> {
        let mut cmd = tokio::process::Command::new("bash");
        cmd.args(["-c", command])
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so timeout/cancel can take down the whole tree.
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let start = tokio::time::Instant::now();
        let mut child = cmd.spawn()?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let mut out_done = false;
        let mut err_done = false;

        let mut combined = String::new();
        let mut timed_out = false;
        let mut was_cancelled = false;

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        while !(out_done && err_done) {
            tokio::select! {
                line = out_lines.next_line(), if !out_done => match line {
                    Ok(Some(l)) => {
                        combined.push_str(&l);
                        combined.push('\n');
                    }
                    _ => out_done = true,
                },
                line = err_lines.next_line(), if !err_done => match line {
                    Ok(Some(l)) => {
                        combined.push_str(&l);
                        combined.push('\n');
                    }
                    _ => err_done = true,
                },
                _ = &mut deadline => {
                    timed_out = true;
                    break;
                }
                _ = cancel.cancelled() => {
                    was_cancelled = true;
                    break;
                }
            }
        }

        let exit_code = if timed_out || was_cancelled {
            terminate_group(&mut child).await;
            -1
        } else {
            let status = child.wait().await?;
            status.code().unwrap_or(-1)
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        if timed_out {
            tracing::warn!(
                timeout_ms = timeout.as_millis() as u64,
                "supervised process exceeded its wall-clock budget"
            );
        }

        Ok(SupervisorReport {
            exit_code,
            combined_output: combined,
            timed_out,
            cancelled: was_cancelled,
            duration_ms,
        })
    }
}

/// SIGTERM the process group, then SIGKILL after a short grace period.
async fn terminate_group(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGTERM);
            }
        }
        tokio::select! {
            _ = child.wait() => {}
            _ = tokio::time::sleep(Duration::from_secs(2)) => {
                let _ = child.kill().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.kill().await;
    }
}
