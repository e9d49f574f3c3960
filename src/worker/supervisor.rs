use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cgroup::SpawnAttachment;
use crate::config::RunAs;
use crate::jobs::ExitOutcome;

const SHELL: &str = "/bin/sh";
const GROUP_DRAIN_POLL: Duration = Duration::from_millis(5);
const GROUP_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Everything needed to start one job's process.
#[derive(Debug)]
pub struct SpawnRequest<'a> {
    pub job_id: Uuid,
    pub command: &'a str,
    /// Becomes both stdout and stderr of the child.
    pub output: File,
    /// Joins the child to its cgroup before exec.
    pub attachment: Option<SpawnAttachment>,
    pub run_as: Option<RunAs>,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to share output handle: {0}")]
    Output(io::Error),

    #[error("failed to start {SHELL}: {0}")]
    Spawn(io::Error),
}

/// A live child that no waiter owns yet. Hand it to
/// [`ProcessSupervisor::supervise`] or [`ProcessSupervisor::abort`].
#[derive(Debug)]
pub struct SpawnedProcess {
    pub job_id: Uuid,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    child: Child,
}

/// Reported once per supervised child after it has been reaped.
#[derive(Debug, Clone)]
pub struct ExitEvent {
    pub job_id: Uuid,
    pub pid: u32,
    pub outcome: ExitOutcome,
    pub stop_requested: bool,
    pub exited_at: DateTime<Utc>,
}

/// Starts job processes, delivers stop signals, and waits on every child.
///
/// Each supervised child gets a waiter task that owns the `Child` handle.
/// The waiter is the only place the child is reaped and the only place it
/// is signalled, so a signal can never reach a recycled pid.
#[derive(Debug)]
pub struct ProcessSupervisor {
    grace_period: Duration,
    exit_tx: mpsc::UnboundedSender<ExitEvent>,
    stop_tokens: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl ProcessSupervisor {
    pub fn new(grace_period: Duration, exit_tx: mpsc::UnboundedSender<ExitEvent>) -> Self {
        Self {
            grace_period,
            exit_tx,
            stop_tokens: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `command` through `sh -c` in its own process group with output
    /// redirected to the job's file.
    pub fn spawn(&self, request: SpawnRequest<'_>) -> Result<SpawnedProcess, SpawnError> {
        let stderr = request.output.try_clone().map_err(SpawnError::Output)?;

        let mut cmd = Command::new(SHELL);
        cmd.arg("-c")
            .arg(request.command)
            .stdin(Stdio::null())
            .stdout(Stdio::from(request.output))
            .stderr(Stdio::from(stderr))
            .process_group(0);

        if let Some(run_as) = request.run_as {
            cmd.uid(run_as.uid).gid(run_as.gid);
        }

        if let Some(attachment) = request.attachment {
            let procs: OwnedFd = attachment.into_fd();
            // SAFETY: the closure only issues a write(2) on an fd opened by
            // the parent; no allocation or locking happens in the child.
            unsafe {
                cmd.pre_exec(move || {
                    nix::unistd::write(&procs, b"0")
                        .map(|_| ())
                        .map_err(io::Error::from)
                });
            }
        }

        let child = cmd.spawn().map_err(SpawnError::Spawn)?;
        let pid = child.id().ok_or_else(|| {
            SpawnError::Spawn(io::Error::other("child exited before its pid was read"))
        })?;

        tracing::info!(job_id = %request.job_id, pid, "Process spawned");
        Ok(SpawnedProcess {
            job_id: request.job_id,
            pid,
            started_at: Utc::now(),
            child,
        })
    }

    /// Start the waiter task for a spawned child. Its exit is reported on
    /// the exit channel exactly once.
    pub fn supervise(&self, process: SpawnedProcess) {
        let token = CancellationToken::new();
        if let Ok(mut tokens) = self.stop_tokens.lock() {
            tokens.insert(process.job_id, token.clone());
        }

        let waiter = ChildWaiter {
            job_id: process.job_id,
            pid: process.pid,
            child: process.child,
            stop: token,
            grace_period: self.grace_period,
            exit_tx: self.exit_tx.clone(),
            stop_tokens: self.stop_tokens.clone(),
        };
        tokio::spawn(waiter.run());
    }

    /// Kill and reap a child that never made it to `supervise`.
    pub async fn abort(&self, mut process: SpawnedProcess) {
        if let Err(e) = process.child.start_kill() {
            tracing::warn!(job_id = %process.job_id, error = %e, "Failed to kill aborted process");
        }
        if let Err(e) = process.child.wait().await {
            tracing::warn!(job_id = %process.job_id, error = %e, "Failed to reap aborted process");
        }
    }

    /// Begin SIGTERM-then-SIGKILL escalation for a supervised job.
    ///
    /// Returns false if no live child is supervised under `job_id`. Repeated
    /// calls do not restart the escalation.
    pub fn request_stop(&self, job_id: &Uuid) -> bool {
        let tokens = match self.stop_tokens.lock() {
            Ok(tokens) => tokens,
            Err(poisoned) => poisoned.into_inner(),
        };
        match tokens.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of children currently being waited on.
    pub fn supervised(&self) -> usize {
        self.stop_tokens.lock().map(|t| t.len()).unwrap_or(0)
    }
}

struct ChildWaiter {
    job_id: Uuid,
    pid: u32,
    child: Child,
    stop: CancellationToken,
    grace_period: Duration,
    exit_tx: mpsc::UnboundedSender<ExitEvent>,
    stop_tokens: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl ChildWaiter {
    async fn run(mut self) {
        let mut stop_requested = false;
        let mut kill_at: Option<Instant> = None;

        let status = loop {
            let deadline = kill_at.unwrap_or_else(|| Instant::now() + self.grace_period);
            tokio::select! {
                status = self.child.wait() => break status,
                _ = self.stop.cancelled(), if !stop_requested => {
                    stop_requested = true;
                    tracing::info!(job_id = %self.job_id, pid = self.pid, "Sending SIGTERM");
                    self.signal(Signal::SIGTERM);
                    kill_at = Some(Instant::now() + self.grace_period);
                }
                _ = tokio::time::sleep_until(deadline), if kill_at.is_some() => {
                    tracing::warn!(
                        job_id = %self.job_id,
                        pid = self.pid,
                        grace_ms = self.grace_period.as_millis() as u64,
                        "Grace period expired, sending SIGKILL"
                    );
                    self.signal(Signal::SIGKILL);
                    let _ = self.child.start_kill();
                    kill_at = None;
                }
            }
        };

        let outcome = match status {
            Ok(status) => ExitOutcome::from(status),
            Err(e) => {
                tracing::error!(job_id = %self.job_id, error = %e, "Failed to wait on child");
                ExitOutcome::unknown()
            }
        };

        if let Ok(mut tokens) = self.stop_tokens.lock() {
            tokens.remove(&self.job_id);
        }

        self.kill_remaining().await;

        let event = ExitEvent {
            job_id: self.job_id,
            pid: self.pid,
            outcome,
            stop_requested,
            exited_at: Utc::now(),
        };
        if self.exit_tx.send(event).is_err() {
            tracing::warn!(job_id = %self.job_id, "Reaper gone, exit not recorded");
        }
    }

    /// SIGKILL whatever is left of the job's process group after the shell
    /// exited, and give the kernel a moment to tear it down.
    async fn kill_remaining(&self) {
        let pgid = Pid::from_raw(self.pid as i32);
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) => tracing::debug!(job_id = %self.job_id, "Killed leftover group members"),
            Err(Errno::ESRCH) => return,
            Err(e) => {
                tracing::warn!(job_id = %self.job_id, error = %e, "Failed to kill leftover group");
                return;
            }
        }

        let deadline = Instant::now() + GROUP_DRAIN_TIMEOUT;
        while killpg(pgid, None).is_ok() && Instant::now() < deadline {
            tokio::time::sleep(GROUP_DRAIN_POLL).await;
        }
    }

    /// Signal the whole process group, falling back to the leader alone.
    fn signal(&self, signal: Signal) {
        let pid = Pid::from_raw(self.pid as i32);
        match killpg(pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => {
                tracing::warn!(job_id = %self.job_id, error = %e, ?signal, "killpg failed");
                if let Err(e) = kill(pid, signal) {
                    tracing::warn!(job_id = %self.job_id, error = %e, ?signal, "kill failed");
                }
            }
        }
    }
}
