use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorCode;

/// Exit code reported while a job has not exited, or when it was killed by a signal.
pub const EXIT_CODE_UNSET: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Stopped,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Stopped | JobStatus::Error)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Stopped => write!(f, "stopped"),
            JobStatus::Error => write!(f, "error"),
        }
    }
}

/// Why a job ended up in `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// How a reaped process ended: a normal exit code or a terminating signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// The child was lost without a wait status; always recorded as `Error`.
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    /// Map the outcome onto a terminal status.
    ///
    /// A process that called exit is `Stopped` whatever its code. A signal
    /// death is `Stopped` only when a stop was requested; otherwise the kernel
    /// or someone else killed it and the job is `Error`. An OOM kill anywhere
    /// in the job's group is `Error` even when the shell itself exited.
    pub fn classify(
        &self,
        stop_requested: bool,
        oom_killed: bool,
    ) -> (JobStatus, Option<ErrorDetail>) {
        match (self.code, self.signal) {
            (None, None) => (
                JobStatus::Error,
                Some(ErrorDetail::new(
                    ErrorCode::AbnormalTermination,
                    "exit status unavailable",
                )),
            ),
            _ if stop_requested => (JobStatus::Stopped, None),
            (_, signal) if oom_killed => (
                JobStatus::Error,
                Some(ErrorDetail::new(
                    ErrorCode::MemoryLimitExceeded,
                    match signal {
                        Some(sig) => format!(
                            "killed by {} after exceeding the memory limit",
                            signal_name(sig)
                        ),
                        None => "a process was killed after exceeding the memory limit"
                            .to_string(),
                    },
                )),
            ),
            (_, Some(sig)) => (
                JobStatus::Error,
                Some(ErrorDetail::new(
                    ErrorCode::AbnormalTermination,
                    format!("terminated by {}", signal_name(sig)),
                )),
            ),
            (Some(_), None) => (JobStatus::Stopped, None),
        }
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

fn signal_name(sig: i32) -> String {
    match nix::sys::signal::Signal::try_from(sig) {
        Ok(signal) => signal.as_str().to_string(),
        Err(_) => format!("signal {}", sig),
    }
}

/// A job record. Values handed out by the registry are snapshots; re-read
/// the registry to observe later changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub command: String,
    pub status: JobStatus,
    /// Only set while the job is running; the OS may reuse it afterwards.
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
    pub exit_code: i32,
    pub term_signal: Option<i32>,
    pub error: Option<ErrorDetail>,
    pub stop_requested: bool,
    #[serde(skip)]
    pub(crate) cgroup_path: Option<PathBuf>,
    #[serde(skip)]
    pub(crate) output_path: Option<PathBuf>,
}

impl Job {
    pub fn new(command: String) -> Self {
        Self::with_id(Uuid::new_v4(), command)
    }

    pub fn with_id(id: Uuid, command: String) -> Self {
        Self {
            id,
            command,
            status: JobStatus::Pending,
            pid: None,
            created_at: Utc::now(),
            start_time: None,
            stop_time: None,
            exit_code: EXIT_CODE_UNSET,
            term_signal: None,
            error: None,
            stop_requested: false,
            cgroup_path: None,
            output_path: None,
        }
    }
}
