use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::auth::AuthError;
use crate::cgroup::CgroupError;

/// Stable, machine-readable error codes recorded on `Error`-status jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    CgroupSetupFailed,
    CgroupAttachFailed,
    ProcessSpawnFailed,
    OutputCreateFailed,
    AbnormalTermination,
    MemoryLimitExceeded,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::CgroupSetupFailed => write!(f, "CGROUP_SETUP_FAILED"),
            ErrorCode::CgroupAttachFailed => write!(f, "CGROUP_ATTACH_FAILED"),
            ErrorCode::ProcessSpawnFailed => write!(f, "PROCESS_SPAWN_FAILED"),
            ErrorCode::OutputCreateFailed => write!(f, "OUTPUT_CREATE_FAILED"),
            ErrorCode::AbnormalTermination => write!(f, "ABNORMAL_TERMINATION"),
            ErrorCode::MemoryLimitExceeded => write!(f, "MEMORY_LIMIT_EXCEEDED"),
        }
    }
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Cgroup setup failed for job {job_id}: {reason}")]
    CgroupSetupFailed { job_id: Uuid, reason: String },

    #[error("Cgroup attach failed for job {job_id}: {reason}")]
    CgroupAttachFailed { job_id: Uuid, reason: String },

    #[error("Process spawn failed for job {job_id}: {reason}")]
    ProcessSpawnFailed { job_id: Uuid, reason: String },

    #[error("Output file creation failed for job {job_id}: {reason}")]
    OutputCreateFailed { job_id: Uuid, reason: String },

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job {0} already finished")]
    AlreadyTerminal(Uuid),

    #[error("Cgroup root setup failed: {0}")]
    RootSetup(#[from] CgroupError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    /// Id of the `Error`-status record a failed start left behind, if any.
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            WorkerError::CgroupSetupFailed { job_id, .. }
            | WorkerError::CgroupAttachFailed { job_id, .. }
            | WorkerError::ProcessSpawnFailed { job_id, .. }
            | WorkerError::OutputCreateFailed { job_id, .. } => Some(*job_id),
            WorkerError::JobNotFound(id) | WorkerError::AlreadyTerminal(id) => Some(*id),
            _ => None,
        }
    }

    /// The code recorded on the job for start-time failures.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            WorkerError::CgroupSetupFailed { .. } => Some(ErrorCode::CgroupSetupFailed),
            WorkerError::CgroupAttachFailed { .. } => Some(ErrorCode::CgroupAttachFailed),
            WorkerError::ProcessSpawnFailed { .. } => Some(ErrorCode::ProcessSpawnFailed),
            WorkerError::OutputCreateFailed { .. } => Some(ErrorCode::OutputCreateFailed),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
