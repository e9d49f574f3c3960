use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

use crate::jobs::job::{ErrorDetail, ExitOutcome, Job, JobStatus, EXIT_CODE_UNSET};

/// A single state change applied atomically to one job record.
#[derive(Debug, Clone)]
pub enum Transition {
    /// Pending -> Running, once the process exists inside its cgroup.
    Running {
        pid: u32,
        started_at: DateTime<Utc>,
        cgroup_path: PathBuf,
        output_path: PathBuf,
    },
    /// Marks a running job as being stopped. Status is unchanged; the reaper
    /// performs the terminal transition.
    StopRequested,
    /// Running -> Stopped/Error, applied by the reaper.
    Exited {
        outcome: ExitOutcome,
        oom_killed: bool,
        stopped_at: DateTime<Utc>,
    },
    /// Pending -> Error, when the job could not be started.
    Failed {
        detail: ErrorDetail,
        failed_at: DateTime<Utc>,
    },
}

impl Transition {
    fn name(&self) -> &'static str {
        match self {
            Transition::Running { .. } => "running",
            Transition::StopRequested => "stop_requested",
            Transition::Exited { .. } => "exited",
            Transition::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("job {0} is not registered")]
    NotFound(Uuid),

    #[error("job {id} cannot go {transition} from {from}")]
    Rejected {
        id: Uuid,
        from: JobStatus,
        transition: &'static str,
    },
}

#[derive(Debug)]
struct Entry {
    job: Job,
    status_tx: watch::Sender<JobStatus>,
}

/// In-memory source of truth for every job this service has seen.
///
/// The lock is only held for map lookups and field updates; spawning,
/// filesystem work and waiting happen outside it.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<Uuid, Entry>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new `Pending` job and return its id.
    pub async fn create(&self, command: String) -> Uuid {
        let mut jobs = self.jobs.write().await;
        let mut job = Job::new(command);
        while jobs.contains_key(&job.id) {
            job.id = Uuid::new_v4();
        }
        let id = job.id;
        let (status_tx, _) = watch::channel(job.status);
        jobs.insert(id, Entry { job, status_tx });
        id
    }

    /// Snapshot of a job.
    pub async fn get(&self, id: &Uuid) -> Option<Job> {
        self.jobs.read().await.get(id).map(|e| e.job.clone())
    }

    /// Receiver that observes every status change of a job.
    pub async fn subscribe(&self, id: &Uuid) -> Option<watch::Receiver<JobStatus>> {
        self.jobs.read().await.get(id).map(|e| e.status_tx.subscribe())
    }

    /// Snapshots of all jobs, oldest first.
    pub async fn list(&self) -> Vec<Job> {
        let jobs = self.jobs.read().await;
        let mut all: Vec<Job> = jobs.values().map(|e| e.job.clone()).collect();
        all.sort_by_key(|j| j.created_at);
        all
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Apply a transition if the job's current state allows it and return the
    /// updated snapshot. Status only ever moves forward.
    pub async fn apply(&self, id: &Uuid, transition: Transition) -> Result<Job, TransitionError> {
        let mut jobs = self.jobs.write().await;
        let Some(entry) = jobs.get_mut(id) else {
            tracing::warn!(job_id = %id, transition = transition.name(), "Update for unknown job ignored");
            return Err(TransitionError::NotFound(*id));
        };

        let job = &mut entry.job;
        let from = job.status;
        let name = transition.name();
        match (from, transition) {
            (
                JobStatus::Pending,
                Transition::Running {
                    pid,
                    started_at,
                    cgroup_path,
                    output_path,
                },
            ) => {
                job.status = JobStatus::Running;
                job.pid = Some(pid);
                job.start_time = Some(started_at);
                job.cgroup_path = Some(cgroup_path);
                job.output_path = Some(output_path);
            }
            (JobStatus::Running, Transition::StopRequested) => {
                job.stop_requested = true;
            }
            (
                JobStatus::Running,
                Transition::Exited {
                    outcome,
                    oom_killed,
                    stopped_at,
                },
            ) => {
                let (status, error) = outcome.classify(job.stop_requested, oom_killed);
                job.status = status;
                job.error = error;
                job.exit_code = outcome.code.unwrap_or(EXIT_CODE_UNSET);
                job.term_signal = outcome.signal;
                job.stop_time = Some(stopped_at);
                job.pid = None;
            }
            (JobStatus::Pending, Transition::Failed { detail, failed_at }) => {
                job.status = JobStatus::Error;
                job.error = Some(detail);
                job.stop_time = Some(failed_at);
            }
            (from, _) => {
                tracing::warn!(job_id = %id, from = %from, transition = name, "Transition rejected");
                return Err(TransitionError::Rejected {
                    id: *id,
                    from,
                    transition: name,
                });
            }
        }

        if job.status != from {
            tracing::debug!(job_id = %id, from = %from, to = %job.status, "Job status changed");
            entry.status_tx.send_replace(job.status);
        }
        Ok(job.clone())
    }
}
