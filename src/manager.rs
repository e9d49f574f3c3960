use std::io::ErrorKind;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::cgroup::{CgroupController, CgroupError, ResourceLimiter};
use crate::config::{AttachMode, WorkerConfig};
use crate::error::{ErrorCode, Result, WorkerError};
use crate::jobs::{ErrorDetail, Job, JobRegistry, JobStatus, Transition, TransitionError};
use crate::output::{empty_stream, OutputStore, OutputStream};
use crate::worker::{ProcessSupervisor, Reaper, SpawnRequest};

/// The four job operations exposed to the API layer, plus a few helpers.
///
/// Owns the registry and the supervisor, and starts the reaper task. Must be
/// created inside a Tokio runtime.
#[derive(Debug)]
pub struct JobManager {
    config: WorkerConfig,
    registry: Arc<JobRegistry>,
    limiter: Arc<dyn ResourceLimiter>,
    output: OutputStore,
    supervisor: ProcessSupervisor,
}

impl JobManager {
    /// Set up the cgroup root and output directory on this host and build a
    /// manager over them. Failure here should abort service startup.
    pub fn init(config: WorkerConfig) -> Result<Self> {
        let controller = CgroupController::init(&config)?;
        let output = OutputStore::init(config.output_dir.clone())?;
        Ok(Self::new(config, Arc::new(controller), output))
    }

    pub fn new(
        config: WorkerConfig,
        limiter: Arc<dyn ResourceLimiter>,
        output: OutputStore,
    ) -> Self {
        let registry = Arc::new(JobRegistry::new());
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::new(config.stop_grace_period, exit_tx);
        // Runs until the supervisor and every child waiter are gone.
        Reaper::new(
            registry.clone(),
            limiter.clone(),
            output.clone(),
            config.output_retention,
        )
        .spawn(exit_rx);

        Self {
            config,
            registry,
            limiter,
            output,
            supervisor,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Start `command` under the job's cgroup and return its id.
    ///
    /// Once an id exists the record is kept: start failures leave an
    /// `Error` job behind and the returned error carries its id.
    pub async fn start_job(&self, command: &str) -> Result<Uuid> {
        validate_command(command)?;

        let job_id = self.registry.create(command.to_string()).await;
        tracing::info!(job_id = %job_id, command, "Starting job");

        let limiter = self.limiter.clone();
        let cgroup_path = match run_blocking(move || {
            let path = limiter.create_group(&job_id)?;
            limiter.apply_limits(&job_id)?;
            Ok::<_, CgroupError>(path)
        })
        .await
        {
            Ok(path) => path,
            Err(reason) => {
                return Err(self
                    .fail_start(job_id, ErrorCode::CgroupSetupFailed, reason)
                    .await)
            }
        };

        let output = self.output.clone();
        let output_file = match run_blocking(move || output.create_output(&job_id)).await {
            Ok(file) => file,
            Err(reason) => {
                return Err(self
                    .fail_start(job_id, ErrorCode::OutputCreateFailed, reason)
                    .await)
            }
        };

        let attachment = match self.config.attach_mode {
            AttachMode::AtSpawn => {
                let limiter = self.limiter.clone();
                match run_blocking(move || limiter.spawn_attachment(&job_id)).await {
                    Ok(attachment) => attachment,
                    Err(reason) => {
                        return Err(self
                            .fail_start(job_id, ErrorCode::CgroupAttachFailed, reason)
                            .await)
                    }
                }
            }
            AttachMode::AfterSpawn => None,
        };

        let process = match self.supervisor.spawn(SpawnRequest {
            job_id,
            command,
            output: output_file,
            attachment,
            run_as: self.config.run_as,
        }) {
            Ok(process) => process,
            Err(e) => {
                return Err(self
                    .fail_start(job_id, ErrorCode::ProcessSpawnFailed, e.to_string())
                    .await)
            }
        };

        if self.config.attach_mode == AttachMode::AfterSpawn {
            let limiter = self.limiter.clone();
            let pid = process.pid;
            if let Err(reason) = run_blocking(move || limiter.attach(&job_id, pid)).await {
                // Never leave an unconstrained process running.
                self.supervisor.abort(process).await;
                return Err(self
                    .fail_start(job_id, ErrorCode::CgroupAttachFailed, reason)
                    .await);
            }
        }

        let pid = process.pid;
        if let Err(e) = self
            .registry
            .apply(
                &job_id,
                Transition::Running {
                    pid,
                    started_at: process.started_at,
                    cgroup_path,
                    output_path: self.output.output_path(&job_id),
                },
            )
            .await
        {
            tracing::error!(job_id = %job_id, error = %e, "Failed to mark job running");
        }
        // Supervise only after Running is recorded so the exit can never be
        // applied to a Pending record.
        self.supervisor.supervise(process);

        tracing::info!(job_id = %job_id, pid, "Job running");
        Ok(job_id)
    }

    /// Snapshot of a job's record.
    pub async fn get_job_status(&self, job_id: &Uuid) -> Result<Job> {
        self.registry
            .get(job_id)
            .await
            .ok_or(WorkerError::JobNotFound(*job_id))
    }

    /// Stream the job's combined output from offset 0. The stream follows a
    /// running job and ends after the final drain once the job is terminal.
    pub async fn stream_job_output(&self, job_id: &Uuid) -> Result<OutputStream> {
        let mut status = self
            .registry
            .subscribe(job_id)
            .await
            .ok_or(WorkerError::JobNotFound(*job_id))?;

        loop {
            match self.output.open_reader(job_id, status.clone()).await {
                Ok(cursor) => return Ok(cursor.into_stream(*job_id, self.config.poll_interval)),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    let current = *status.borrow_and_update();
                    match current {
                        // Never ran, or output already expired
                        JobStatus::Stopped | JobStatus::Error => return Ok(empty_stream()),
                        JobStatus::Running => return Err(e.into()),
                        JobStatus::Pending => {
                            if status.changed().await.is_err() {
                                return Ok(empty_stream());
                            }
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Ask a running job to stop and return its status at the time of the
    /// call. Termination completes in the background; stopping a finished
    /// job is a no-op that returns its terminal status.
    pub async fn stop_job(&self, job_id: &Uuid) -> Result<JobStatus> {
        match self.request_stop(job_id).await {
            Ok(status) => Ok(status),
            Err(WorkerError::AlreadyTerminal(_)) => {
                let job = self.get_job_status(job_id).await?;
                tracing::debug!(job_id = %job_id, status = %job.status, "Stop on finished job");
                Ok(job.status)
            }
            Err(e) => Err(e),
        }
    }

    async fn request_stop(&self, job_id: &Uuid) -> Result<JobStatus> {
        let job = self.get_job_status(job_id).await?;
        match job.status {
            JobStatus::Stopped | JobStatus::Error => Err(WorkerError::AlreadyTerminal(*job_id)),
            // Still starting; there is no process to signal yet.
            JobStatus::Pending => Ok(JobStatus::Pending),
            JobStatus::Running => {
                match self.registry.apply(job_id, Transition::StopRequested).await {
                    Ok(_) => {}
                    Err(TransitionError::Rejected { from, .. }) if from.is_terminal() => {
                        return Err(WorkerError::AlreadyTerminal(*job_id));
                    }
                    Err(TransitionError::NotFound(id)) => return Err(WorkerError::JobNotFound(id)),
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "Stop not recorded");
                    }
                }
                if !job.stop_requested {
                    tracing::info!(job_id = %job_id, "Stop requested");
                }
                self.supervisor.request_stop(job_id);
                Ok(JobStatus::Running)
            }
        }
    }

    /// All jobs, oldest first.
    pub async fn list_jobs(&self) -> Vec<Job> {
        self.registry.list().await
    }

    /// Resolve once the job is terminal.
    pub async fn wait_for_exit(&self, job_id: &Uuid) -> Result<Job> {
        let mut status = self
            .registry
            .subscribe(job_id)
            .await
            .ok_or(WorkerError::JobNotFound(*job_id))?;
        let _ = status.wait_for(|s| s.is_terminal()).await;
        self.get_job_status(job_id).await
    }

    /// Stop every running job and wait until each has been reaped.
    pub async fn shutdown(&self) {
        let running: Vec<Uuid> = self
            .registry
            .list()
            .await
            .into_iter()
            .filter(|j| j.status == JobStatus::Running)
            .map(|j| j.id)
            .collect();

        tracing::info!(running = running.len(), "Stopping running jobs");
        for job_id in &running {
            if let Err(e) = self.stop_job(job_id).await {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to stop job");
            }
        }
        for job_id in &running {
            let _ = self.wait_for_exit(job_id).await;
        }
    }

    /// Record a start failure, clean up half-created artifacts, and build
    /// the error returned to the caller.
    async fn fail_start(&self, job_id: Uuid, code: ErrorCode, reason: String) -> WorkerError {
        tracing::error!(job_id = %job_id, code = %code, reason = %reason, "Job failed to start");

        let detail = ErrorDetail::new(code, reason.clone());
        if let Err(e) = self
            .registry
            .apply(
                &job_id,
                Transition::Failed {
                    detail,
                    failed_at: Utc::now(),
                },
            )
            .await
        {
            tracing::warn!(job_id = %job_id, error = %e, "Start failure not recorded");
        }

        let limiter = self.limiter.clone();
        if let Err(e) = run_blocking(move || limiter.destroy_group(&job_id)).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to delete cgroup");
        }
        if let Err(e) = self.output.remove_output(&job_id).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to remove output file");
        }

        match code {
            ErrorCode::CgroupSetupFailed => WorkerError::CgroupSetupFailed { job_id, reason },
            ErrorCode::CgroupAttachFailed => WorkerError::CgroupAttachFailed { job_id, reason },
            ErrorCode::OutputCreateFailed => WorkerError::OutputCreateFailed { job_id, reason },
            _ => WorkerError::ProcessSpawnFailed { job_id, reason },
        }
    }
}

/// Run filesystem work for a job off the async workers. Errors are only
/// ever reported as text on the job record.
async fn run_blocking<T, E, F>(f: F) -> std::result::Result<T, String>
where
    F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display,
{
    match tokio::task::spawn_blocking(move || f().map_err(|e| e.to_string())).await {
        Ok(result) => result,
        Err(e) => Err(format!("blocking task failed: {}", e)),
    }
}

fn validate_command(command: &str) -> Result<()> {
    if command.trim().is_empty() {
        return Err(WorkerError::InvalidCommand("command cannot be empty".to_string()));
    }
    if command.contains('\0') {
        return Err(WorkerError::InvalidCommand(
            "command cannot contain NUL bytes".to_string(),
        ));
    }
    Ok(())
}
