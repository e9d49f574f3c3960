use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cgroup::ResourceLimiter;
use crate::jobs::{JobRegistry, Transition};
use crate::output::OutputStore;
use crate::worker::supervisor::ExitEvent;

/// Long-lived task that turns child exits into terminal job records and
/// releases the job's cgroup.
#[derive(Debug)]
pub struct Reaper {
    registry: Arc<JobRegistry>,
    limiter: Arc<dyn ResourceLimiter>,
    output: OutputStore,
    output_retention: Option<Duration>,
}

impl Reaper {
    pub fn new(
        registry: Arc<JobRegistry>,
        limiter: Arc<dyn ResourceLimiter>,
        output: OutputStore,
        output_retention: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            limiter,
            output,
            output_retention,
        }
    }

    /// Run until every exit sender is gone.
    pub fn spawn(self, mut exit_rx: mpsc::UnboundedReceiver<ExitEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = exit_rx.recv().await {
                self.reap(event).await;
            }
            tracing::debug!("Reaper stopped");
        })
    }

    async fn reap(&self, event: ExitEvent) {
        let job_id = event.job_id;

        // Nothing in the group may write output once the job is terminal.
        let limiter = self.limiter.clone();
        let oom_killed = match tokio::task::spawn_blocking(move || {
            let killed = limiter.kill_members(&job_id);
            (killed, limiter.oom_killed(&job_id))
        })
        .await
        {
            Ok((killed, oom_killed)) => {
                if let Err(e) = killed {
                    tracing::warn!(job_id = %job_id, error = %e, "Failed to kill cgroup members");
                }
                oom_killed
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Cgroup kill task failed");
                false
            }
        };

        match self
            .registry
            .apply(
                &job_id,
                Transition::Exited {
                    outcome: event.outcome,
                    oom_killed,
                    stopped_at: event.exited_at,
                },
            )
            .await
        {
            Ok(job) => tracing::info!(
                job_id = %job_id,
                pid = event.pid,
                status = %job.status,
                exit_code = job.exit_code,
                signal = ?job.term_signal,
                stop_requested = event.stop_requested,
                "Job exited"
            ),
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Exit not recorded"),
        }

        let limiter = self.limiter.clone();
        match tokio::task::spawn_blocking(move || limiter.destroy_group(&job_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(job_id = %job_id, error = %e, "Failed to delete cgroup"),
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Cgroup cleanup task failed"),
        }

        if let Some(retention) = self.output_retention {
            self.output.schedule_removal(job_id, retention);
        }
    }
}
