//! Background worker that resumes suspended runs once they are due.
//!
//! Suspended runs hold no compute while they wait: the worker only asks the
//! repository which runs have a `resume_at` in the past and replays those.
//! Runs left pending or running by a dead process are picked up the same
//! way once their lease goes stale.

use std::sync::Arc;
use std::time::Duration;

use stepwise_types::error::RepositoryError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::controller::{RunController, Workflow};
use crate::repository::RunRepository;

pub struct Worker<R: RunRepository, W: Workflow> {
    controller: Arc<RunController<R>>,
    workflow: Arc<W>,
    poll_interval: Duration,
    batch_size: u32,
}

impl<R: RunRepository, W: Workflow> Worker<R, W> {
    pub fn new(
        controller: Arc<RunController<R>>,
        workflow: Arc<W>,
        poll_interval: Duration,
        batch_size: u32,
    ) -> Self {
        Self {
            controller,
            workflow,
            poll_interval,
            batch_size: batch_size.max(1),
        }
    }

    /// Resume every run that is due now. Returns the IDs that were resumed.
    ///
    /// A failure to resume one run is logged and does not stop the batch.
    pub async fn poll_once(&self) -> Result<Vec<Uuid>, RepositoryError> {
        let now = self.controller.clock().now();
        let stale_before = self.controller.stale_before(now);
        let due = self
            .controller
            .repo()
            .list_due_runs(self.workflow.name(), now, stale_before, self.batch_size)
            .await?;

        let mut resumed = Vec::with_capacity(due.len());
        for run_id in due {
            match self.controller.resume(self.workflow.as_ref(), run_id).await {
                Ok(handle) => {
                    tracing::debug!(run_id = %run_id, status = %handle.status, "worker resumed run");
                    resumed.push(run_id);
                }
                Err(e) => {
                    tracing::warn!(run_id = %run_id, error = %e, "worker failed to resume run");
                }
            }
        }
        Ok(resumed)
    }

    /// Poll until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            workflow = self.workflow.name(),
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            batch_size = self.batch_size,
            "worker started"
        );

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::warn!(error = %e, "failed to list due runs");
                    }
                }
            }
        }

        tracing::info!(workflow = self.workflow.name(), "worker stopped");
    }
}
