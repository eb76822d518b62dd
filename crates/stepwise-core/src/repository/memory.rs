//! In-process run repository backed by a concurrent map.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use stepwise_types::error::RepositoryError;
use stepwise_types::run::{RunStatus, RunUpdate, WorkflowRun};
use stepwise_types::step::StepRecord;
use uuid::Uuid;

use super::{CancelOutcome, RunRepository};

#[derive(Debug)]
struct StoredRun {
    run: WorkflowRun,
    lease: Option<Uuid>,
}

/// Keeps runs in memory. Nothing survives the process, which makes it a
/// good stand-in for a store when simulating restarts inside one test.
///
/// Each operation holds the run's map shard for its whole read-check-write,
/// so compare-and-set transitions are atomic.
#[derive(Debug, Default)]
pub struct InMemoryRunRepository {
    runs: DashMap<Uuid, StoredRun>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

impl RunRepository for InMemoryRunRepository {
    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        match self.runs.entry(run.id) {
            Entry::Occupied(_) => {
                Err(RepositoryError::Conflict(format!("run {} already exists", run.id)))
            }
            Entry::Vacant(slot) => {
                slot.insert(StoredRun {
                    run: run.clone(),
                    lease: None,
                });
                Ok(())
            }
        }
    }

    async fn load_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        Ok(self.runs.get(run_id).map(|stored| {
            let mut run = stored.run.clone();
            run.steps.sort_by_key(|s| s.sequence);
            run
        }))
    }

    async fn save_record(&self, run_id: &Uuid, record: &StepRecord) -> Result<(), RepositoryError> {
        let mut stored = self.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        let run = &mut stored.run;
        match run.steps.iter_mut().find(|s| s.name == record.name) {
            Some(existing) if existing.status.is_terminal() => {
                return Err(RepositoryError::Conflict(format!(
                    "step '{}' already {}",
                    record.name, existing.status
                )));
            }
            Some(existing) => *existing = record.clone(),
            None => run.steps.push(record.clone()),
        }
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn acquire_run(
        &self,
        run_id: &Uuid,
        lease: &Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut stored = self.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        let acquirable = match stored.run.status {
            RunStatus::Pending | RunStatus::Suspended => true,
            RunStatus::Running => stored.run.updated_at < stale_before,
            _ => false,
        };
        if !acquirable {
            return Err(RepositoryError::Conflict(format!(
                "run {run_id} is {}",
                stored.run.status
            )));
        }
        stored.run.apply(&RunUpdate::running(), now);
        stored.lease = Some(*lease);
        Ok(())
    }

    async fn settle_run(
        &self,
        run_id: &Uuid,
        lease: &Uuid,
        update: &RunUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut stored = self.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        if stored.run.status != RunStatus::Running || stored.lease != Some(*lease) {
            return Err(RepositoryError::Conflict(format!(
                "run {run_id} is no longer held by lease {lease}"
            )));
        }
        stored.run.apply(update, now);
        stored.lease = None;
        Ok(())
    }

    async fn request_cancel(
        &self,
        run_id: &Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, RepositoryError> {
        let mut stored = self.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        match stored.run.status {
            RunStatus::Pending | RunStatus::Suspended => {
                stored.run.apply(&RunUpdate::cancelled(reason), now);
                Ok(CancelOutcome::Cancelled)
            }
            RunStatus::Running => {
                stored.run.cancel_requested = true;
                Ok(CancelOutcome::Requested)
            }
            settled => Ok(CancelOutcome::AlreadySettled(settled)),
        }
    }

    async fn cancel_requested(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        self.runs
            .get(run_id)
            .map(|stored| stored.run.cancel_requested)
            .ok_or(RepositoryError::NotFound)
    }

    async fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let mut runs: Vec<WorkflowRun> = self
            .runs
            .iter()
            .filter(|r| status.is_none_or(|s| r.run.status == s))
            .map(|r| {
                let mut run = r.run.clone();
                run.steps.clear();
                run
            })
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn list_due_runs(
        &self,
        workflow: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Uuid>, RepositoryError> {
        let mut due: Vec<(DateTime<Utc>, Uuid)> = self
            .runs
            .iter()
            .filter(|r| r.run.workflow == workflow)
            .filter_map(|r| {
                let run = &r.run;
                match run.status {
                    RunStatus::Suspended => {
                        run.resume_at.filter(|at| *at <= now).map(|at| (at, run.id))
                    }
                    RunStatus::Pending | RunStatus::Running if run.updated_at < stale_before => {
                        Some((run.updated_at, run.id))
                    }
                    _ => None,
                }
            })
            .collect();
        due.sort();
        Ok(due.into_iter().take(limit as usize).map(|(_, id)| id).collect())
    }
}
