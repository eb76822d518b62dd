//! Step ledger: the replay record of one workflow run.
//!
//! Every mutation is written through to the [`RunRepository`] before the
//! in-memory copy changes, so an attempt is durably marked in progress
//! before its body runs and a result is durable before the workflow body
//! observes it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use stepwise_types::error::RepositoryError;
use stepwise_types::step::{StepKind, StepRecord, StepStatus};
use uuid::Uuid;

use crate::repository::RunRepository;

/// Errors raised by ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The same name was claimed twice in one pass over the workflow body.
    #[error("step '{0}' declared more than once")]
    DuplicateStep(String),

    /// The name exists in the ledger with a different kind or policy.
    #[error("step '{name}' recorded as '{recorded}' but declared as '{declared}'")]
    AmbiguousStepName {
        name: String,
        recorded: String,
        declared: String,
    },

    /// The record is already settled and cannot be mutated.
    #[error("step '{name}' is already {status}")]
    AlreadySettled { name: String, status: StepStatus },

    /// A mutation addressed a name that was never claimed.
    #[error("step '{0}' is not in the ledger")]
    UnknownStep(String),

    #[error("failed to persist step record: {0}")]
    Repository(#[from] RepositoryError),
}

/// Keyed, append-only record of step outcomes for one run.
pub struct StepLedger<R: RunRepository> {
    repo: Arc<R>,
    run_id: Uuid,
    records: Vec<StepRecord>,
    index: HashMap<String, usize>,
    /// Names claimed during the current pass over the workflow body.
    claimed: HashSet<String>,
}

impl<R: RunRepository> StepLedger<R> {
    /// Rebuild a ledger from the records loaded with a run.
    pub fn new(repo: Arc<R>, run_id: Uuid, mut records: Vec<StepRecord>) -> Self {
        records.sort_by_key(|r| r.sequence);
        let index = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.name.clone(), i))
            .collect();
        Self {
            repo,
            run_id,
            records,
            index,
            claimed: HashSet::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// All records in issue order.
    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    /// Replay hook. Never triggers execution.
    pub fn lookup(&self, name: &str) -> Option<&StepRecord> {
        self.index.get(name).map(|&i| &self.records[i])
    }

    /// Declare that the workflow body is addressing `name` as `kind` with
    /// the given fingerprint.
    ///
    /// Creates a `NotStarted` record (in memory only) the first time a name
    /// is seen. Fails if the name was already claimed in this pass, or if
    /// the ledger remembers it with a different kind or fingerprint.
    pub fn claim(
        &mut self,
        name: &str,
        kind: StepKind,
        fingerprint: &str,
    ) -> Result<&StepRecord, LedgerError> {
        if !self.claimed.insert(name.to_string()) {
            return Err(LedgerError::DuplicateStep(name.to_string()));
        }

        let declared = format!("{kind}: {fingerprint}");
        let idx = match self.index.get(name).copied() {
            Some(idx) => {
                let existing = &self.records[idx];
                if existing.kind != kind || existing.fingerprint != fingerprint {
                    return Err(LedgerError::AmbiguousStepName {
                        name: name.to_string(),
                        recorded: format!("{}: {}", existing.kind, existing.fingerprint),
                        declared,
                    });
                }
                idx
            }
            None => {
                let sequence = self.records.len() as u32;
                self.records
                    .push(StepRecord::new(name, kind, sequence, fingerprint.to_string()));
                self.index.insert(name.to_string(), self.records.len() - 1);
                self.records.len() - 1
            }
        };
        Ok(&self.records[idx])
    }

    /// Start a new attempt and return its 1-based number.
    pub async fn begin_attempt(
        &mut self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<u32, LedgerError> {
        let attempt = self
            .mutate(name, |r| {
                r.status = StepStatus::InProgress;
                r.attempts += 1;
                r.last_attempt_at = Some(now);
                r.deadline = None;
            })
            .await?
            .attempts;
        tracing::debug!(
            run_id = %self.run_id,
            step = name,
            attempt,
            "checkpointed attempt start"
        );
        Ok(attempt)
    }

    /// Settle the step as succeeded with `value`.
    ///
    /// Fails with [`LedgerError::DuplicateStep`] if the step already
    /// succeeded: the stored value is never overwritten.
    pub async fn record_success(&mut self, name: &str, value: Value) -> Result<(), LedgerError> {
        if self.lookup(name).is_some_and(StepRecord::is_succeeded) {
            return Err(LedgerError::DuplicateStep(name.to_string()));
        }
        self.mutate(name, |r| {
            r.status = StepStatus::Succeeded;
            r.output = Some(value);
            r.error = None;
            r.deadline = None;
        })
        .await?;
        tracing::debug!(run_id = %self.run_id, step = name, "checkpointed step success");
        Ok(())
    }

    /// Record a failed attempt. A terminal failure settles the step; a
    /// non-terminal one only remembers the error.
    pub async fn record_failure(
        &mut self,
        name: &str,
        error: &str,
        terminal: bool,
    ) -> Result<(), LedgerError> {
        self.mutate(name, |r| {
            if terminal {
                r.status = StepStatus::Failed;
                r.deadline = None;
            }
            r.error = Some(error.to_string());
        })
        .await?;
        tracing::debug!(
            run_id = %self.run_id,
            step = name,
            terminal,
            error,
            "checkpointed step failure"
        );
        Ok(())
    }

    /// Record that the step may not progress before `deadline`: the end of
    /// a sleep, or the earliest next attempt after a retry delay.
    pub async fn schedule(
        &mut self,
        name: &str,
        deadline: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<(), LedgerError> {
        self.mutate(name, |r| {
            r.status = StepStatus::InProgress;
            r.deadline = Some(deadline);
            if let Some(error) = error {
                r.error = Some(error.to_string());
            }
        })
        .await?;
        tracing::debug!(
            run_id = %self.run_id,
            step = name,
            deadline = %deadline,
            "checkpointed step deadline"
        );
        Ok(())
    }

    /// Whether a cancel was recorded for this run while it was executing.
    pub async fn cancel_requested(&self) -> Result<bool, LedgerError> {
        Ok(self.repo.cancel_requested(&self.run_id).await?)
    }

    /// Apply `change` to a copy of the record, persist it, then commit it.
    async fn mutate(
        &mut self,
        name: &str,
        change: impl FnOnce(&mut StepRecord),
    ) -> Result<&StepRecord, LedgerError> {
        let idx = *self
            .index
            .get(name)
            .ok_or_else(|| LedgerError::UnknownStep(name.to_string()))?;

        let current = &self.records[idx];
        if current.status.is_terminal() {
            return Err(LedgerError::AlreadySettled {
                name: name.to_string(),
                status: current.status,
            });
        }

        let mut updated = current.clone();
        change(&mut updated);
        self.repo.save_record(&self.run_id, &updated).await?;
        self.records[idx] = updated;
        Ok(&self.records[idx])
    }
}
