//! Run repository trait definition (port).
//!
//! Defines the storage interface for workflow runs and their ledgers. The
//! infrastructure layer (stepwise-infra) implements this trait with SQLite
//! persistence; [`memory::InMemoryRunRepository`] serves tests and
//! ephemeral runs.

pub mod memory;

use chrono::{DateTime, Utc};
use stepwise_types::error::RepositoryError;
use stepwise_types::run::{RunStatus, RunUpdate, WorkflowRun};
use stepwise_types::step::StepRecord;
use uuid::Uuid;

/// What a cancel did to a stored run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The run was pending or suspended and is now cancelled.
    Cancelled,
    /// The run is executing; its pass will settle it at the next step
    /// boundary.
    Requested,
    /// The run had already settled and was left unchanged.
    AlreadySettled(RunStatus),
}

/// Repository trait for run persistence.
///
/// The orchestrator requires two things of an implementation: `save_record`
/// is durable once its future resolves, and `load_run` returns the most
/// recently saved state.
///
/// Run status changes are compare-and-set. A pass owns a run between
/// `acquire_run` and `settle_run` through its lease; settled runs and
/// settled ledger records are never overwritten.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RunRepository: Send + Sync {
    /// Create a new run record (with whatever ledger entries it carries).
    fn create_run(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Load a run with its full ledger, ordered by sequence.
    fn load_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// Insert or replace a ledger record, keyed by (run, step name).
    ///
    /// Fails with `Conflict` if the stored record has already succeeded or
    /// failed.
    fn save_record(
        &self,
        run_id: &Uuid,
        record: &StepRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Move a pending or suspended run to running under `lease`.
    ///
    /// A running run whose `updated_at` is before `stale_before` is taken
    /// over as well. Any other state fails with `Conflict`.
    fn acquire_run(
        &self,
        run_id: &Uuid,
        lease: &Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Write the outcome of a pass. Fails with `Conflict` unless the run is
    /// still running under `lease`.
    fn settle_run(
        &self,
        run_id: &Uuid,
        lease: &Uuid,
        update: &RunUpdate,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Cancel a pending or suspended run, or flag a running one.
    fn request_cancel(
        &self,
        run_id: &Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<CancelOutcome, RepositoryError>> + Send;

    /// Whether a cancel was requested while the run was executing.
    fn cancel_requested(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// List runs, newest first, optionally filtered by status. Ledgers are
    /// not loaded.
    fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// IDs of runs of `workflow` a worker should resume, earliest first:
    /// suspended runs whose resume time is at or before `now`, and pending
    /// or running runs not updated since `stale_before`.
    fn list_due_runs(
        &self,
        workflow: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Uuid>, RepositoryError>> + Send;
}
