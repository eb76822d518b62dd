//! SQLite run repository implementation.
//!
//! Implements `RunRepository` from `stepwise-core` using sqlx with split
//! read/write pools. Each run is a row in `workflow_runs`; its ledger lives
//! in `step_records`, one row per step name. Step outputs and run params are
//! stored as JSON text.
//!
//! Timestamps are written as fixed-width RFC 3339 (nanosecond precision,
//! `Z` suffix) so that `resume_at <= ?` compares correctly as text.
//!
//! Status transitions are single conditional UPDATEs; a statement that
//! matches no row is reported as `Conflict` (or `NotFound` if the run does
//! not exist).

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use stepwise_core::repository::{CancelOutcome, RunRepository};
use stepwise_types::error::RepositoryError;
use stepwise_types::run::{RunStatus, RunUpdate, WorkflowRun};
use stepwise_types::step::{StepKind, StepRecord, StepStatus};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `RunRepository`.
pub struct SqliteRunRepository {
    pool: DatabasePool,
}

impl SqliteRunRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    /// Why a conditional UPDATE matched nothing.
    async fn unchanged(&self, run_id: &Uuid) -> RepositoryError {
        let status: Result<Option<String>, sqlx::Error> =
            sqlx::query_scalar("SELECT status FROM workflow_runs WHERE id = ?")
                .bind(run_id.to_string())
                .fetch_optional(&self.pool.writer)
                .await;
        match status {
            Ok(Some(status)) => RepositoryError::Conflict(format!("run {run_id} is {status}")),
            Ok(None) => RepositoryError::NotFound,
            Err(e) => query_error(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    id: String,
    workflow: String,
    params: String,
    status: String,
    resume_at: Option<String>,
    failed_step: Option<String>,
    error: Option<String>,
    output: Option<String>,
    cancel_requested: bool,
    created_at: String,
    updated_at: String,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow: row.try_get("workflow")?,
            params: row.try_get("params")?,
            status: row.try_get("status")?,
            resume_at: row.try_get("resume_at")?,
            failed_step: row.try_get("failed_step")?,
            error: row.try_get("error")?,
            output: row.try_get("output")?,
            cancel_requested: row.try_get("cancel_requested")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// Convert to a run with an empty ledger.
    fn into_run(self) -> Result<WorkflowRun, RepositoryError> {
        let status: RunStatus = self
            .status
            .parse()
            .map_err(RepositoryError::Query)?;

        let params = serde_json::from_str(&self.params)
            .map_err(|e| RepositoryError::Query(format!("invalid run params JSON: {e}")))?;

        let output = self
            .output
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid run output JSON: {e}")))
            })
            .transpose()?;

        Ok(WorkflowRun {
            id: parse_uuid(&self.id)?,
            workflow: self.workflow,
            params,
            status,
            steps: Vec::new(),
            resume_at: self.resume_at.as_deref().map(parse_datetime).transpose()?,
            failed_step: self.failed_step,
            error: self.error,
            output,
            cancel_requested: self.cancel_requested,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct StepRow {
    name: String,
    kind: String,
    sequence: i64,
    fingerprint: String,
    status: String,
    attempts: i64,
    last_attempt_at: Option<String>,
    output: Option<String>,
    error: Option<String>,
    deadline: Option<String>,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            name: row.try_get("name")?,
            kind: row.try_get("kind")?,
            sequence: row.try_get("sequence")?,
            fingerprint: row.try_get("fingerprint")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            last_attempt_at: row.try_get("last_attempt_at")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            deadline: row.try_get("deadline")?,
        })
    }

    fn into_record(self) -> Result<StepRecord, RepositoryError> {
        let kind: StepKind = self
            .kind
            .parse()
            .map_err(RepositoryError::Query)?;
        let status: StepStatus = self
            .status
            .parse()
            .map_err(RepositoryError::Query)?;

        let output = self
            .output
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid step output: {e}")))
            })
            .transpose()?;

        Ok(StepRecord {
            name: self.name,
            kind,
            sequence: self.sequence as u32,
            fingerprint: self.fingerprint,
            status,
            attempts: self.attempts as u32,
            last_attempt_at: self
                .last_attempt_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
            output,
            error: self.error,
            deadline: self.deadline.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn to_json(value: &serde_json::Value) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    match &e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => RepositoryError::Connection,
        _ => RepositoryError::Query(e.to_string()),
    }
}

async fn upsert_record<'e, E>(
    executor: E,
    run_id: &Uuid,
    record: &StepRecord,
) -> Result<(), RepositoryError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let output = record.output.as_ref().map(to_json).transpose()?;

    let result = sqlx::query(
        r#"INSERT INTO step_records
           (run_id, name, kind, sequence, fingerprint, status, attempts,
            last_attempt_at, output, error, deadline)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(run_id, name) DO UPDATE SET
             kind = excluded.kind,
             sequence = excluded.sequence,
             fingerprint = excluded.fingerprint,
             status = excluded.status,
             attempts = excluded.attempts,
             last_attempt_at = excluded.last_attempt_at,
             output = excluded.output,
             error = excluded.error,
             deadline = excluded.deadline
           WHERE step_records.status NOT IN ('succeeded', 'failed')"#,
    )
    .bind(run_id.to_string())
    .bind(&record.name)
    .bind(record.kind.as_str())
    .bind(record.sequence as i64)
    .bind(&record.fingerprint)
    .bind(record.status.as_str())
    .bind(record.attempts as i64)
    .bind(record.last_attempt_at.as_ref().map(format_datetime))
    .bind(&output)
    .bind(&record.error)
    .bind(record.deadline.as_ref().map(format_datetime))
    .execute(executor)
    .await
    .map_err(|e| match e.as_database_error() {
        Some(db) if db.is_foreign_key_violation() => RepositoryError::NotFound,
        _ => query_error(e),
    })?;

    if result.rows_affected() == 0 {
        return Err(RepositoryError::Conflict(format!(
            "step '{}' has already settled",
            record.name
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// RunRepository impl
// ---------------------------------------------------------------------------

impl RunRepository for SqliteRunRepository {
    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        let params = to_json(&run.params)?;
        let output = run.output.as_ref().map(to_json).transpose()?;

        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        sqlx::query(
            r#"INSERT INTO workflow_runs
               (id, workflow, params, status, resume_at, failed_step, error, output,
                cancel_requested, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(&run.workflow)
        .bind(&params)
        .bind(run.status.as_str())
        .bind(run.resume_at.as_ref().map(format_datetime))
        .bind(&run.failed_step)
        .bind(&run.error)
        .bind(&output)
        .bind(run.cancel_requested)
        .bind(format_datetime(&run.created_at))
        .bind(format_datetime(&run.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(|e| match e.as_database_error() {
            Some(db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!("run {} already exists", run.id))
            }
            _ => query_error(e),
        })?;

        for record in &run.steps {
            upsert_record(&mut *tx, &run.id, record).await?;
        }

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn load_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut run = RunRow::from_row(&row)
            .map_err(|e| RepositoryError::Query(e.to_string()))?
            .into_run()?;

        let rows = sqlx::query("SELECT * FROM step_records WHERE run_id = ? ORDER BY sequence ASC")
            .bind(run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        run.steps.reserve(rows.len());
        for row in &rows {
            let r = StepRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            run.steps.push(r.into_record()?);
        }
        Ok(Some(run))
    }

    async fn save_record(&self, run_id: &Uuid, record: &StepRecord) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        upsert_record(&mut *tx, run_id, record).await?;
        sqlx::query("UPDATE workflow_runs SET updated_at = ? WHERE id = ?")
            .bind(format_datetime(&Utc::now()))
            .bind(run_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn acquire_run(
        &self,
        run_id: &Uuid,
        lease: &Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_runs
               SET status = 'running', resume_at = NULL, failed_step = NULL, error = NULL,
                   output = NULL, lease = ?, updated_at = ?
               WHERE id = ?
                 AND (status IN ('pending', 'suspended')
                      OR (status = 'running' AND updated_at < ?))"#,
        )
        .bind(lease.to_string())
        .bind(format_datetime(&now))
        .bind(run_id.to_string())
        .bind(format_datetime(&stale_before))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(self.unchanged(run_id).await);
        }
        Ok(())
    }

    async fn settle_run(
        &self,
        run_id: &Uuid,
        lease: &Uuid,
        update: &RunUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let output = update.output.as_ref().map(to_json).transpose()?;

        let result = sqlx::query(
            r#"UPDATE workflow_runs
               SET status = ?, resume_at = ?, failed_step = ?, error = ?, output = ?,
                   lease = NULL, updated_at = ?
               WHERE id = ? AND status = 'running' AND lease = ?"#,
        )
        .bind(update.status.as_str())
        .bind(update.resume_at.as_ref().map(format_datetime))
        .bind(&update.failed_step)
        .bind(&update.error)
        .bind(&output)
        .bind(format_datetime(&now))
        .bind(run_id.to_string())
        .bind(lease.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(self.unchanged(run_id).await);
        }
        Ok(())
    }

    async fn request_cancel(
        &self,
        run_id: &Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, RepositoryError> {
        let id = run_id.to_string();
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let cancelled = sqlx::query(
            r#"UPDATE workflow_runs
               SET status = 'cancelled', resume_at = NULL, failed_step = NULL, error = ?,
                   output = NULL, updated_at = ?
               WHERE id = ? AND status IN ('pending', 'suspended')"#,
        )
        .bind(reason)
        .bind(format_datetime(&now))
        .bind(&id)
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        let outcome = if cancelled.rows_affected() > 0 {
            CancelOutcome::Cancelled
        } else {
            let requested = sqlx::query(
                "UPDATE workflow_runs SET cancel_requested = 1 WHERE id = ? AND status = 'running'",
            )
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;

            if requested.rows_affected() > 0 {
                CancelOutcome::Requested
            } else {
                let status: Option<String> =
                    sqlx::query_scalar("SELECT status FROM workflow_runs WHERE id = ?")
                        .bind(&id)
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(query_error)?;
                let status: RunStatus = status
                    .ok_or(RepositoryError::NotFound)?
                    .parse()
                    .map_err(RepositoryError::Query)?;
                CancelOutcome::AlreadySettled(status)
            }
        };

        tx.commit().await.map_err(query_error)?;
        Ok(outcome)
    }

    async fn cancel_requested(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        let requested: Option<bool> =
            sqlx::query_scalar("SELECT cancel_requested FROM workflow_runs WHERE id = ?")
                .bind(run_id.to_string())
                .fetch_optional(&self.pool.reader)
                .await
                .map_err(query_error)?;
        requested.ok_or(RepositoryError::NotFound)
    }

    async fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM workflow_runs WHERE status = ? ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(status.as_str())
                .bind(limit as i64)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM workflow_runs ORDER BY created_at DESC, id DESC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_error)?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = RunRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            runs.push(r.into_run()?);
        }
        Ok(runs)
    }

    async fn list_due_runs(
        &self,
        workflow: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Uuid>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT id FROM workflow_runs
               WHERE workflow = ?
                 AND ((status = 'suspended' AND resume_at <= ?)
                      OR (status IN ('pending', 'running') AND updated_at < ?))
               ORDER BY CASE WHEN status = 'suspended' THEN resume_at ELSE updated_at END ASC
               LIMIT ?"#,
        )
        .bind(workflow)
        .bind(format_datetime(&now))
        .bind(format_datetime(&stale_before))
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|row| {
                let id: String = row
                    .try_get("id")
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                parse_uuid(&id)
            })
            .collect()
    }
}
