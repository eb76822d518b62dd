//! Error taxonomy of the orchestrator.
//!
//! - [`StepError`] is what a step body returns.
//! - [`WorkflowError`] is what the workflow body sees from `step`/`sleep`.
//! - [`ControllerError`] is what callers of `start`/`resume` see.

use std::fmt::Display;

use chrono::{DateTime, Utc};
use stepwise_types::error::RepositoryError;
use uuid::Uuid;

use crate::ledger::LedgerError;

/// Failure returned by a step body for one attempt.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// Transient; eligible for another attempt under the step's policy.
    #[error("{0}")]
    Retryable(String),

    /// The body asserts that retrying cannot help (e.g. invalid input).
    #[error("{0}")]
    Terminal(String),
}

impl StepError {
    pub fn retryable(err: impl Display) -> Self {
        StepError::Retryable(err.to_string())
    }

    pub fn terminal(err: impl Display) -> Self {
        StepError::Terminal(err.to_string())
    }
}

/// Any error a body propagates with `?` is treated as transient.
impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        StepError::Retryable(format!("{err:#}"))
    }
}

/// Errors surfaced to the workflow body by [`crate::StepContext`].
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// The step exhausted its attempts or hit a terminal failure. The body
    /// may catch this and continue.
    #[error("step '{step}' failed: {error}")]
    StepFailed { step: String, error: String },

    /// A step name was reused with different semantics, within one pass or
    /// across replays.
    #[error("step name '{name}' is ambiguous: {reason}")]
    AmbiguousStepName { name: String, reason: String },

    /// The run must pause until `until`; the controller records this.
    #[error("run suspended until {until}")]
    Suspended { until: DateTime<Utc> },

    #[error("run cancelled")]
    Cancelled,

    /// A stored step result does not decode into the type the body asked for.
    #[error("output of step '{step}' could not be decoded: {error}")]
    Output { step: String, error: String },

    #[error("invalid run parameters: {0}")]
    InvalidParams(String),

    #[error("ledger error: {0}")]
    Ledger(LedgerError),

    #[error("{0}")]
    Other(String),
}

impl WorkflowError {
    /// Errors after which the body must not issue further steps.
    pub fn is_halt(&self) -> bool {
        matches!(
            self,
            WorkflowError::Suspended { .. }
                | WorkflowError::Cancelled
                | WorkflowError::AmbiguousStepName { .. }
        )
    }
}

impl From<LedgerError> for WorkflowError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::AmbiguousStepName {
                name,
                recorded,
                declared,
            } => WorkflowError::AmbiguousStepName {
                reason: format!("recorded as '{recorded}', now declared as '{declared}'"),
                name,
            },
            LedgerError::DuplicateStep(name) => WorkflowError::AmbiguousStepName {
                name,
                reason: "declared more than once in the same run".to_string(),
            },
            other => WorkflowError::Ledger(other),
        }
    }
}

/// Errors surfaced to callers of the run controller.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),

    #[error("run {run_id} belongs to workflow '{actual}', not '{expected}'")]
    WorkflowMismatch {
        run_id: Uuid,
        expected: String,
        actual: String,
    },

    #[error("run {0} is already executing")]
    AlreadyRunning(Uuid),

    /// The run was settled or taken over by another pass before this one
    /// finished; its result was dropped.
    #[error("run {0} is no longer held by this pass")]
    LeaseLost(Uuid),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("serialization error: {0}")]
    Serialization(String),
}
