//! Workflow runs and the handles returned to callers of `start`/`resume`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::step::StepRecord;

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Completed, failed, and cancelled runs are never executed again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Suspended => "suspended",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "suspended" => Ok(RunStatus::Suspended),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// One execution instance of a workflow with bound input parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// UUIDv7 run ID.
    pub id: Uuid,
    /// Name of the workflow definition this run executes.
    pub workflow: String,
    /// Input parameters, bound at start.
    pub params: serde_json::Value,
    pub status: RunStatus,
    /// The run's ledger, in issue order.
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    /// Earliest time a suspended run may be resumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_at: Option<DateTime<Utc>>,
    /// Name of the step that failed the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    /// Error message if the run failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Value returned by the workflow body on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Set when a cancel arrives while a pass is executing; the pass
    /// settles as cancelled at its next step boundary.
    #[serde(default)]
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    /// A new pending run with an empty ledger.
    pub fn new(workflow: &str, params: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow: workflow.to_string(),
            params,
            status: RunStatus::Pending,
            steps: Vec::new(),
            resume_at: None,
            failed_step: None,
            error: None,
            output: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Look up a ledger record by exact name.
    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Apply a status update in place (mirrors what a repository persists).
    pub fn apply(&mut self, update: &RunUpdate, now: DateTime<Utc>) {
        self.status = update.status;
        self.resume_at = update.resume_at;
        self.failed_step = update.failed_step.clone();
        self.error = update.error.clone();
        self.output = update.output.clone();
        self.updated_at = now;
    }
}

/// Run-level fields written on every status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct RunUpdate {
    pub status: RunStatus,
    pub resume_at: Option<DateTime<Utc>>,
    pub failed_step: Option<String>,
    pub error: Option<String>,
    pub output: Option<serde_json::Value>,
}

impl RunUpdate {
    fn with_status(status: RunStatus) -> Self {
        Self {
            status,
            resume_at: None,
            failed_step: None,
            error: None,
            output: None,
        }
    }

    pub fn running() -> Self {
        Self::with_status(RunStatus::Running)
    }

    pub fn suspended(resume_at: DateTime<Utc>) -> Self {
        Self {
            resume_at: Some(resume_at),
            ..Self::with_status(RunStatus::Suspended)
        }
    }

    pub fn completed(output: serde_json::Value) -> Self {
        Self {
            output: Some(output),
            ..Self::with_status(RunStatus::Completed)
        }
    }

    pub fn failed(step: Option<String>, error: String) -> Self {
        Self {
            failed_step: step,
            error: Some(error),
            ..Self::with_status(RunStatus::Failed)
        }
    }

    pub fn cancelled(reason: &str) -> Self {
        Self {
            error: Some(reason.to_string()),
            ..Self::with_status(RunStatus::Cancelled)
        }
    }
}

/// What `start`/`resume` hand back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHandle {
    pub run_id: Uuid,
    pub workflow: String,
    pub status: RunStatus,
    /// Next eligible resume time of a suspended run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_at: Option<DateTime<Utc>>,
    /// Failing step of a failed run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

impl From<&WorkflowRun> for RunHandle {
    fn from(run: &WorkflowRun) -> Self {
        Self {
            run_id: run.id,
            workflow: run.workflow.clone(),
            status: run.status,
            resume_at: run.resume_at,
            failed_step: run.failed_step.clone(),
            error: run.error.clone(),
            output: run.output.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Suspended.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
    }

    #[test]
    fn test_status_parse_matches_serde_names() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Suspended,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            let via_serde = serde_json::to_value(status).unwrap();
            assert_eq!(via_serde, json!(status.as_str()));
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_apply_update_replaces_run_fields() {
        let now = Utc::now();
        let mut run = WorkflowRun::new("checkout", json!({"email": "a@b.c"}), now);
        assert_eq!(run.status, RunStatus::Pending);

        run.apply(&RunUpdate::suspended(now), now);
        assert_eq!(run.status, RunStatus::Suspended);
        assert_eq!(run.resume_at, Some(now));

        run.apply(&RunUpdate::failed(Some("call".into()), "boom".into()), now);
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.resume_at.is_none());
        assert_eq!(run.failed_step.as_deref(), Some("call"));

        let handle = RunHandle::from(&run);
        assert_eq!(handle.error.as_deref(), Some("boom"));
        assert_eq!(handle.workflow, "checkout");
    }
}
