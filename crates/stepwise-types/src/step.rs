//! Step records: the entries of a run's ledger.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a single named step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    NotStarted,
    InProgress,
    Succeeded,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::NotStarted => "not_started",
            StepStatus::InProgress => "in_progress",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(StepStatus::NotStarted),
            "in_progress" => Ok(StepStatus::InProgress),
            "succeeded" => Ok(StepStatus::Succeeded),
            "failed" => Ok(StepStatus::Failed),
            other => Err(format!("unknown step status '{other}'")),
        }
    }
}

/// Whether a record belongs to a step body or a durable sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Step,
    Sleep,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::Step => "step",
            StepKind::Sleep => "sleep",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "step" => Ok(StepKind::Step),
            "sleep" => Ok(StepKind::Sleep),
            other => Err(format!("unknown step kind '{other}'")),
        }
    }
}

/// Durable record of one named step within a run.
///
/// Keyed by `name` (exact string equality). Once `status` is
/// [`StepStatus::Succeeded`], `output` never changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Human-assigned step name, unique within the run.
    pub name: String,
    pub kind: StepKind,
    /// Position in the run's ledger (0-based, issue order).
    pub sequence: u32,
    /// Canonical description of how the step was declared (policy for
    /// steps, duration for sleeps). A replay declaring the same name with a
    /// different fingerprint is ambiguous.
    pub fingerprint: String,
    pub status: StepStatus,
    /// Number of attempts begun so far.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Stored result of a succeeded step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Last error seen; final for a failed step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wake-up time: the sleep deadline, or the earliest next attempt of a
    /// step waiting out a retry delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

impl StepRecord {
    /// A fresh, never-attempted record.
    pub fn new(name: &str, kind: StepKind, sequence: u32, fingerprint: String) -> Self {
        Self {
            name: name.to_string(),
            kind,
            sequence,
            fingerprint,
            status: StepStatus::NotStarted,
            attempts: 0,
            last_attempt_at: None,
            output: None,
            error: None,
            deadline: None,
        }
    }

    pub fn is_succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }
}
