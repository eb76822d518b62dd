//! Durable step orchestration for Stepwise.
//!
//! This crate holds the orchestrator itself and the ports it needs. It
//! depends only on `stepwise-types` -- never on `stepwise-infra` or any
//! database/IO crate.
//!
//! - `ledger` -- per-run record of step outcomes, persisted on every mutation
//! - `retry` -- pure retry/backoff decisions
//! - `executor` -- one step under timeout, retry, and memoization
//! - `sleep` -- durable sleeps that suspend the run instead of blocking
//! - `context` -- the handle a workflow body uses to issue steps and sleeps
//! - `controller` -- start/resume/cancel and the run state machine
//! - `worker` -- polls for suspended runs whose resume time has passed

pub mod clock;
pub mod context;
pub mod controller;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod repository;
pub mod retry;
pub mod sleep;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::StepContext;
pub use controller::{RunController, Workflow};
pub use error::{ControllerError, StepError, WorkflowError};
pub use worker::Worker;
