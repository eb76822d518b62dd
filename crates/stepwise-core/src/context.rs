//! The handle a workflow body uses to issue steps and sleeps.
//!
//! `StepContext` owns the run's [`StepLedger`] for the duration of one pass
//! over the body. Once a step or sleep halts the pass (suspension,
//! cancellation, or an ambiguous name), the halt is sticky: every later call
//! returns the same error without touching the ledger, so a body that
//! swallows the error cannot issue more steps.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use stepwise_types::duration::DurationSpec;
use stepwise_types::policy::RetryPolicy;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{StepError, WorkflowError};
use crate::executor::StepExecutor;
use crate::ledger::StepLedger;
use crate::repository::RunRepository;
use crate::sleep::SleepScheduler;

/// Why a pass over the workflow body stopped early.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Halt {
    Suspended(DateTime<Utc>),
    Cancelled,
    Ambiguous { name: String, reason: String },
}

impl Halt {
    pub(crate) fn from_error(err: &WorkflowError) -> Option<Self> {
        match err {
            WorkflowError::Suspended { until } => Some(Halt::Suspended(*until)),
            WorkflowError::Cancelled => Some(Halt::Cancelled),
            WorkflowError::AmbiguousStepName { name, reason } => Some(Halt::Ambiguous {
                name: name.clone(),
                reason: reason.clone(),
            }),
            _ => None,
        }
    }

    fn to_error(&self) -> WorkflowError {
        match self {
            Halt::Suspended(until) => WorkflowError::Suspended { until: *until },
            Halt::Cancelled => WorkflowError::Cancelled,
            Halt::Ambiguous { name, reason } => WorkflowError::AmbiguousStepName {
                name: name.clone(),
                reason: reason.clone(),
            },
        }
    }
}

/// Step-issuing context for one pass over a workflow body.
pub struct StepContext<R: RunRepository> {
    ledger: StepLedger<R>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    halt: Option<Halt>,
    current_step: Option<String>,
}

impl<R: RunRepository> StepContext<R> {
    pub fn new(ledger: StepLedger<R>, clock: Arc<dyn Clock>, cancel: CancellationToken) -> Self {
        Self {
            ledger,
            clock,
            cancel,
            halt: None,
            current_step: None,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.ledger.run_id()
    }

    /// The orchestrator's notion of now.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Run a step with the default policy (one attempt, no timeout).
    pub async fn step<T, F, Fut>(&mut self, name: &str, body: F) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, StepError>> + Send,
    {
        self.step_with(name, &RetryPolicy::default(), body).await
    }

    /// Run a step under `policy`.
    ///
    /// Returns the memoized value if the step already succeeded in an
    /// earlier pass. [`WorkflowError::StepFailed`] may be caught by the body;
    /// any other error should be propagated with `?`.
    pub async fn step_with<T, F, Fut>(
        &mut self,
        name: &str,
        policy: &RetryPolicy,
        body: F,
    ) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, StepError>> + Send,
    {
        self.checkpoint().await?;
        self.current_step = Some(name.to_string());

        let span = tracing::info_span!("step", run_id = %self.ledger.run_id(), step = name);
        let result = StepExecutor::new(&mut self.ledger, self.clock.as_ref())
            .run(name, policy, body)
            .instrument(span)
            .await;
        self.observe(result)
    }

    /// Durable sleep. Suspends the run until the recorded deadline passes.
    pub async fn sleep(&mut self, name: &str, duration: DurationSpec) -> Result<(), WorkflowError> {
        self.checkpoint().await?;
        self.current_step = Some(name.to_string());

        let span = tracing::info_span!("sleep", run_id = %self.ledger.run_id(), step = name);
        let result = SleepScheduler::new(&mut self.ledger, self.clock.as_ref())
            .sleep(name, duration)
            .instrument(span)
            .await;
        self.observe(result)
    }

    /// Name of the step or sleep most recently issued.
    pub fn current_step(&self) -> Option<&str> {
        self.current_step.as_deref()
    }

    pub(crate) fn halt(&self) -> Option<&Halt> {
        self.halt.as_ref()
    }

    /// Step boundary: honors a sticky halt, then a cancel from this
    /// process (token) or from any other (stored request).
    async fn checkpoint(&mut self) -> Result<(), WorkflowError> {
        if let Some(halt) = &self.halt {
            return Err(halt.to_error());
        }
        if self.cancel.is_cancelled() || self.ledger.cancel_requested().await? {
            self.halt = Some(Halt::Cancelled);
            return Err(WorkflowError::Cancelled);
        }
        Ok(())
    }

    fn observe<T>(&mut self, result: Result<T, WorkflowError>) -> Result<T, WorkflowError> {
        if let Err(err) = &result {
            if let Some(halt) = Halt::from_error(err) {
                self.halt = Some(halt);
            }
        }
        result
    }
}
