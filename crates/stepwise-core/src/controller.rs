//! Workflow run controller: the run state machine.
//!
//! ```text
//! Pending -> Running -> { Suspended | Completed | Failed | Cancelled }
//! Suspended -> Running            (resume)
//! { Pending | Suspended } -> Cancelled   (cancel)
//! Running -> Running              (stale lease taken over)
//! ```
//!
//! Every entry into `Running` replays the workflow body from its first
//! statement against the persisted ledger. Steps that already settled
//! resolve instantly, so resumption needs nothing but persisted state.
//!
//! Each pass holds a lease on its run from acquire to settle. Another
//! process can neither resume the run nor overwrite its outcome meanwhile;
//! a cancel from elsewhere is recorded and honored at the next step.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use serde::de::DeserializeOwned;
use stepwise_types::error::RepositoryError;
use stepwise_types::run::{RunHandle, RunStatus, RunUpdate, WorkflowRun};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock, remaining};
use crate::context::{Halt, StepContext};
use crate::error::{ControllerError, WorkflowError};
use crate::ledger::{LedgerError, StepLedger};
use crate::repository::{CancelOutcome, RunRepository};

const CANCELLED_BY_USER: &str = "cancelled by user";

/// Default age after which a running run's lease is considered abandoned.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30 * 60);

/// A caller-defined workflow body.
///
/// The body must issue the same steps in the same order on every replay;
/// anything non-deterministic belongs inside a step.
pub trait Workflow: Send + Sync {
    type Params: Serialize + DeserializeOwned + Send;
    type Output: Serialize + Send;

    /// Stable identifier stored with each run.
    fn name(&self) -> &str;

    fn run<R: RunRepository>(
        &self,
        ctx: &mut StepContext<R>,
        params: Self::Params,
    ) -> impl Future<Output = Result<Self::Output, WorkflowError>> + Send;
}

/// Starts, resumes, and cancels workflow runs.
pub struct RunController<R: RunRepository> {
    repo: Arc<R>,
    clock: Arc<dyn Clock>,
    stale_after: Duration,
    /// Tokens of runs currently executing in this process.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

impl<R: RunRepository> RunController<R> {
    pub fn new(repo: Arc<R>, clock: Arc<dyn Clock>) -> Self {
        Self {
            repo,
            clock,
            stale_after: DEFAULT_STALE_AFTER,
            cancellation_tokens: DashMap::new(),
        }
    }

    /// Set how long a running run may go without a write before another
    /// pass may take it over.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_system_clock(repo: Arc<R>) -> Self {
        Self::new(repo, Arc::new(SystemClock))
    }

    pub fn repo(&self) -> &Arc<R> {
        &self.repo
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Runs left running with no write since this instant are abandoned.
    pub fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        TimeDelta::from_std(self.stale_after)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Create a run of `workflow` with `params` and execute it until it
    /// suspends or settles.
    pub async fn start<W: Workflow>(
        &self,
        workflow: &W,
        params: W::Params,
    ) -> Result<RunHandle, ControllerError> {
        let params = serde_json::to_value(&params)
            .map_err(|e| ControllerError::Serialization(e.to_string()))?;
        let run = WorkflowRun::new(workflow.name(), params, self.clock.now());
        self.repo.create_run(&run).await?;

        tracing::info!(run_id = %run.id, workflow = workflow.name(), "starting workflow run");
        self.execute(workflow, run).await
    }

    /// Replay a run from its ledger.
    ///
    /// Idempotent on settled runs: their handle is returned unchanged. A
    /// suspended run may be resumed before its `resume_at`; the pending
    /// sleep or retry wait simply suspends it again with the same deadline.
    /// A run another pass is executing fails with `AlreadyRunning` until its
    /// lease goes stale.
    pub async fn resume<W: Workflow>(
        &self,
        workflow: &W,
        run_id: Uuid,
    ) -> Result<RunHandle, ControllerError> {
        let run = self.load(run_id).await?;
        if run.workflow != workflow.name() {
            return Err(ControllerError::WorkflowMismatch {
                run_id,
                expected: workflow.name().to_string(),
                actual: run.workflow,
            });
        }
        if run.status.is_terminal() {
            tracing::debug!(run_id = %run_id, status = %run.status, "run already settled");
            return Ok(RunHandle::from(&run));
        }

        tracing::info!(
            run_id = %run_id,
            workflow = workflow.name(),
            recorded_steps = run.steps.len(),
            "resuming workflow run"
        );
        self.execute(workflow, run).await
    }

    /// Resume a run repeatedly, sleeping until each `resume_at`, until it
    /// settles. Only meaningful with a clock that follows real time.
    pub async fn drive<W: Workflow>(
        &self,
        workflow: &W,
        run_id: Uuid,
    ) -> Result<RunHandle, ControllerError> {
        loop {
            let handle = self.resume(workflow, run_id).await?;
            let Some(resume_at) = handle.resume_at.filter(|_| !handle.status.is_terminal()) else {
                return Ok(handle);
            };
            let wait = remaining(self.clock.now(), resume_at);
            tracing::debug!(run_id = %run_id, wait_ms = wait.as_millis() as u64, "waiting to resume");
            tokio::time::sleep(wait).await;
        }
    }

    /// Cancel a run.
    ///
    /// A pending or suspended run is marked cancelled immediately. An
    /// executing run, in this process or another, stops at its next step
    /// boundary. Settled runs are left alone.
    pub async fn cancel(&self, run_id: Uuid) -> Result<RunHandle, ControllerError> {
        if let Some(token) = self.cancellation_tokens.get(&run_id).map(|t| t.clone()) {
            token.cancel();
        }

        let outcome = match self
            .repo
            .request_cancel(&run_id, CANCELLED_BY_USER, self.clock.now())
            .await
        {
            Err(RepositoryError::NotFound) => return Err(ControllerError::RunNotFound(run_id)),
            other => other?,
        };
        match outcome {
            CancelOutcome::Cancelled => tracing::info!(run_id = %run_id, "workflow run cancelled"),
            CancelOutcome::Requested => {
                tracing::info!(run_id = %run_id, "cancellation requested for executing run")
            }
            CancelOutcome::AlreadySettled(status) => {
                tracing::debug!(run_id = %run_id, status = %status, "run already settled")
            }
        }
        self.status(run_id).await
    }

    /// Current handle of a run without executing it.
    pub async fn status(&self, run_id: Uuid) -> Result<RunHandle, ControllerError> {
        let run = self.load(run_id).await?;
        Ok(RunHandle::from(&run))
    }

    async fn load(&self, run_id: Uuid) -> Result<WorkflowRun, ControllerError> {
        self.repo
            .load_run(&run_id)
            .await?
            .ok_or(ControllerError::RunNotFound(run_id))
    }

    /// One pass over the workflow body.
    async fn execute<W: Workflow>(
        &self,
        workflow: &W,
        mut run: WorkflowRun,
    ) -> Result<RunHandle, ControllerError> {
        let run_id = run.id;

        let cancel = CancellationToken::new();
        let _guard = match self.cancellation_tokens.entry(run_id) {
            Entry::Occupied(_) => return Err(ControllerError::AlreadyRunning(run_id)),
            Entry::Vacant(slot) => {
                slot.insert(cancel.clone());
                TokenGuard {
                    tokens: &self.cancellation_tokens,
                    run_id,
                }
            }
        };

        let lease = Uuid::now_v7();
        let now = self.clock.now();
        match self
            .repo
            .acquire_run(&run_id, &lease, now, self.stale_before(now))
            .await
        {
            Ok(()) => {
                if run.status == RunStatus::Running {
                    tracing::warn!(run_id = %run_id, last_update = %run.updated_at, "took over abandoned run");
                }
                run.apply(&RunUpdate::running(), now);
            }
            Err(RepositoryError::Conflict(_)) => {
                let current = self.load(run_id).await?;
                if current.status.is_terminal() {
                    return Ok(RunHandle::from(&current));
                }
                tracing::debug!(run_id = %run_id, status = %current.status, "run held by another pass");
                return Err(ControllerError::AlreadyRunning(run_id));
            }
            Err(e) => return Err(e.into()),
        }
        let params: W::Params = match serde_json::from_value(run.params.clone()) {
            Ok(params) => params,
            Err(e) => {
                let err = WorkflowError::InvalidParams(e.to_string());
                return self
                    .settle(&mut run, &lease, RunUpdate::failed(None, err.to_string()))
                    .await;
            }
        };

        let steps = std::mem::take(&mut run.steps);
        let ledger = StepLedger::new(Arc::clone(&self.repo), run_id, steps);
        let mut ctx = StepContext::new(ledger, Arc::clone(&self.clock), cancel);

        let span = tracing::info_span!("run", run_id = %run_id, workflow = workflow.name());
        let result = workflow.run(&mut ctx, params).instrument(span).await;

        let halt = ctx
            .halt()
            .cloned()
            .or_else(|| result.as_ref().err().and_then(Halt::from_error));
        let update = match (halt, result) {
            (Some(Halt::Suspended(until)), _) => RunUpdate::suspended(until),
            (Some(Halt::Cancelled), _) => RunUpdate::cancelled(CANCELLED_BY_USER),
            (Some(Halt::Ambiguous { name, reason }), _) => {
                let error = WorkflowError::AmbiguousStepName {
                    name: name.clone(),
                    reason,
                };
                RunUpdate::failed(Some(name), error.to_string())
            }
            (None, Ok(output)) => match serde_json::to_value(&output) {
                Ok(output) => RunUpdate::completed(output),
                Err(e) => RunUpdate::failed(None, format!("workflow output is not serializable: {e}")),
            },
            (None, Err(WorkflowError::Ledger(LedgerError::Repository(e)))) => {
                // The ledger is behind the store; leave the run as is so a
                // later resume replays from what was persisted.
                return Err(ControllerError::Repository(e));
            }
            (None, Err(err)) => {
                let step = match &err {
                    WorkflowError::StepFailed { step, .. } | WorkflowError::Output { step, .. } => {
                        Some(step.clone())
                    }
                    _ => ctx.current_step().map(str::to_string),
                };
                RunUpdate::failed(step, err.to_string())
            }
        };

        // A cancel recorded after the last step boundary still wins over
        // suspending.
        let update = if update.status == RunStatus::Suspended
            && self.repo.cancel_requested(&run_id).await?
        {
            RunUpdate::cancelled(CANCELLED_BY_USER)
        } else {
            update
        };

        self.settle(&mut run, &lease, update).await
    }

    async fn settle(
        &self,
        run: &mut WorkflowRun,
        lease: &Uuid,
        update: RunUpdate,
    ) -> Result<RunHandle, ControllerError> {
        let now = self.clock.now();
        match self.repo.settle_run(&run.id, lease, &update, now).await {
            Ok(()) => run.apply(&update, now),
            Err(RepositoryError::Conflict(_)) => {
                tracing::warn!(
                    run_id = %run.id,
                    status = %update.status,
                    "run changed hands during the pass; dropping its outcome"
                );
                return Err(ControllerError::LeaseLost(run.id));
            }
            Err(e) => return Err(e.into()),
        }

        match &update.error {
            Some(error) if update.status.is_terminal() => tracing::warn!(
                run_id = %run.id,
                status = %update.status,
                failed_step = update.failed_step.as_deref().unwrap_or("-"),
                error = error.as_str(),
                "workflow run settled"
            ),
            _ => tracing::info!(
                run_id = %run.id,
                status = %update.status,
                resume_at = ?update.resume_at,
                "workflow run transitioned"
            ),
        }
        Ok(RunHandle::from(&*run))
    }
}

/// Removes a run's cancellation token when its pass ends, however it ends.
struct TokenGuard<'a> {
    tokens: &'a DashMap<Uuid, CancellationToken>,
    run_id: Uuid,
}

impl Drop for TokenGuard<'_> {
    fn drop(&mut self) {
        self.tokens.remove(&self.run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use serde::Deserialize;
    use stepwise_types::duration::DurationSpec;
    use stepwise_types::policy::{Backoff, RetryPolicy};
    use stepwise_types::run::RunStatus;

    use crate::clock::ManualClock;
    use crate::error::StepError;
    use crate::repository::memory::InMemoryRunRepository;

    #[derive(Debug, Serialize, Deserialize)]
    struct Greeting {
        name: String,
    }

    /// greet -> sleep 5s -> shout (may fail terminally).
    struct Greeter {
        greet_calls: Arc<AtomicU32>,
        fail_shout: bool,
    }

    impl Workflow for Greeter {
        type Params = Greeting;
        type Output = BTreeMap<String, String>;

        fn name(&self) -> &str {
            "greeter"
        }

        async fn run<R: RunRepository>(
            &self,
            ctx: &mut StepContext<R>,
            params: Greeting,
        ) -> Result<Self::Output, WorkflowError> {
            let calls = Arc::clone(&self.greet_calls);
            let name = params.name.clone();
            let greeting: String = ctx
                .step("greet", move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let name = name.clone();
                    async move { Ok(format!("hello {name}")) }
                })
                .await?;

            ctx.sleep("pause", DurationSpec::seconds(5)).await?;

            let fail = self.fail_shout;
            let shout: String = ctx
                .step("shout", move || {
                    let greeting = greeting.clone();
                    async move {
                        if fail {
                            Err(StepError::terminal("too loud"))
                        } else {
                            Ok(greeting.to_uppercase())
                        }
                    }
                })
                .await?;

            Ok(BTreeMap::from([("shout".to_string(), shout)]))
        }
    }

    fn greeter(fail_shout: bool) -> Greeter {
        Greeter {
            greet_calls: Arc::new(AtomicU32::new(0)),
            fail_shout,
        }
    }

    fn controller() -> (RunController<InMemoryRunRepository>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let repo = Arc::new(InMemoryRunRepository::new());
        (RunController::new(repo, clock.clone()), clock)
    }

    fn params() -> Greeting {
        Greeting {
            name: "ada".to_string(),
        }
    }

    #[tokio::test]
    async fn test_run_suspends_on_sleep_then_completes_on_resume() {
        let (controller, clock) = controller();
        let wf = greeter(false);

        let handle = controller.start(&wf, params()).await.unwrap();
        assert_eq!(handle.status, RunStatus::Suspended);
        let resume_at = handle.resume_at.unwrap();

        // Early resume keeps the same deadline.
        let early = controller.resume(&wf, handle.run_id).await.unwrap();
        assert_eq!(early.status, RunStatus::Suspended);
        assert_eq!(early.resume_at, Some(resume_at));

        clock.advance(Duration::from_secs(5));
        let done = controller.resume(&wf, handle.run_id).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.output, Some(serde_json::json!({"shout": "HELLO ADA"})));
        assert_eq!(wf.greet_calls.load(Ordering::SeqCst), 1);

        // Resuming a completed run is a no-op.
        let again = controller.resume(&wf, handle.run_id).await.unwrap();
        assert_eq!(again, done);
    }

    #[tokio::test]
    async fn test_failing_step_fails_run_with_step_name() {
        let (controller, clock) = controller();
        let wf = greeter(true);

        let handle = controller.start(&wf, params()).await.unwrap();
        clock.advance(Duration::from_secs(5));
        let failed = controller.resume(&wf, handle.run_id).await.unwrap();

        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.failed_step.as_deref(), Some("shout"));
        assert!(failed.error.unwrap().contains("too loud"));
    }

    #[tokio::test]
    async fn test_cancel_suspended_run() {
        let (controller, clock) = controller();
        let wf = greeter(false);

        let handle = controller.start(&wf, params()).await.unwrap();
        let cancelled = controller.cancel(handle.run_id).await.unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);

        clock.advance(Duration::from_secs(60));
        let after = controller.resume(&wf, handle.run_id).await.unwrap();
        assert_eq!(after.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_unknown_run_is_not_found() {
        let (controller, _) = controller();
        let err = controller.cancel(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, ControllerError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn test_step_panicking_before_its_future_fails_the_run() {
        struct Eager;
        impl Workflow for Eager {
            type Params = ();
            type Output = u32;
            fn name(&self) -> &str {
                "eager"
            }
            async fn run<R: RunRepository>(
                &self,
                ctx: &mut StepContext<R>,
                _params: (),
            ) -> Result<u32, WorkflowError> {
                ctx.step("build", || -> std::future::Ready<Result<u32, StepError>> {
                    panic!("no client configured")
                })
                .await
            }
        }

        let (controller, _) = controller();
        let handle = controller.start(&Eager, ()).await.unwrap();
        assert_eq!(handle.status, RunStatus::Failed);
        assert_eq!(handle.failed_step.as_deref(), Some("build"));
        assert!(handle.error.unwrap().contains("no client configured"));

        let stored = controller.status(handle.run_id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_resume_unknown_run_is_not_found() {
        let (controller, _) = controller();
        let err = controller
            .resume(&greeter(false), Uuid::now_v7())
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn test_resume_with_wrong_workflow_is_rejected() {
        struct Other;
        impl Workflow for Other {
            type Params = Greeting;
            type Output = ();
            fn name(&self) -> &str {
                "other"
            }
            async fn run<R: RunRepository>(
                &self,
                _ctx: &mut StepContext<R>,
                _params: Greeting,
            ) -> Result<(), WorkflowError> {
                Ok(())
            }
        }

        let (controller, _) = controller();
        let handle = controller.start(&greeter(false), params()).await.unwrap();
        let err = controller.resume(&Other, handle.run_id).await.unwrap_err();
        assert!(matches!(err, ControllerError::WorkflowMismatch { .. }));
    }

    #[tokio::test]
    async fn test_undecodable_params_fail_the_run() {
        let (controller, _) = controller();
        let run = WorkflowRun::new("greeter", serde_json::json!({"wrong": true}), chrono::Utc::now());
        controller.repo().create_run(&run).await.unwrap();

        let handle = controller.resume(&greeter(false), run.id).await.unwrap();
        assert_eq!(handle.status, RunStatus::Failed);
        assert!(handle.error.unwrap().contains("invalid run parameters"));
    }

    #[tokio::test]
    async fn test_retry_wait_is_exposed_as_resume_time() {
        struct Flaky;
        impl Workflow for Flaky {
            type Params = ();
            type Output = u32;
            fn name(&self) -> &str {
                "flaky"
            }
            async fn run<R: RunRepository>(
                &self,
                ctx: &mut StepContext<R>,
                _params: (),
            ) -> Result<u32, WorkflowError> {
                let policy = RetryPolicy::new(3, "30 seconds", Backoff::Constant)
                    .map_err(|e| WorkflowError::Other(e.to_string()))?;
                ctx.step_with("call", &policy, || async {
                    Err::<u32, _>(StepError::retryable("503"))
                })
                .await
            }
        }

        let (controller, clock) = controller();
        let start = clock.now();
        let handle = controller.start(&Flaky, ()).await.unwrap();
        assert_eq!(handle.status, RunStatus::Suspended);
        assert_eq!(
            handle.resume_at.unwrap() - start,
            chrono::TimeDelta::seconds(30)
        );
    }

    #[tokio::test]
    async fn test_drive_runs_to_completion_with_real_clock() {
        struct Napper;
        impl Workflow for Napper {
            type Params = ();
            type Output = String;
            fn name(&self) -> &str {
                "napper"
            }
            async fn run<R: RunRepository>(
                &self,
                ctx: &mut StepContext<R>,
                _params: (),
            ) -> Result<String, WorkflowError> {
                ctx.sleep("nap", DurationSpec::millis(20)).await?;
                ctx.step("wake", || async { Ok("awake".to_string()) }).await
            }
        }

        let controller = RunController::with_system_clock(Arc::new(InMemoryRunRepository::new()));
        let handle = controller.start(&Napper, ()).await.unwrap();
        assert_eq!(handle.status, RunStatus::Suspended);

        let done = controller.drive(&Napper, handle.run_id).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.output, Some(serde_json::json!("awake")));
    }
}
