//! End-to-end replay behavior of the orchestrator against the in-memory
//! repository and a manual clock.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use serde_json::json;
use stepwise_core::repository::RunRepository;
use stepwise_core::repository::memory::InMemoryRunRepository;
use stepwise_core::{
    Clock, ControllerError, ManualClock, RunController, StepContext, StepError, Workflow, WorkflowError,
};
use stepwise_types::duration::DurationSpec;
use stepwise_types::error::RepositoryError;
use stepwise_types::policy::{Backoff, RetryPolicy};
use stepwise_types::run::{RunHandle, RunStatus, WorkflowRun};
use stepwise_types::step::{StepKind, StepRecord, StepStatus};
use tokio::sync::Notify;
use uuid::Uuid;

fn setup() -> (
    Arc<InMemoryRunRepository>,
    Arc<ManualClock>,
    RunController<InMemoryRunRepository>,
) {
    let repo = Arc::new(InMemoryRunRepository::new());
    let clock = Arc::new(ManualClock::default());
    let controller = RunController::new(Arc::clone(&repo), clock.clone());
    (repo, clock, controller)
}

fn policy(limit: u32, delay: &str, backoff: Backoff) -> RetryPolicy {
    RetryPolicy::new(limit, delay, backoff).unwrap()
}

/// One step under `policy` whose body fails retryably until attempt `succeed_on`.
struct SingleStep {
    policy: RetryPolicy,
    calls: Arc<AtomicU32>,
    /// `u32::MAX` never succeeds.
    succeed_on: u32,
    terminal: bool,
}

impl SingleStep {
    fn new(policy: RetryPolicy, succeed_on: u32) -> Self {
        Self {
            policy,
            calls: Arc::new(AtomicU32::new(0)),
            succeed_on,
            terminal: false,
        }
    }
}

impl Workflow for SingleStep {
    type Params = ();
    type Output = String;

    fn name(&self) -> &str {
        "single-step"
    }

    async fn run<R: RunRepository>(
        &self,
        ctx: &mut StepContext<R>,
        _params: (),
    ) -> Result<String, WorkflowError> {
        let calls = Arc::clone(&self.calls);
        let succeed_on = self.succeed_on;
        let terminal = self.terminal;
        ctx.step_with("call", &self.policy, move || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if terminal {
                    Err(StepError::terminal("invalid input"))
                } else if attempt < succeed_on {
                    Err(StepError::retryable(format!("attempt {attempt} failed")))
                } else {
                    Ok(format!("ok on attempt {attempt}"))
                }
            }
        })
        .await
    }
}

#[tokio::test]
async fn test_completed_step_body_never_reruns_on_replay() {
    struct CountThenSleep {
        calls: Arc<AtomicU32>,
    }

    impl Workflow for CountThenSleep {
        type Params = ();
        type Output = u32;

        fn name(&self) -> &str {
            "count-then-sleep"
        }

        async fn run<R: RunRepository>(
            &self,
            ctx: &mut StepContext<R>,
            _params: (),
        ) -> Result<u32, WorkflowError> {
            let calls = Arc::clone(&self.calls);
            let n: u32 = ctx
                .step("count", move || {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move { Ok(n) }
                })
                .await?;
            ctx.sleep("wait", DurationSpec::minutes(1)).await?;
            Ok(n)
        }
    }

    let (_, clock, controller) = setup();
    let wf = CountThenSleep {
        calls: Arc::new(AtomicU32::new(0)),
    };

    let handle = controller.start(&wf, ()).await.unwrap();
    for _ in 0..5 {
        let h = controller.resume(&wf, handle.run_id).await.unwrap();
        assert_eq!(h.status, RunStatus::Suspended);
    }
    clock.advance(Duration::from_secs(60));
    let done = controller.resume(&wf, handle.run_id).await.unwrap();

    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(done.output, Some(json!(1)));
    assert_eq!(wf.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_limit_three_makes_exactly_three_attempts() {
    let (repo, _, controller) = setup();
    let wf = SingleStep::new(policy(3, "0 ms", Backoff::Constant), u32::MAX);

    let handle = controller.start(&wf, ()).await.unwrap();

    assert_eq!(handle.status, RunStatus::Failed);
    assert_eq!(handle.failed_step.as_deref(), Some("call"));
    assert!(handle.error.unwrap().contains("attempt 3 failed"));
    assert_eq!(wf.calls.load(Ordering::SeqCst), 3);

    let run = repo.load_run(&handle.run_id).await.unwrap().unwrap();
    let record = run.step("call").unwrap();
    assert_eq!(record.status, StepStatus::Failed);
    assert_eq!(record.attempts, 3);
}

#[tokio::test]
async fn test_exponential_retry_waits_are_5_10_20_seconds() {
    let (_, clock, controller) = setup();
    let wf = SingleStep::new(policy(4, "5 seconds", Backoff::Exponential), u32::MAX);

    let mut handle = controller.start(&wf, ()).await.unwrap();
    for expected in [5, 10, 20] {
        assert_eq!(handle.status, RunStatus::Suspended);
        let resume_at = handle.resume_at.unwrap();
        assert_eq!(resume_at - clock.now(), TimeDelta::seconds(expected));

        clock.set(resume_at);
        handle = controller.resume(&wf, handle.run_id).await.unwrap();
    }

    assert_eq!(handle.status, RunStatus::Failed);
    assert_eq!(wf.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_terminal_failure_ignores_remaining_attempts() {
    let (_, _, controller) = setup();
    let mut wf = SingleStep::new(policy(10, "1 second", Backoff::Constant), u32::MAX);
    wf.terminal = true;

    let handle = controller.start(&wf, ()).await.unwrap();

    assert_eq!(handle.status, RunStatus::Failed);
    assert_eq!(handle.error.as_deref(), Some("step 'call' failed: invalid input"));
    assert_eq!(wf.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_sleep_deadline_survives_restart() {
    struct JustSleep;

    impl Workflow for JustSleep {
        type Params = ();
        type Output = ();

        fn name(&self) -> &str {
            "just-sleep"
        }

        async fn run<R: RunRepository>(
            &self,
            ctx: &mut StepContext<R>,
            _params: (),
        ) -> Result<(), WorkflowError> {
            ctx.sleep("x", DurationSpec::seconds(5)).await
        }
    }

    let (repo, clock, controller) = setup();
    let started = controller.start(&JustSleep, ()).await.unwrap();
    let deadline = started.resume_at.unwrap();
    drop(controller);

    // A fresh controller over the same store stands in for a new process.
    clock.advance(Duration::from_secs(3));
    let restarted = RunController::new(Arc::clone(&repo), clock.clone());
    let early = restarted.resume(&JustSleep, started.run_id).await.unwrap();
    assert_eq!(early.status, RunStatus::Suspended);
    assert_eq!(early.resume_at, Some(deadline));

    clock.advance(Duration::from_secs(2));
    let done = restarted.resume(&JustSleep, started.run_id).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_steps_are_observed_in_issue_order() {
    struct ThreeSteps {
        observed: Arc<Mutex<Vec<String>>>,
    }

    impl Workflow for ThreeSteps {
        type Params = ();
        type Output = ();

        fn name(&self) -> &str {
            "three-steps"
        }

        async fn run<R: RunRepository>(
            &self,
            ctx: &mut StepContext<R>,
            _params: (),
        ) -> Result<(), WorkflowError> {
            // A's operation is the slowest; B's the fastest.
            for (name, delay_ms) in [("A", 40u64), ("B", 0), ("C", 10)] {
                let value: String = ctx
                    .step(name, move || async move {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        Ok(name.to_string())
                    })
                    .await?;
                self.observed.lock().unwrap().push(value);
            }
            Ok(())
        }
    }

    let (repo, _, controller) = setup();
    let wf = ThreeSteps {
        observed: Arc::new(Mutex::new(Vec::new())),
    };
    let handle = controller.start(&wf, ()).await.unwrap();

    assert_eq!(handle.status, RunStatus::Completed);
    assert_eq!(*wf.observed.lock().unwrap(), vec!["A", "B", "C"]);

    let run = repo.load_run(&handle.run_id).await.unwrap().unwrap();
    let order: Vec<(&str, u32)> = run
        .steps
        .iter()
        .map(|s| (s.name.as_str(), s.sequence))
        .collect();
    assert_eq!(order, vec![("A", 0), ("B", 1), ("C", 2)]);
}

#[tokio::test]
async fn test_reusing_a_name_with_another_policy_fails_the_run() {
    struct Drifting {
        changed: Arc<AtomicBool>,
    }

    impl Workflow for Drifting {
        type Params = ();
        type Output = ();

        fn name(&self) -> &str {
            "drifting"
        }

        async fn run<R: RunRepository>(
            &self,
            ctx: &mut StepContext<R>,
            _params: (),
        ) -> Result<(), WorkflowError> {
            let policy = if self.changed.load(Ordering::SeqCst) {
                RetryPolicy::new(5, "1 second", Backoff::Linear)
            } else {
                RetryPolicy::new(2, "1 second", Backoff::Constant)
            }
            .map_err(|e| WorkflowError::Other(e.to_string()))?;

            let _: u32 = ctx.step_with("fetch", &policy, || async { Ok(1) }).await?;
            ctx.sleep("wait", DurationSpec::seconds(1)).await
        }
    }

    let (_, _, controller) = setup();
    let wf = Drifting {
        changed: Arc::new(AtomicBool::new(false)),
    };
    let handle = controller.start(&wf, ()).await.unwrap();
    assert_eq!(handle.status, RunStatus::Suspended);

    wf.changed.store(true, Ordering::SeqCst);
    let failed = controller.resume(&wf, handle.run_id).await.unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(failed.failed_step.as_deref(), Some("fetch"));
    assert!(failed.error.unwrap().contains("ambiguous"));
}

/// Two steps; the first blocks until released so a test can act while
/// the pass is mid-step.
struct Gated {
    entered: Arc<Notify>,
    release: Arc<Notify>,
    second_ran: Arc<AtomicBool>,
}

impl Gated {
    fn new() -> Self {
        Self {
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
            second_ran: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Workflow for Gated {
    type Params = ();
    type Output = String;

    fn name(&self) -> &str {
        "gated"
    }

    async fn run<R: RunRepository>(
        &self,
        ctx: &mut StepContext<R>,
        _params: (),
    ) -> Result<String, WorkflowError> {
        let entered = Arc::clone(&self.entered);
        let release = Arc::clone(&self.release);
        let first: String = ctx
            .step("first", move || {
                let entered = Arc::clone(&entered);
                let release = Arc::clone(&release);
                async move {
                    entered.notify_one();
                    release.notified().await;
                    Ok("first".to_string())
                }
            })
            .await?;

        let second_ran = Arc::clone(&self.second_ran);
        ctx.step("second", move || {
            second_ran.store(true, Ordering::SeqCst);
            let first = first.clone();
            async move { Ok(format!("{first}+second")) }
        })
        .await
    }
}

/// Start a `Gated` run on `controller` in the background and wait until its
/// first step is executing.
async fn start_gated(
    controller: &Arc<RunController<InMemoryRunRepository>>,
    wf: &Arc<Gated>,
) -> (
    Uuid,
    tokio::task::JoinHandle<Result<RunHandle, ControllerError>>,
) {
    let task = {
        let controller = Arc::clone(controller);
        let wf = Arc::clone(wf);
        tokio::spawn(async move { controller.start(wf.as_ref(), ()).await })
    };
    wf.entered.notified().await;
    let runs = controller.repo().list_runs(None, 1).await.unwrap();
    (runs[0].id, task)
}

#[tokio::test]
async fn test_cancel_during_a_step_stops_at_the_next_boundary() {
    let (_, _, controller) = setup();
    let controller = Arc::new(controller);
    let wf = Arc::new(Gated::new());

    let (run_id, task) = start_gated(&controller, &wf).await;
    controller.cancel(run_id).await.unwrap();
    wf.release.notify_one();

    let handle = task.await.unwrap().unwrap();
    assert_eq!(handle.status, RunStatus::Cancelled);
    assert!(!wf.second_ran.load(Ordering::SeqCst));

    let run = controller.repo().load_run(&handle.run_id).await.unwrap().unwrap();
    assert!(run.step("first").unwrap().is_succeeded());
    assert!(run.step("second").is_none());
}

#[tokio::test]
async fn test_cancel_from_another_controller_is_not_overwritten() {
    let (repo, clock, controller) = setup();
    let controller = Arc::new(controller);
    // A second process over the same store.
    let other = RunController::new(Arc::clone(&repo), clock.clone());
    let wf = Arc::new(Gated::new());

    let (run_id, task) = start_gated(&controller, &wf).await;

    let requested = other.cancel(run_id).await.unwrap();
    assert_eq!(requested.status, RunStatus::Running);
    wf.release.notify_one();

    let handle = task.await.unwrap().unwrap();
    assert_eq!(handle.status, RunStatus::Cancelled);
    assert!(!wf.second_ran.load(Ordering::SeqCst));

    let stored = repo.load_run(&run_id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Cancelled);
    assert_eq!(stored.output, None);
    assert!(stored.step("first").unwrap().is_succeeded());
}

#[tokio::test]
async fn test_resume_from_another_controller_is_rejected_while_running() {
    let (repo, clock, controller) = setup();
    let controller = Arc::new(controller);
    let other = RunController::new(Arc::clone(&repo), clock.clone());
    let wf = Arc::new(Gated::new());

    let (run_id, task) = start_gated(&controller, &wf).await;

    let err = other.resume(wf.as_ref(), run_id).await.unwrap_err();
    assert!(matches!(err, ControllerError::AlreadyRunning(id) if id == run_id));
    let err = other.resume(wf.as_ref(), run_id).await.unwrap_err();
    assert!(matches!(err, ControllerError::AlreadyRunning(_)));
    wf.release.notify_one();

    let handle = task.await.unwrap().unwrap();
    assert_eq!(handle.status, RunStatus::Completed);
    assert_eq!(handle.output, Some(json!("first+second")));

    let stored = repo.load_run(&run_id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Completed);
    assert_eq!(stored.failed_step, None);
    let first = stored.step("first").unwrap();
    assert!(first.is_succeeded());
    assert_eq!(first.attempts, 1);
}

#[tokio::test]
async fn test_takeover_of_stale_run_fences_the_old_pass() {
    let (repo, clock, controller) = setup();
    let controller = Arc::new(controller);
    let other = RunController::new(Arc::clone(&repo), clock.clone())
        .with_stale_after(Duration::from_secs(60));
    let wf = Arc::new(Gated::new());

    let (run_id, task) = start_gated(&controller, &wf).await;

    // The first pass looks dead once nothing has been written for too long.
    clock.advance(Duration::from_secs(3600));
    let taken = other.resume(wf.as_ref(), run_id).await.unwrap();
    assert_eq!(taken.status, RunStatus::Failed);
    assert_eq!(taken.failed_step.as_deref(), Some("first"));

    wf.release.notify_one();
    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        ControllerError::Repository(RepositoryError::Conflict(_))
    ));

    let stored = repo.load_run(&run_id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert!(stored.step("first").unwrap().is_failed());
    assert!(!wf.second_ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_attempt_interrupted_by_crash_counts_toward_the_limit() {
    let (repo, clock, controller) = setup();
    let wf = SingleStep::new(policy(2, "0 ms", Backoff::Constant), 0);

    // The process died after marking attempt 1 in progress.
    let mut run = WorkflowRun::new("single-step", json!(null), Utc::now());
    let mut record = StepRecord::new(
        "call",
        StepKind::Step,
        0,
        policy(2, "0 ms", Backoff::Constant).to_string(),
    );
    record.status = StepStatus::InProgress;
    record.attempts = 1;
    record.last_attempt_at = Some(clock.now());
    run.steps.push(record);
    run.status = RunStatus::Running;
    repo.create_run(&run).await.unwrap();

    // Nothing has renewed the run's lease since the crash.
    clock.advance(Duration::from_secs(3600));
    let handle = controller.resume(&wf, run.id).await.unwrap();
    assert_eq!(handle.status, RunStatus::Completed);
    assert_eq!(handle.output, Some(json!("ok on attempt 1")));
    assert_eq!(wf.calls.load(Ordering::SeqCst), 1);

    let stored = repo.load_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.step("call").unwrap().attempts, 2);
}
