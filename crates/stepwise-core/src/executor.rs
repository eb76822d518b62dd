//! Step executor: one named step under memoization, timeout, and retry.
//!
//! # Execution flow
//!
//! 1. Claim the name in the ledger. A succeeded record returns its stored
//!    value without running the body; a failed record re-raises its error.
//! 2. A record waiting out a retry delay suspends the run until the delay
//!    ends. A record left in progress with no delay was interrupted
//!    mid-attempt (crash); that attempt counts as a retryable failure.
//! 3. Otherwise loop: begin an attempt, run the body under the policy's
//!    timeout, and ask the [`RetryEvaluator`] what to do next. A non-zero
//!    wait is recorded as a deadline and suspends the run; it is never
//!    slept through in-process.
//!
//! Bodies are not made idempotent. A retryable failure after a partial side
//! effect will repeat that effect on the next attempt.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use stepwise_types::policy::RetryPolicy;
use stepwise_types::step::{StepKind, StepRecord, StepStatus};

use crate::clock::{Clock, deadline_after};
use crate::error::{StepError, WorkflowError};
use crate::ledger::StepLedger;
use crate::repository::RunRepository;
use crate::retry::{AttemptOutcome, FinalOutcome, RetryDecision, RetryEvaluator};

const INTERRUPTED: &str = "attempt interrupted before completion";

/// Runs steps against a run's ledger.
pub struct StepExecutor<'a, R: RunRepository> {
    ledger: &'a mut StepLedger<R>,
    clock: &'a dyn Clock,
}

impl<'a, R: RunRepository> StepExecutor<'a, R> {
    pub fn new(ledger: &'a mut StepLedger<R>, clock: &'a dyn Clock) -> Self {
        Self { ledger, clock }
    }

    /// Run step `name` under `policy`, returning its (possibly memoized) value.
    pub async fn run<T, F, Fut>(
        &mut self,
        name: &str,
        policy: &RetryPolicy,
        mut body: F,
    ) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, StepError>> + Send,
    {
        let fingerprint = policy.to_string();
        let record = self
            .ledger
            .claim(name, StepKind::Step, &fingerprint)?
            .clone();

        match record.status {
            StepStatus::Succeeded => {
                tracing::debug!(step = name, "replaying memoized step result");
                return decode(name, record.output.unwrap_or(Value::Null));
            }
            StepStatus::Failed => {
                return Err(WorkflowError::StepFailed {
                    step: name.to_string(),
                    error: record.error.unwrap_or_default(),
                });
            }
            StepStatus::InProgress => self.recover(name, policy, &record).await?,
            StepStatus::NotStarted => {}
        }

        loop {
            let attempt = self.ledger.begin_attempt(name, self.clock.now()).await?;
            let outcome = attempt_once(policy, &mut body).await;
            let error = outcome.error_message();

            match RetryEvaluator::next(policy, attempt, outcome) {
                RetryDecision::Stop(FinalOutcome::Success(value)) => {
                    self.ledger.record_success(name, value.clone()).await?;
                    tracing::info!(step = name, attempt, "step succeeded");
                    return decode(name, value);
                }
                RetryDecision::Stop(FinalOutcome::Failure(error)) => {
                    self.ledger.record_failure(name, &error, true).await?;
                    tracing::warn!(step = name, attempt, error = error.as_str(), "step failed");
                    return Err(WorkflowError::StepFailed {
                        step: name.to_string(),
                        error,
                    });
                }
                RetryDecision::WaitThen(delay) => {
                    let error = error.unwrap_or_default();
                    tracing::warn!(
                        step = name,
                        attempt,
                        error = error.as_str(),
                        delay_ms = delay.as_millis() as u64,
                        "step attempt failed, will retry"
                    );
                    if delay.is_zero() {
                        self.ledger.record_failure(name, &error, false).await?;
                        continue;
                    }
                    let until = deadline_after(self.clock.now(), delay);
                    self.ledger.schedule(name, until, Some(&error)).await?;
                    return Err(WorkflowError::Suspended { until });
                }
            }
        }
    }

    /// Bring an in-progress record to the point where a new attempt may
    /// begin, or suspend/fail the step.
    async fn recover(
        &mut self,
        name: &str,
        policy: &RetryPolicy,
        record: &StepRecord,
    ) -> Result<(), WorkflowError> {
        let now = self.clock.now();

        if let Some(deadline) = record.deadline {
            if now < deadline {
                tracing::debug!(step = name, deadline = %deadline, "step still waiting to retry");
                return Err(WorkflowError::Suspended { until: deadline });
            }
            return Ok(());
        }

        if record.attempts == 0 {
            return Ok(());
        }

        tracing::warn!(
            step = name,
            attempt = record.attempts,
            "found interrupted attempt on replay"
        );
        let outcome = AttemptOutcome::RetryableFailure(INTERRUPTED.to_string());
        match RetryEvaluator::next(policy, record.attempts, outcome) {
            RetryDecision::Stop(FinalOutcome::Failure(error)) => {
                self.ledger.record_failure(name, &error, true).await?;
                Err(WorkflowError::StepFailed {
                    step: name.to_string(),
                    error,
                })
            }
            RetryDecision::Stop(FinalOutcome::Success(_)) => Ok(()),
            RetryDecision::WaitThen(delay) => {
                let until = deadline_after(record.last_attempt_at.unwrap_or(now), delay);
                if now < until {
                    self.ledger.schedule(name, until, Some(INTERRUPTED)).await?;
                    return Err(WorkflowError::Suspended { until });
                }
                Ok(())
            }
        }
    }
}

/// Run the body once, bounded by the policy's timeout. Panics, whether
/// raised while building the future or while polling it, are reported as
/// retryable failures and never unwind into the run.
async fn attempt_once<T, F, Fut>(policy: &RetryPolicy, body: &mut F) -> AttemptOutcome
where
    T: Serialize,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StepError>>,
{
    let started = match std::panic::catch_unwind(AssertUnwindSafe(|| body())) {
        Ok(future) => future,
        Err(panic) => return AttemptOutcome::RetryableFailure(panic_message(panic.as_ref())),
    };
    let guarded = AssertUnwindSafe(started).catch_unwind();
    let result = match policy.timeout() {
        Some(timeout) => match tokio::time::timeout(timeout.to_std(), guarded).await {
            Ok(result) => result,
            Err(_elapsed) => return AttemptOutcome::TimedOut,
        },
        None => guarded.await,
    };

    match result {
        Ok(Ok(value)) => match serde_json::to_value(&value) {
            Ok(value) => AttemptOutcome::Success(value),
            Err(e) => AttemptOutcome::TerminalFailure(format!("step output is not serializable: {e}")),
        },
        Ok(Err(StepError::Retryable(error))) => AttemptOutcome::RetryableFailure(error),
        Ok(Err(StepError::Terminal(error))) => AttemptOutcome::TerminalFailure(error),
        Err(panic) => AttemptOutcome::RetryableFailure(panic_message(panic.as_ref())),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("step panicked: {detail}")
}

fn decode<T: DeserializeOwned>(name: &str, value: Value) -> Result<T, WorkflowError> {
    serde_json::from_value(value).map_err(|e| WorkflowError::Output {
        step: name.to_string(),
        error: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;
    use stepwise_types::policy::Backoff;
    use stepwise_types::run::WorkflowRun;

    use crate::clock::ManualClock;
    use crate::repository::memory::InMemoryRunRepository;

    struct Harness {
        repo: Arc<InMemoryRunRepository>,
        clock: ManualClock,
        run_id: uuid::Uuid,
    }

    impl Harness {
        async fn new() -> Self {
            let repo = Arc::new(InMemoryRunRepository::new());
            let run = WorkflowRun::new("test", json!({}), Utc::now());
            repo.create_run(&run).await.unwrap();
            Self {
                repo,
                clock: ManualClock::default(),
                run_id: run.id,
            }
        }

        /// A fresh ledger loaded from the store, as after a process restart.
        async fn ledger(&self) -> StepLedger<InMemoryRunRepository> {
            let run = self.repo.load_run(&self.run_id).await.unwrap().unwrap();
            StepLedger::new(Arc::clone(&self.repo), self.run_id, run.steps)
        }
    }

    fn counting_body(
        calls: &Arc<AtomicU32>,
        result: Result<&'static str, fn() -> StepError>,
    ) -> impl FnMut() -> std::future::Ready<Result<String, StepError>> + Send + use<> {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(match result {
                Ok(v) => Ok(v.to_string()),
                Err(make) => Err(make()),
            })
        }
    }

    fn flaky() -> StepError {
        StepError::retryable("flaky")
    }

    #[tokio::test]
    async fn test_succeeded_step_is_memoized_across_replays() {
        let h = Harness::new().await;
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();

        let mut ledger = h.ledger().await;
        let first: String = StepExecutor::new(&mut ledger, &h.clock)
            .run("fetch", &policy, counting_body(&calls, Ok("files")))
            .await
            .unwrap();

        for _ in 0..3 {
            let mut ledger = h.ledger().await;
            let replayed: String = StepExecutor::new(&mut ledger, &h.clock)
                .run("fetch", &policy, counting_body(&calls, Ok("other")))
                .await
                .unwrap();
            assert_eq!(replayed, first);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_without_delay_run_inline_until_exhausted() {
        let h = Harness::new().await;
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, "0 ms", Backoff::Constant).unwrap();

        let mut ledger = h.ledger().await;
        let err = StepExecutor::new(&mut ledger, &h.clock)
            .run::<String, _, _>("call", &policy, counting_body(&calls, Err(flaky)))
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            WorkflowError::StepFailed { step, error } => {
                assert_eq!(step, "call");
                assert!(error.contains("attempts exhausted"), "{error}");
            }
            other => panic!("expected StepFailed, got {other:?}"),
        }

        // A settled failure is re-raised on replay without running the body.
        let mut ledger = h.ledger().await;
        let err = StepExecutor::new(&mut ledger, &h.clock)
            .run::<String, _, _>("call", &policy, counting_body(&calls, Ok("late")))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::StepFailed { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_terminal_failure_stops_on_first_attempt() {
        let h = Harness::new().await;
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(10, "1 second", Backoff::Constant).unwrap();

        let mut ledger = h.ledger().await;
        let err = StepExecutor::new(&mut ledger, &h.clock)
            .run::<String, _, _>(
                "validate",
                &policy,
                counting_body(&calls, Err(|| StepError::terminal("invalid email"))),
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, WorkflowError::StepFailed { ref error, .. } if error == "invalid email"));
    }

    #[tokio::test]
    async fn test_retry_delay_suspends_and_resumes_after_deadline() {
        let h = Harness::new().await;
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, "5 seconds", Backoff::Exponential).unwrap();
        let start = h.clock.now();

        let mut ledger = h.ledger().await;
        let err = StepExecutor::new(&mut ledger, &h.clock)
            .run::<String, _, _>("write", &policy, counting_body(&calls, Err(flaky)))
            .await
            .unwrap_err();
        let until = match err {
            WorkflowError::Suspended { until } => until,
            other => panic!("expected suspension, got {other:?}"),
        };
        assert_eq!(until - start, chrono::TimeDelta::seconds(5));

        // Too early: still suspended, body untouched.
        h.clock.advance(Duration::from_secs(2));
        let mut ledger = h.ledger().await;
        let err = StepExecutor::new(&mut ledger, &h.clock)
            .run::<String, _, _>("write", &policy, counting_body(&calls, Ok("ok")))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Suspended { until: u } if u == until));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Second attempt fails too; next wait is 10s.
        h.clock.advance(Duration::from_secs(3));
        let mut ledger = h.ledger().await;
        let err = StepExecutor::new(&mut ledger, &h.clock)
            .run::<String, _, _>("write", &policy, counting_body(&calls, Err(flaky)))
            .await
            .unwrap_err();
        let second = match err {
            WorkflowError::Suspended { until } => until,
            other => panic!("expected suspension, got {other:?}"),
        };
        assert_eq!(second - h.clock.now(), chrono::TimeDelta::seconds(10));

        h.clock.advance(Duration::from_secs(10));
        let mut ledger = h.ledger().await;
        let value: String = StepExecutor::new(&mut ledger, &h.clock)
            .run("write", &policy, counting_body(&calls, Ok("written")))
            .await
            .unwrap();
        assert_eq!(value, "written");
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let stored = h.repo.load_run(&h.run_id).await.unwrap().unwrap();
        assert_eq!(stored.step("write").unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failed_attempt() {
        let h = Harness::new().await;
        let policy = RetryPolicy::new(2, "0 ms", Backoff::Constant)
            .unwrap()
            .with_timeout("50ms")
            .unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let mut ledger = h.ledger().await;
        let err = StepExecutor::new(&mut ledger, &h.clock)
            .run::<String, _, _>("slow", &policy, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok("never".to_string())
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(err, WorkflowError::StepFailed { ref error, .. } if error.contains("timed out")));
    }

    #[tokio::test]
    async fn test_panicking_body_is_a_retryable_failure() {
        let h = Harness::new().await;
        let policy = RetryPolicy::new(2, "0 ms", Backoff::Constant).unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let mut ledger = h.ledger().await;
        let value: u32 = StepExecutor::new(&mut ledger, &h.clock)
            .run("fragile", &policy, move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        panic!("storage client exploded");
                    }
                    Ok(42u32)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panic_before_the_future_exists_is_caught() {
        let h = Harness::new().await;
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let policy = RetryPolicy::new(2, "0 ms", Backoff::Constant).unwrap();
        let mut ledger = h.ledger().await;
        let value: u32 = StepExecutor::new(&mut ledger, &h.clock)
            .run("eager", &policy, move || {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("bad request builder");
                }
                async { Ok(42u32) }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let always_panics = || -> std::future::Ready<Result<u32, StepError>> {
            panic!("bad request builder")
        };
        let mut ledger = h.ledger().await;
        let err = StepExecutor::new(&mut ledger, &h.clock)
            .run("always-eager", &RetryPolicy::default(), always_panics)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::StepFailed { ref step, ref error }
                if step == "always-eager" && error.ends_with("step panicked: bad request builder")
        ));
        assert!(ledger.lookup("always-eager").unwrap().is_failed());
    }

    #[tokio::test]
    async fn test_interrupted_attempt_counts_toward_limit() {
        let h = Harness::new().await;
        let policy = RetryPolicy::new(1, "0 ms", Backoff::Constant).unwrap();

        // Simulate a crash: the attempt began but never settled.
        let mut ledger = h.ledger().await;
        ledger.claim("call", StepKind::Step, &policy.to_string()).unwrap();
        ledger.begin_attempt("call", h.clock.now()).await.unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let mut ledger = h.ledger().await;
        let err = StepExecutor::new(&mut ledger, &h.clock)
            .run::<String, _, _>("call", &policy, counting_body(&calls, Ok("ok")))
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(err, WorkflowError::StepFailed { ref error, .. } if error.contains("interrupted")));
    }

    #[tokio::test]
    async fn test_interrupted_attempt_retries_when_allowed() {
        let h = Harness::new().await;
        let policy = RetryPolicy::new(3, "0 ms", Backoff::Constant).unwrap();

        let mut ledger = h.ledger().await;
        ledger.claim("call", StepKind::Step, &policy.to_string()).unwrap();
        ledger.begin_attempt("call", h.clock.now()).await.unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let mut ledger = h.ledger().await;
        let value: String = StepExecutor::new(&mut ledger, &h.clock)
            .run("call", &policy, counting_body(&calls, Ok("ok")))
            .await
            .unwrap();
        assert_eq!(value, "ok");
        assert_eq!(ledger.lookup("call").unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn test_replay_with_changed_policy_is_ambiguous() {
        let h = Harness::new().await;
        let calls = Arc::new(AtomicU32::new(0));

        let mut ledger = h.ledger().await;
        let _: String = StepExecutor::new(&mut ledger, &h.clock)
            .run("fetch", &RetryPolicy::default(), counting_body(&calls, Ok("v1")))
            .await
            .unwrap();

        let changed = RetryPolicy::new(5, "1 second", Backoff::Linear).unwrap();
        let mut ledger = h.ledger().await;
        let err = StepExecutor::new(&mut ledger, &h.clock)
            .run::<String, _, _>("fetch", &changed, counting_body(&calls, Ok("v2")))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::AmbiguousStepName { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_memoized_value_with_wrong_type_is_output_error() {
        let h = Harness::new().await;
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();

        let mut ledger = h.ledger().await;
        let _: String = StepExecutor::new(&mut ledger, &h.clock)
            .run("fetch", &policy, counting_body(&calls, Ok("text")))
            .await
            .unwrap();

        let mut ledger = h.ledger().await;
        let err = StepExecutor::new(&mut ledger, &h.clock)
            .run::<u64, _, _>("fetch", &policy, || async { Ok(1u64) })
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Output { .. }));
    }
}
