//! Retry policy evaluation.
//!
//! Stateless: given the policy, the 1-based attempt number, and what that
//! attempt produced, decide whether the step is finished or how long to wait
//! before the next attempt. The delay depends only on (policy, attempt), so a
//! replay re-deriving a wait gets the same answer as the first pass.

use std::time::Duration;

use serde_json::Value;
use stepwise_types::policy::{Backoff, RetryPolicy};

/// What one attempt of a step body produced.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success(Value),
    RetryableFailure(String),
    TerminalFailure(String),
    TimedOut,
}

impl AttemptOutcome {
    /// Error text of a failed attempt, `None` on success.
    pub fn error_message(&self) -> Option<String> {
        match self {
            AttemptOutcome::Success(_) => None,
            AttemptOutcome::RetryableFailure(e) | AttemptOutcome::TerminalFailure(e) => {
                Some(e.clone())
            }
            AttemptOutcome::TimedOut => Some("attempt timed out".to_string()),
        }
    }
}

/// Settled result of a step.
#[derive(Debug, Clone, PartialEq)]
pub enum FinalOutcome {
    Success(Value),
    Failure(String),
}

/// The evaluator's verdict after an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Stop(FinalOutcome),
    WaitThen(Duration),
}

/// Stateless retry evaluator.
pub struct RetryEvaluator;

impl RetryEvaluator {
    /// Decide what happens after attempt `attempt` (1-based) produced `outcome`.
    pub fn next(policy: &RetryPolicy, attempt: u32, outcome: AttemptOutcome) -> RetryDecision {
        let error = match outcome {
            AttemptOutcome::Success(value) => {
                return RetryDecision::Stop(FinalOutcome::Success(value));
            }
            AttemptOutcome::TerminalFailure(error) => {
                return RetryDecision::Stop(FinalOutcome::Failure(error));
            }
            AttemptOutcome::TimedOut if !policy.retry_on_timeout() => {
                return RetryDecision::Stop(FinalOutcome::Failure(
                    "attempt timed out".to_string(),
                ));
            }
            AttemptOutcome::TimedOut => "attempt timed out".to_string(),
            AttemptOutcome::RetryableFailure(error) => error,
        };

        if attempt >= policy.limit() {
            return RetryDecision::Stop(FinalOutcome::Failure(format!(
                "attempts exhausted ({attempt}/{}): {error}",
                policy.limit()
            )));
        }

        RetryDecision::WaitThen(Self::delay_for(policy, attempt))
    }

    /// Wait after attempt `attempt` (1-based) before the next one.
    ///
    /// - constant: `base`
    /// - linear: `base * attempt`
    /// - exponential: `base * 2^(attempt - 1)`
    ///
    /// Saturates at [`Duration::MAX`] instead of overflowing.
    pub fn delay_for(policy: &RetryPolicy, attempt: u32) -> Duration {
        let base = policy.delay().to_std();
        let attempt = attempt.max(1);
        match policy.backoff() {
            Backoff::Constant => base,
            Backoff::Linear => base.saturating_mul(attempt),
            Backoff::Exponential => 2u32
                .checked_pow(attempt - 1)
                .map(|factor| base.saturating_mul(factor))
                .unwrap_or(if base.is_zero() { Duration::ZERO } else { Duration::MAX }),
        }
    }
}
