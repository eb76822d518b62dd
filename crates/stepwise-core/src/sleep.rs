//! Durable sleeps.
//!
//! A sleep records its wake-up deadline in the ledger the first time it is
//! reached, then suspends the run. Every later replay compares the clock
//! against the recorded deadline; the sleep is never re-armed, so a restart
//! mid-sleep does not extend it.

use stepwise_types::duration::DurationSpec;
use stepwise_types::step::{StepKind, StepStatus};

use crate::clock::{Clock, deadline_after};
use crate::error::WorkflowError;
use crate::ledger::StepLedger;
use crate::repository::RunRepository;

pub struct SleepScheduler<'a, R: RunRepository> {
    ledger: &'a mut StepLedger<R>,
    clock: &'a dyn Clock,
}

impl<'a, R: RunRepository> SleepScheduler<'a, R> {
    pub fn new(ledger: &'a mut StepLedger<R>, clock: &'a dyn Clock) -> Self {
        Self { ledger, clock }
    }

    /// Resolve sleep `name`. Returns `Ok(())` once the deadline has passed,
    /// otherwise [`WorkflowError::Suspended`] carrying the deadline.
    pub async fn sleep(&mut self, name: &str, duration: DurationSpec) -> Result<(), WorkflowError> {
        let fingerprint = format!("sleep {}", duration.as_millis());
        let record = self.ledger.claim(name, StepKind::Sleep, &fingerprint)?;
        let now = self.clock.now();

        let deadline = match (record.status, record.deadline) {
            (StepStatus::Succeeded, _) => return Ok(()),
            (_, Some(deadline)) => deadline,
            (_, None) => {
                let deadline = deadline_after(now, duration.to_std());
                self.ledger.schedule(name, deadline, None).await?;
                tracing::info!(sleep = name, duration = %duration, until = %deadline, "sleep scheduled");
                deadline
            }
        };

        if now >= deadline {
            self.ledger
                .record_success(name, serde_json::Value::Null)
                .await?;
            tracing::debug!(sleep = name, "sleep elapsed");
            return Ok(());
        }
        Err(WorkflowError::Suspended { until: deadline })
    }
}
