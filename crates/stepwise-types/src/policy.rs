//! Declarative retry policies for workflow steps.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::duration::DurationSpec;
use crate::error::ConfigError;

/// Shape of the delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Every retry waits `base`.
    #[default]
    Constant,
    /// Retry after attempt `n` waits `base * n`.
    Linear,
    /// Retry after attempt `n` waits `base * 2^(n - 1)`.
    Exponential,
}

impl fmt::Display for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Backoff::Constant => "constant",
            Backoff::Linear => "linear",
            Backoff::Exponential => "exponential",
        };
        f.write_str(s)
    }
}

/// Retry policy attached to a step at call time.
///
/// Immutable once built. The default is "no retry, no timeout": a single
/// attempt with no bound on its duration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRetryPolicy", into = "RawRetryPolicy")]
pub struct RetryPolicy {
    limit: u32,
    delay: DurationSpec,
    backoff: Backoff,
    timeout: Option<DurationSpec>,
    retry_on_timeout: bool,
}

impl RetryPolicy {
    /// A single attempt, no timeout.
    pub fn none() -> Self {
        Self {
            limit: 1,
            delay: DurationSpec::ZERO,
            backoff: Backoff::Constant,
            timeout: None,
            retry_on_timeout: true,
        }
    }

    /// Build a policy from a free-form delay string such as `"5 second"`.
    pub fn new(limit: u32, delay: &str, backoff: Backoff) -> Result<Self, ConfigError> {
        Self::from_parts(limit, delay.parse()?, backoff)
    }

    /// Build a policy from an already-parsed delay.
    pub fn from_parts(
        limit: u32,
        delay: DurationSpec,
        backoff: Backoff,
    ) -> Result<Self, ConfigError> {
        if limit == 0 {
            return Err(ConfigError::InvalidPolicy(
                "attempt limit must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            limit,
            delay,
            backoff,
            timeout: None,
            retry_on_timeout: true,
        })
    }

    /// Bound every attempt by a free-form timeout such as `"15 minutes"`.
    pub fn with_timeout(self, timeout: &str) -> Result<Self, ConfigError> {
        let spec: DurationSpec = timeout.parse()?;
        self.with_timeout_spec(spec)
    }

    pub fn with_timeout_spec(mut self, timeout: DurationSpec) -> Result<Self, ConfigError> {
        if timeout.is_zero() {
            return Err(ConfigError::InvalidPolicy(
                "timeout must be greater than zero".to_string(),
            ));
        }
        self.timeout = Some(timeout);
        Ok(self)
    }

    /// Treat a timed-out attempt as a terminal failure instead of a retryable one.
    pub fn without_timeout_retry(mut self) -> Self {
        self.retry_on_timeout = false;
        self
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn delay(&self) -> DurationSpec {
        self.delay
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    pub fn timeout(&self) -> Option<DurationSpec> {
        self.timeout
    }

    pub fn retry_on_timeout(&self) -> bool {
        self.retry_on_timeout
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Canonical one-line form, used as the step fingerprint in the ledger.
impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "limit={} delay={} backoff={}",
            self.limit,
            self.delay.as_millis(),
            self.backoff
        )?;
        match self.timeout {
            Some(timeout) => write!(f, " timeout={}", timeout.as_millis())?,
            None => write!(f, " timeout=none")?,
        }
        if !self.retry_on_timeout {
            write!(f, " timeout_terminal")?;
        }
        Ok(())
    }
}

/// Wire/config form of [`RetryPolicy`], validated on conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawRetryPolicy {
    #[serde(default = "default_limit")]
    limit: u32,
    #[serde(default)]
    delay: DurationSpec,
    #[serde(default)]
    backoff: Backoff,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout: Option<DurationSpec>,
    #[serde(default = "default_retry_on_timeout")]
    retry_on_timeout: bool,
}

fn default_limit() -> u32 {
    1
}

fn default_retry_on_timeout() -> bool {
    true
}

impl TryFrom<RawRetryPolicy> for RetryPolicy {
    type Error = ConfigError;

    fn try_from(raw: RawRetryPolicy) -> Result<Self, Self::Error> {
        let mut policy = RetryPolicy::from_parts(raw.limit, raw.delay, raw.backoff)?;
        if let Some(timeout) = raw.timeout {
            policy = policy.with_timeout_spec(timeout)?;
        }
        if !raw.retry_on_timeout {
            policy = policy.without_timeout_retry();
        }
        Ok(policy)
    }
}

impl From<RetryPolicy> for RawRetryPolicy {
    fn from(policy: RetryPolicy) -> Self {
        Self {
            limit: policy.limit,
            delay: policy.delay,
            backoff: policy.backoff,
            timeout: policy.timeout,
            retry_on_timeout: policy.retry_on_timeout,
        }
    }
}
