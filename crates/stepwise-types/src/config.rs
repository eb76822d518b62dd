//! Global configuration types for Stepwise.
//!
//! `GlobalConfig` represents the top-level `config.toml`: storage location,
//! worker polling, and the knobs of the bundled checkout workflow.

use serde::{Deserialize, Serialize};

use crate::duration::DurationSpec;
use crate::policy::{Backoff, RetryPolicy};

/// Top-level configuration.
///
/// Loaded from `~/.stepwise/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Override for the SQLite URL (defaults to `{data_dir}/stepwise.db`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub checkout: CheckoutConfig,
}

/// Settings for the background worker that resumes due runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// How often to look for suspended runs whose resume time has passed.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: DurationSpec,

    /// Maximum runs resumed per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// A running or pending run untouched for this long is treated as
    /// abandoned by a dead process and becomes eligible for resumption.
    /// Must exceed the longest step timeout.
    #[serde(default = "default_stale_after")]
    pub stale_after: DurationSpec,
}

fn default_poll_interval() -> DurationSpec {
    DurationSpec::seconds(5)
}

fn default_batch_size() -> u32 {
    16
}

fn default_stale_after() -> DurationSpec {
    DurationSpec::minutes(30)
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            batch_size: default_batch_size(),
            stale_after: default_stale_after(),
        }
    }
}

/// Settings for the checkout workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutConfig {
    /// JSON endpoint listing IPv4/IPv6 CIDR ranges.
    #[serde(default = "default_ips_url")]
    pub ips_url: String,

    /// Probability (0.0..=1.0) that a simulated storage write fails.
    #[serde(default = "default_failure_rate")]
    pub failure_rate: f64,

    /// How long the workflow sleeps between the API call and the write.
    #[serde(default = "default_wait")]
    pub wait: DurationSpec,

    #[serde(default = "default_call_policy")]
    pub call_policy: RetryPolicy,

    #[serde(default = "default_write_policy")]
    pub write_policy: RetryPolicy,
}

fn default_ips_url() -> String {
    "https://api.cloudflare.com/client/v4/ips".to_string()
}

fn default_failure_rate() -> f64 {
    0.5
}

fn default_wait() -> DurationSpec {
    DurationSpec::seconds(5)
}

fn default_call_policy() -> RetryPolicy {
    RetryPolicy::from_parts(5, DurationSpec::seconds(10), Backoff::Exponential)
        .and_then(|p| p.with_timeout_spec(DurationSpec::minutes(10)))
        .unwrap_or_default()
}

fn default_write_policy() -> RetryPolicy {
    RetryPolicy::from_parts(5, DurationSpec::seconds(5), Backoff::Exponential)
        .and_then(|p| p.with_timeout_spec(DurationSpec::minutes(15)))
        .unwrap_or_default()
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            ips_url: default_ips_url(),
            failure_rate: default_failure_rate(),
            wait: default_wait(),
            call_policy: default_call_policy(),
            write_policy: default_write_policy(),
        }
    }
}
