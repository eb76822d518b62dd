//! The checkout workflow.
//!
//! Four durable steps: produce a file list, look up the published IP ranges
//! of an upstream API, wait, then make a storage write that fails at a
//! configurable rate and is retried with exponential backoff.
//!
//! The network call and the failure decision sit behind traits so tests can
//! force each branch without touching the network or a random source.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stepwise_core::repository::RunRepository;
use stepwise_core::{StepContext, StepError, Workflow, WorkflowError};
use stepwise_types::config::CheckoutConfig;

pub const WORKFLOW_NAME: &str = "checkout";

pub const LIST_FILES_STEP: &str = "my first step";
pub const FETCH_IPS_STEP: &str = "some other step";
pub const WAIT_STEP: &str = "wait on something";
pub const WRITE_STEP: &str = "make a call to write that could maybe, just might, fail";

const FILES: [&str; 8] = [
    "doc_7392_rev3.pdf",
    "report_x29_final.pdf",
    "memo_2024_05_12.pdf",
    "file_089_update.pdf",
    "proj_alpha_v2.pdf",
    "data_analysis_q2.pdf",
    "notes_meeting_52.pdf",
    "summary_fy24_draft.pdf",
];

/// Input of a checkout run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutParams {
    pub email: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileList {
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpRanges {
    pub ipv4_cidrs: Vec<String>,
    pub ipv6_cidrs: Vec<String>,
}

/// Envelope of the upstream `/ips` response.
#[derive(Debug, Deserialize)]
struct IpsResponse {
    result: IpRanges,
}

/// Result of a completed checkout run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutOutput {
    pub email: String,
    pub files: usize,
    pub ipv4_cidrs: usize,
    pub ipv6_cidrs: usize,
    pub write: String,
}

/// Source of IP range listings.
pub trait IpFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<IpRanges, StepError>> + Send;
}

/// Fetches IP ranges over HTTP.
pub struct HttpIpFetcher {
    client: reqwest::Client,
}

impl HttpIpFetcher {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("stepwise/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl IpFetcher for HttpIpFetcher {
    async fn fetch(&self, url: &str) -> Result<IpRanges, StepError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| StepError::retryable(format!("GET {url} failed: {e}")))?;

        let status = response.status();
        if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(StepError::terminal(format!("GET {url} returned {status}")));
        }
        if !status.is_success() {
            return Err(StepError::retryable(format!("GET {url} returned {status}")));
        }

        let body: IpsResponse = response
            .json()
            .await
            .map_err(|e| StepError::retryable(format!("unexpected response from {url}: {e}")))?;

        tracing::debug!(
            url,
            ipv4 = body.result.ipv4_cidrs.len(),
            ipv6 = body.result.ipv6_cidrs.len(),
            "fetched IP ranges"
        );
        Ok(body.result)
    }
}

/// Decides whether a simulated storage write fails.
pub trait FailureDecision: Send + Sync {
    fn should_fail(&self) -> bool;
}

/// Fails with probability `rate`.
pub struct RandomFailure {
    rate: f64,
}

impl RandomFailure {
    pub fn new(rate: f64) -> Self {
        Self {
            rate: rate.clamp(0.0, 1.0),
        }
    }
}

impl FailureDecision for RandomFailure {
    fn should_fail(&self) -> bool {
        rand::random::<f64>() < self.rate
    }
}

pub struct CheckoutWorkflow<F, D> {
    config: CheckoutConfig,
    fetcher: F,
    decision: D,
}

impl<F: IpFetcher, D: FailureDecision> CheckoutWorkflow<F, D> {
    pub fn new(config: CheckoutConfig, fetcher: F, decision: D) -> Self {
        Self {
            config,
            fetcher,
            decision,
        }
    }
}

impl<F: IpFetcher, D: FailureDecision> Workflow for CheckoutWorkflow<F, D> {
    type Params = CheckoutParams;
    type Output = CheckoutOutput;

    fn name(&self) -> &str {
        WORKFLOW_NAME
    }

    async fn run<R: RunRepository>(
        &self,
        ctx: &mut StepContext<R>,
        params: CheckoutParams,
    ) -> Result<CheckoutOutput, WorkflowError> {
        tracing::info!(
            run_id = %ctx.run_id(),
            email = %params.email,
            metadata_keys = params.metadata.len(),
            "checkout pass started"
        );

        let files: FileList = ctx
            .step(LIST_FILES_STEP, || async {
                Ok::<_, StepError>(FileList {
                    files: FILES.iter().map(|f| f.to_string()).collect(),
                })
            })
            .await?;
        tracing::info!(count = files.files.len(), "file list ready");

        let url = self.config.ips_url.as_str();
        let ranges: IpRanges = ctx
            .step_with(FETCH_IPS_STEP, &self.config.call_policy, move || {
                self.fetcher.fetch(url)
            })
            .await?;
        tracing::info!(
            ipv4 = ranges.ipv4_cidrs.len(),
            ipv6 = ranges.ipv6_cidrs.len(),
            "IP ranges ready"
        );

        ctx.sleep(WAIT_STEP, self.config.wait).await?;

        let decision = &self.decision;
        let write: String = ctx
            .step_with(WRITE_STEP, &self.config.write_policy, move || async move {
                if decision.should_fail() {
                    tracing::warn!("API call to storage system failed");
                    Err(StepError::retryable("API call to storage system failed"))
                } else {
                    Ok("success".to_string())
                }
            })
            .await?;

        Ok(CheckoutOutput {
            email: params.email,
            files: files.files.len(),
            ipv4_cidrs: ranges.ipv4_cidrs.len(),
            ipv6_cidrs: ranges.ipv6_cidrs.len(),
            write,
        })
    }
}
