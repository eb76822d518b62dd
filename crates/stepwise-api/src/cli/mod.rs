//! CLI command definitions for the `stepwise` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod run;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use stepwise_observe::tracing_setup::LogFormat;
use stepwise_types::run::RunStatus;
use uuid::Uuid;

/// Run durable, replayable workflows.
#[derive(Parser)]
#[command(name = "stepwise", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log line format.
    #[arg(long, global = true, default_value = "pretty", env = "STEPWISE_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "STEPWISE_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Log filter used when `RUST_LOG` is not set.
    pub fn default_log_filter(&self) -> &'static str {
        match self.verbose {
            0 if self.quiet => "error",
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a new workflow run.
    Start {
        #[command(subcommand)]
        workflow: StartWorkflow,
    },

    /// Replay a suspended run from its ledger.
    Resume {
        /// Run UUID.
        run_id: Uuid,

        /// Keep resuming until the run completes, fails, or is cancelled.
        #[arg(long)]
        follow: bool,
    },

    /// Show a run and its step ledger.
    Status {
        /// Run UUID.
        run_id: Uuid,
    },

    /// List recent runs.
    #[command(alias = "ls")]
    List {
        /// Only show runs in this status.
        #[arg(long)]
        status: Option<RunStatus>,

        /// Maximum number of runs to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Cancel a run.
    Cancel {
        /// Run UUID.
        run_id: Uuid,
    },

    /// Resume suspended runs as they become due, until Ctrl+C.
    Worker,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum StartWorkflow {
    /// List files, look up IP ranges, wait, then write with retries.
    Checkout {
        /// Customer email.
        #[arg(long)]
        email: String,

        /// Metadata entry as key=value (repeatable).
        #[arg(long = "meta", value_parser = parse_key_val)]
        metadata: Vec<(String, String)>,

        /// Keep resuming until the run completes, fails, or is cancelled.
        #[arg(long)]
        follow: bool,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}
