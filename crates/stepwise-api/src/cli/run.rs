//! Run subcommands: start, resume, status, list, cancel, worker.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use stepwise_core::Worker;
use stepwise_core::repository::RunRepository;
use stepwise_types::run::{RunHandle, RunStatus, WorkflowRun};
use stepwise_types::step::{StepRecord, StepStatus};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::state::AppState;
use crate::workflows::checkout::{CheckoutParams, WORKFLOW_NAME};

// ---------------------------------------------------------------------------
// Start / resume
// ---------------------------------------------------------------------------

pub async fn start_checkout(
    state: &AppState,
    email: String,
    metadata: Vec<(String, String)>,
    follow: bool,
    json: bool,
) -> Result<()> {
    let workflow = state.checkout()?;
    let params = CheckoutParams {
        email,
        metadata: metadata.into_iter().collect::<BTreeMap<_, _>>(),
    };

    let mut handle = state
        .controller
        .start(&workflow, params)
        .await
        .context("Failed to start checkout run")?;

    if follow && !handle.status.is_terminal() {
        if !json {
            print_progress(&handle);
        }
        handle = state.controller.drive(&workflow, handle.run_id).await?;
    }

    print_handle(&handle, json)
}

pub async fn resume_run(state: &AppState, run_id: Uuid, follow: bool, json: bool) -> Result<()> {
    let run = load_run(state, run_id).await?;
    if run.workflow != WORKFLOW_NAME {
        bail!("Run {run_id} belongs to unknown workflow '{}'", run.workflow);
    }

    let workflow = state.checkout()?;
    let handle = if follow {
        state.controller.drive(&workflow, run_id).await?
    } else {
        state.controller.resume(&workflow, run_id).await?
    };

    print_handle(&handle, json)
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

pub async fn show_status(state: &AppState, run_id: Uuid, json: bool) -> Result<()> {
    let run = load_run(state, run_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Run {}",
        style("Workflow:").bold(),
        style(run.id).cyan()
    );
    println!("  Workflow: {}", style(&run.workflow).cyan());
    println!("  Status: {}", styled_status(run.status));
    println!("  Created: {}", run.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Updated: {}", run.updated_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(resume_at) = run.resume_at.filter(|_| run.status == RunStatus::Suspended) {
        println!("  Resumes: {}", resume_at.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(ref step) = run.failed_step {
        println!("  Failed step: {}", style(step).yellow());
    }
    if let Some(ref err) = run.error {
        println!("  Error: {}", style(err).red());
    }

    if run.steps.is_empty() {
        println!();
        println!("  No steps recorded yet.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#").fg(Color::Cyan),
            Cell::new("Step"),
            Cell::new("Kind"),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Detail"),
        ]);

    for record in &run.steps {
        table.add_row(vec![
            Cell::new(record.sequence),
            Cell::new(&record.name),
            Cell::new(record.kind),
            format_step_status(record.status),
            Cell::new(record.attempts),
            Cell::new(step_detail(record)),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

fn step_detail(record: &StepRecord) -> String {
    if let Some(ref err) = record.error {
        return err.clone();
    }
    match (record.status, record.deadline) {
        (StepStatus::InProgress, Some(deadline)) => {
            format!("waiting until {}", deadline.format("%H:%M:%S"))
        }
        _ => "-".to_string(),
    }
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub async fn list_runs(
    state: &AppState,
    status: Option<RunStatus>,
    limit: u32,
    json: bool,
) -> Result<()> {
    let runs = state
        .controller
        .repo()
        .list_runs(status, limit)
        .await
        .context("Failed to list runs")?;

    if json {
        let out: Vec<RunHandle> = runs.iter().map(RunHandle::from).collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No runs found.");
        println!(
            "  Start one with: {}",
            style("stepwise start checkout --email <address>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Created"),
            Cell::new("Resume at"),
        ]);

    for r in &runs {
        let resume_at = r
            .resume_at
            .filter(|_| r.status == RunStatus::Suspended)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());

        table.add_row(vec![
            Cell::new(r.id),
            Cell::new(&r.workflow),
            format_run_status(r.status),
            Cell::new(r.created_at.format("%Y-%m-%d %H:%M").to_string()),
            Cell::new(resume_at),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

pub async fn cancel_run(state: &AppState, run_id: Uuid, json: bool) -> Result<()> {
    let handle = state.controller.cancel(run_id).await?;
    print_handle(&handle, json)?;
    if !json && handle.status == RunStatus::Running {
        println!("  Cancellation requested; the run stops at its next step.");
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub async fn run_worker(state: &AppState, quiet: bool) -> Result<()> {
    let workflow = Arc::new(state.checkout()?);
    let worker = Worker::new(
        Arc::clone(&state.controller),
        workflow,
        state.config.worker.poll_interval.to_std(),
        state.config.worker.batch_size,
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => signal.cancel(),
            Err(e) => tracing::warn!(error = %e, "failed to listen for Ctrl+C"),
        }
    });

    if !quiet {
        println!(
            "  {} Worker polling every {} (batch {})",
            style("*").green().bold(),
            state.config.worker.poll_interval,
            state.config.worker.batch_size
        );
        println!("  Data directory: {}", state.data_dir.display());
        println!("  {}", style("Press Ctrl+C to stop").dim());
    }

    worker.run(shutdown).await;

    if !quiet {
        println!("\n  Worker stopped.");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn load_run(state: &AppState, run_id: Uuid) -> Result<WorkflowRun> {
    state
        .controller
        .repo()
        .load_run(&run_id)
        .await
        .context("Failed to load run")?
        .ok_or_else(|| anyhow::anyhow!("Run {run_id} not found"))
}

fn print_progress(handle: &RunHandle) {
    if let Some(resume_at) = handle.resume_at {
        println!(
            "  {} Run {} suspended until {}, following...",
            style("…").dim(),
            style(handle.run_id).cyan(),
            resume_at.format("%H:%M:%S")
        );
    }
}

fn print_handle(handle: &RunHandle, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(handle)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Run {} is {}",
        style("*").green().bold(),
        style(handle.run_id).cyan(),
        styled_status(handle.status)
    );
    match handle.status {
        RunStatus::Suspended => {
            if let Some(resume_at) = handle.resume_at {
                println!("  Resumes at: {}", resume_at.format("%Y-%m-%d %H:%M:%S"));
            }
            println!(
                "  Resume with: {}",
                style(format!("stepwise resume {}", handle.run_id)).dim()
            );
        }
        RunStatus::Failed => {
            if let Some(ref step) = handle.failed_step {
                println!("  Failed step: {}", style(step).yellow());
            }
            if let Some(ref err) = handle.error {
                println!("  Error: {}", style(err).red());
            }
        }
        RunStatus::Completed => {
            if let Some(ref output) = handle.output {
                println!("  Output: {}", serde_json::to_string(output)?);
            }
        }
        _ => {}
    }
    println!();

    Ok(())
}

fn styled_status(status: RunStatus) -> console::StyledObject<&'static str> {
    let text = status.as_str();
    match status {
        RunStatus::Pending => style(text).yellow(),
        RunStatus::Running => style(text).blue(),
        RunStatus::Suspended => style(text).magenta(),
        RunStatus::Completed => style(text).green(),
        RunStatus::Failed => style(text).red(),
        RunStatus::Cancelled => style(text).dim(),
    }
}

fn format_run_status(status: RunStatus) -> Cell {
    let cell = Cell::new(status.as_str());
    match status {
        RunStatus::Pending => cell.fg(Color::Yellow),
        RunStatus::Running => cell.fg(Color::Blue),
        RunStatus::Suspended => cell.fg(Color::Magenta),
        RunStatus::Completed => cell.fg(Color::Green),
        RunStatus::Failed => cell.fg(Color::Red),
        RunStatus::Cancelled => cell.fg(Color::DarkGrey),
    }
}

fn format_step_status(status: StepStatus) -> Cell {
    let cell = Cell::new(status.as_str());
    match status {
        StepStatus::NotStarted => cell,
        StepStatus::InProgress => cell.fg(Color::Yellow),
        StepStatus::Succeeded => cell.fg(Color::Green),
        StepStatus::Failed => cell.fg(Color::Red),
    }
}
