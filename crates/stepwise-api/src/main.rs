//! Stepwise CLI entry point.
//!
//! Binary name: `stepwise`
//!
//! Parses CLI arguments, initializes tracing, storage, and the run
//! controller, then dispatches to the command handler.

mod cli;
mod state;
mod workflows;

use clap::Parser;
use clap_complete::generate;
use stepwise_observe::tracing_setup::{init_tracing, shutdown_tracing};

use cli::{Cli, Commands, StartWorkflow};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_format, cli.default_log_filter(), cli.otel)
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "stepwise", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init().await?;
    let result = dispatch(&cli, &state).await;

    state.db_pool.close().await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: &Cli, state: &AppState) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Start { workflow } => match workflow {
            StartWorkflow::Checkout {
                email,
                metadata,
                follow,
            } => {
                cli::run::start_checkout(state, email.clone(), metadata.clone(), *follow, cli.json)
                    .await
            }
        },

        Commands::Resume { run_id, follow } => {
            cli::run::resume_run(state, *run_id, *follow, cli.json).await
        }

        Commands::Status { run_id } => cli::run::show_status(state, *run_id, cli.json).await,

        Commands::List { status, limit } => {
            cli::run::list_runs(state, *status, *limit, cli.json).await
        }

        Commands::Cancel { run_id } => cli::run::cancel_run(state, *run_id, cli.json).await,

        Commands::Worker => cli::run::run_worker(state, cli.quiet).await,

        Commands::Completions { .. } => unreachable!("handled above"),
    }
}
