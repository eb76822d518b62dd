//! Application state wiring storage, configuration, and the run controller.
//!
//! The controller is generic over its repository; AppState pins it to the
//! SQLite implementation.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use stepwise_core::RunController;
use stepwise_infra::config::load_global_config;
use stepwise_infra::filesystem::{ensure_data_dir, resolve_data_dir};
use stepwise_infra::sqlite::pool::{DatabasePool, database_url};
use stepwise_infra::sqlite::run::SqliteRunRepository;
use stepwise_types::config::GlobalConfig;

use crate::workflows::checkout::{CheckoutWorkflow, HttpIpFetcher, RandomFailure};

pub type ConcreteController = RunController<SqliteRunRepository>;

pub type ConcreteCheckout = CheckoutWorkflow<HttpIpFetcher, RandomFailure>;

#[derive(Clone)]
pub struct AppState {
    pub data_dir: PathBuf,
    pub config: GlobalConfig,
    pub db_pool: DatabasePool,
    pub controller: Arc<ConcreteController>,
}

impl AppState {
    /// Initialize from the resolved data directory.
    pub async fn init() -> anyhow::Result<Self> {
        Self::open(resolve_data_dir()).await
    }

    /// Open (creating if needed) the data directory, load `config.toml`, and
    /// connect to the run database.
    pub async fn open(data_dir: PathBuf) -> anyhow::Result<Self> {
        ensure_data_dir(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let config = load_global_config(&data_dir).await;

        let db_url = config
            .database_url
            .clone()
            .unwrap_or_else(|| database_url(&data_dir));
        let db_pool = DatabasePool::new(&db_url)
            .await
            .with_context(|| format!("Failed to open run database at {db_url}"))?;

        let repo = Arc::new(SqliteRunRepository::new(db_pool.clone()));
        let controller = Arc::new(
            RunController::with_system_clock(repo)
                .with_stale_after(config.worker.stale_after.to_std()),
        );

        Ok(Self {
            data_dir,
            config,
            db_pool,
            controller,
        })
    }

    /// The checkout workflow wired to real HTTP and random write failures.
    pub fn checkout(&self) -> anyhow::Result<ConcreteCheckout> {
        let checkout = &self.config.checkout;
        Ok(CheckoutWorkflow::new(
            checkout.clone(),
            HttpIpFetcher::new().context("Failed to build HTTP client")?,
            RandomFailure::new(checkout.failure_rate),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use stepwise_core::repository::RunRepository;

    #[tokio::test]
    async fn test_open_creates_database_in_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("nested");

        let state = AppState::open(data_dir.clone()).await.unwrap();

        assert!(data_dir.join("stepwise.db").exists());
        assert_eq!(state.config.worker.batch_size, 16);
        let runs = state.controller.repo().list_runs(None, 10).await.unwrap();
        assert!(runs.is_empty());
    }

    #[tokio::test]
    async fn test_open_applies_config_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[checkout]\nfailure_rate = 0.0\n[worker]\nbatch_size = 4\n",
        )
        .unwrap();

        let state = AppState::open(dir.path().to_path_buf()).await.unwrap();

        assert_eq!(state.config.worker.batch_size, 4);
        assert_eq!(state.config.checkout.failure_rate, 0.0);
        assert!(state.checkout().is_ok());
    }
}
