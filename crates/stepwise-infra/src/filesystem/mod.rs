//! Data directory layout for Stepwise.

use std::path::{Path, PathBuf};

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `STEPWISE_DATA_DIR` environment variable
/// 2. `~/.stepwise` under the user's home directory
/// 3. `./.stepwise` as a last resort
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STEPWISE_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".stepwise");
    }

    PathBuf::from(".stepwise")
}

/// Create the data directory if needed.
pub async fn ensure_data_dir(data_dir: &Path) -> Result<(), std::io::Error> {
    tokio::fs::create_dir_all(data_dir).await
}

/// Path of the global config file inside `data_dir`.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.toml")
}
