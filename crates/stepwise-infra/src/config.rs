//! Global configuration loader for Stepwise.
//!
//! Reads `config.toml` from the data directory (`~/.stepwise/` in production)
//! and deserializes it into [`GlobalConfig`]. Retry policies and durations
//! are validated while deserializing, so a malformed `delay` or `timeout`
//! string is rejected here rather than when a step first runs.

use std::path::Path;

use stepwise_types::config::GlobalConfig;
use stepwise_types::error::ConfigError;

/// Load global configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`GlobalConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - If the file exists and parses successfully, returns the parsed config.
pub async fn load_global_config(data_dir: &Path) -> GlobalConfig {
    match try_load_global_config(data_dir).await {
        Ok(Some(config)) => config,
        Ok(None) => {
            tracing::debug!("No config.toml found in {}, using defaults", data_dir.display());
            GlobalConfig::default()
        }
        Err(err) => {
            tracing::warn!("{err}, using defaults");
            GlobalConfig::default()
        }
    }
}

/// Strict variant of [`load_global_config`]: `Ok(None)` when the file is
/// missing, an error when it cannot be read or parsed.
pub async fn try_load_global_config(data_dir: &Path) -> Result<Option<GlobalConfig>, ConfigError> {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(ConfigError::Io(format!("{}: {err}", config_path.display())));
        }
    };

    toml::from_str::<GlobalConfig>(&content)
        .map(Some)
        .map_err(|err| ConfigError::Parse(format!("{}: {err}", config_path.display())))
}
