//! Engine configuration loader for Stepflow.
//!
//! Reads `config.toml` from the data directory and deserializes it into
//! [`EngineConfig`]. Falls back to defaults when the file is missing,
//! malformed or fails validation.

use std::path::Path;

use stepflow_types::config::EngineConfig;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "STEPFLOW_DATA_DIR";

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse or validate, logs a warning and
///   returns the default.
/// - Otherwise returns the parsed config.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    let config = match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            return EngineConfig::default();
        }
    };

    match config.validate() {
        Ok(()) => config,
        Err(err) => {
            tracing::warn!("Invalid {}: {err}, using defaults", config_path.display());
            EngineConfig::default()
        }
    }
}

/// Data directory from `STEPFLOW_DATA_DIR`, falling back to `~/.stepflow`.
pub fn default_data_dir() -> std::path::PathBuf {
    match std::env::var(DATA_DIR_ENV) {
        Ok(dir) => dir.into(),
        Err(_) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            Path::new(&home).join(".stepflow")
        }
    }
}
