//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.orbin/` in production)
//! into [`EngineConfig`]. A missing or malformed file yields the defaults.

use std::path::{Path, PathBuf};

use orbin_types::config::EngineConfig;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "ORBIN_DATA_DIR";

/// `$ORBIN_DATA_DIR`, else `~/.orbin`, else `./.orbin`.
pub fn data_dir() -> PathBuf {
    match std::env::var_os(DATA_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".orbin"),
    }
}

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - Missing file: defaults.
/// - Unreadable or unparseable file: a warning, then defaults.
/// - A `default_retry_policy` that fails validation is replaced by the
///   built-in default.
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

    let mut config = match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    if let Err(err) = orbin_core::workflow::retry::validate(&config.default_retry_policy) {
        tracing::warn!("Invalid default_retry_policy in {}: {err}, using default policy", config_path.display());
        config.default_retry_policy = Default::default();
    }
    config
}
