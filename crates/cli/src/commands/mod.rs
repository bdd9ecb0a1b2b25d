pub mod config_cmd;
pub mod doctor;
pub mod run;

use drivetalk_config::{AppConfig, ConfigError};
use std::path::Path;

/// Load from `--config` when given, otherwise from the default location.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    match path {
        Some(path) => AppConfig::load_from(path)?.with_env_overrides(),
        None => AppConfig::load(),
    }
}

/// Where configuration is read from.
pub fn config_path(path: Option<&Path>) -> std::path::PathBuf {
    path.map(Path::to_path_buf)
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"))
}
