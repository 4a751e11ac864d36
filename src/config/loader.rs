use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::types::Config;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Config validation failed: {message}")]
    ValidationError { message: String },
}

impl Config {
    /// Returns the path to the configuration file.
    ///
    /// Uses `~/.config/pibake/config.toml` on Linux, or the platform
    /// equivalent via `dirs::config_dir()`.
    /// Falls back to current directory if config_dir is unavailable.
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        config_dir.join("pibake").join("config.toml")
    }

    /// Loads configuration from the default config file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Loads configuration from `path`.
    ///
    /// - If the file doesn't exist, returns `Config::default()`.
    /// - If the file exists, parses it as TOML and validates.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// Checks:
    /// - Runtime program, container image and instance prefix are set
    /// - Username and every prompt literal are non-empty
    /// - All timeouts are positive
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("runtime.program", self.runtime.program.as_str()),
            ("runtime.image", self.runtime.image.as_str()),
            ("runtime.name_prefix", self.runtime.name_prefix.as_str()),
            ("session.username", self.session.username.as_str()),
            ("session.login_prompt", self.session.login_prompt.as_str()),
            ("session.password_prompt", self.session.password_prompt.as_str()),
            ("session.shutdown_command", self.session.shutdown_command.as_str()),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::ValidationError {
                    message: format!("{} must not be empty", field),
                });
            }
        }

        if self.session.shell_prompt().is_empty() {
            return Err(ConfigError::ValidationError {
                message: "session.shell_prompt must not be empty".to_string(),
            });
        }

        let timeouts = [
            ("session.login_timeout_secs", self.session.login_timeout_secs),
            ("session.command_timeout_secs", self.session.command_timeout_secs),
            ("session.shutdown_timeout_secs", self.session.shutdown_timeout_secs),
            ("features.package_timeout_secs", self.features.package_timeout_secs),
        ];
        for (field, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::ValidationError {
                    message: format!("{} must be greater than zero", field),
                });
            }
        }

        Ok(())
    }
}
