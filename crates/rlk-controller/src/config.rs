//! Configuration management for rlk-controller
//!
//! Configuration is stored in TOML format.
//!
//! # Configuration File Locations
//!
//! - Unix: `~/.config/rlk/controller.toml`
//! - Windows: `%APPDATA%\rlk\controller.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use rlk_core::controller::{ControllerConfig, DEFAULT_ORIGIN};
use rlk_core::model::SessionSettings;
use rlk_core::types::now_millis;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Controller configuration
///
/// # Example TOML
///
/// ```toml
/// [session]
/// origin = "http://localhost:8080"
/// vibrate_on_lock = true
/// sound_on_lock = true
///
/// [store]
/// path = ""  # Empty = default location
/// poll_interval_ms = 500
///
/// [output]
/// format = "table"  # "table" | "json" | "quiet"
///
/// [logging]
/// level = "warn"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Defaults for sessions this controller creates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Origin share links point at
    #[serde(default = "default_origin")]
    pub origin: String,

    /// Written to `controller.uid` (empty = generated per run)
    #[serde(default)]
    pub uid: Option<String>,

    #[serde(default)]
    pub require_confirmation: bool,

    #[serde(default = "default_true")]
    pub vibrate_on_lock: bool,

    #[serde(default = "default_true")]
    pub sound_on_lock: bool,
}

fn default_origin() -> String {
    DEFAULT_ORIGIN.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            origin: default_origin(),
            uid: None,
            require_confirmation: false,
            vibrate_on_lock: true,
            sound_on_lock: true,
        }
    }
}

/// Session store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the session database (empty = default location)
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// How often other processes' writes are picked up
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval() -> u64 {
    500
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            poll_interval_ms: default_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output format: "table", "json", "quiet"
    #[serde(default = "default_format")]
    pub format: String,

    #[serde(default)]
    pub verbose: bool,
}

fn default_format() -> String {
    "table".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: default_format(),
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Append activity entries to this file
    #[serde(default)]
    pub activity_file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            activity_file: None,
        }
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "remote-lock", "rlk")
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default location
    pub fn load_default() -> Result<Self, ConfigError> {
        if let Some(path) = Self::default_path() {
            if path.exists() {
                return Self::load(&path);
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from custom path or default
    pub fn load_from(custom_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = custom_path {
            Self::load(path)
        } else {
            Self::load_default()
        }
    }

    /// Platform-specific config file path
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("controller.toml"))
    }

    /// Data directory holding the shared session database
    pub fn data_dir() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
    }

    /// Database path: configured, else `<data_dir>/sessions.db`.
    pub fn store_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.store.path {
            return Ok(path.clone());
        }
        Self::data_dir()
            .map(|dir| dir.join("sessions.db"))
            .ok_or_else(|| ConfigError::ValidationError("no data directory; set store.path".to_string()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.store.poll_interval_ms)
    }

    /// Settings written into newly created sessions.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            require_confirmation: self.session.require_confirmation,
            vibrate_on_lock: self.session.vibrate_on_lock,
            sound_on_lock: self.session.sound_on_lock,
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            origin: self.session.origin.clone(),
            uid: self
                .session
                .uid
                .clone()
                .unwrap_or_else(|| format!("controller_{}", now_millis())),
            settings: self.session_settings(),
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create default configuration file if it doesn't exist
    pub fn create_default_if_missing() -> Result<bool, ConfigError> {
        if let Some(path) = Self::default_path() {
            if !path.exists() {
                Self::default().save(&path)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_formats = ["table", "json", "quiet"];
        if !valid_formats.contains(&self.output.format.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid output format '{}'. Valid values: {:?}",
                self.output.format, valid_formats
            )));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Valid values: {:?}",
                self.logging.level, valid_levels
            )));
        }

        if self.store.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        let origin = &self.session.origin;
        if !origin.starts_with("http://") && !origin.starts_with("https://") {
            return Err(ConfigError::ValidationError(format!(
                "Invalid origin '{origin}': must start with http:// or https://"
            )));
        }

        Ok(())
    }

    /// Generate a sample configuration file content
    pub fn sample_toml() -> &'static str {
        r#"# Remote lock controller configuration

[session]
# Origin share links point at
origin = "http://localhost:8080"
# Identifier written to controller.uid (empty = generated per run)
# uid = ""
require_confirmation = false
vibrate_on_lock = true
sound_on_lock = true

[store]
# Path to the session database (empty = default location)
# path = ""
# How often writes from other processes are picked up
poll_interval_ms = 500

[output]
# Output format: "table", "json", "quiet"
format = "table"
verbose = false

[logging]
# Log level: "error", "warn", "info", "debug", "trace"
level = "warn"
# Append activity entries to a file
# activity_file = ""
"#
    }
}

/// CLI configuration overrides
///
/// Command-line arguments take precedence over config file values.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub output_format: Option<String>,
    pub verbose: Option<bool>,
    pub debug: Option<bool>,
    pub store_path: Option<PathBuf>,
    pub origin: Option<String>,
}

impl Config {
    /// Apply CLI overrides to configuration
    pub fn with_overrides(mut self, overrides: &CliOverrides) -> Self {
        if let Some(ref format) = overrides.output_format {
            self.output.format = format.clone();
        }
        if let Some(verbose) = overrides.verbose {
            self.output.verbose = verbose;
        }
        if overrides.debug == Some(true) {
            self.logging.level = "debug".to_string();
        }
        if let Some(ref path) = overrides.store_path {
            self.store.path = Some(path.clone());
        }
        if let Some(ref origin) = overrides.origin {
            self.session.origin = origin.clone();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.session.origin, "http://localhost:8080");
        assert!(config.session.uid.is_none());
        assert!(config.session.vibrate_on_lock);
        assert!(config.session.sound_on_lock);
        assert!(!config.session.require_confirmation);
        assert!(config.store.path.is_none());
        assert_eq!(config.store.poll_interval_ms, 500);
        assert_eq!(config.output.format, "table");
        assert_eq!(config.logging.level, "warn");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_invalid_output_format() {
        let mut config = Config::default();
        config.output.format = "xml".to_string();

        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("Invalid output format"));
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().unwrap_err().to_string().contains("Invalid log level"));
    }

    #[test]
    fn test_validate_zero_poll_interval() {
        let mut config = Config::default();
        config.store.poll_interval_ms = 0;
        assert!(config.validate().unwrap_err().to_string().contains("poll_interval_ms"));
    }

    #[test]
    fn test_validate_invalid_origin() {
        let mut config = Config::default();
        config.session.origin = "localhost:8080".to_string();
        assert!(config.validate().unwrap_err().to_string().contains("Invalid origin"));
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("controller.toml");

        let mut config = Config::default();
        config.session.sound_on_lock = false;
        config.save(&config_path).unwrap();

        let loaded = Config::load(&config_path).unwrap();
        assert!(!loaded.session.sound_on_lock);
        assert_eq!(loaded.output.format, config.output.format);
    }

    #[test]
    fn test_cli_overrides() {
        let overrides = CliOverrides {
            output_format: Some("json".to_string()),
            verbose: Some(true),
            debug: Some(true),
            store_path: Some(PathBuf::from("/tmp/rlk.db")),
            origin: Some("https://lock.example.com".to_string()),
        };

        let config = Config::default().with_overrides(&overrides);

        assert_eq!(config.output.format, "json");
        assert!(config.output.verbose);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.store_path().unwrap(), PathBuf::from("/tmp/rlk.db"));
        assert_eq!(config.controller_config().origin, "https://lock.example.com");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_content = r#"
[session]
origin = "https://lock.example.com"
uid = "desk"
vibrate_on_lock = false

[store]
poll_interval_ms = 100

[output]
format = "quiet"
"#;

        let config: Config = toml::from_str(toml_content).unwrap();

        assert_eq!(config.controller_config().uid, "desk");
        assert!(!config.session_settings().vibrate_on_lock);
        assert!(config.session_settings().sound_on_lock);
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.output.format, "quiet");
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_sample_toml_is_valid() {
        let config: Result<Config, _> = toml::from_str(Config::sample_toml());
        assert!(config.is_ok(), "Sample TOML should be valid: {:?}", config.err());
    }

    #[test]
    fn test_default_path() {
        let path = Config::default_path().unwrap();
        assert!(path.to_string_lossy().contains("controller.toml"));
    }

    #[test]
    fn test_load_from_custom_path() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("custom.toml");
        std::fs::write(&config_path, "[output]\nformat = \"bogus\"\n").unwrap();

        assert!(matches!(
            Config::load_from(Some(&config_path)),
            Err(ConfigError::ValidationError(_))
        ));
    }
}
