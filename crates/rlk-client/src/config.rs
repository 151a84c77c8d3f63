//! Configuration management for rlk-client
//!
//! - Unix: `~/.config/rlk/client.toml`
//! - Windows: `%APPDATA%\rlk\client.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use rlk_core::client::{ClientConfig, DEFAULT_HEARTBEAT};

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

/// Client configuration
///
/// ```toml
/// [client]
/// heartbeat_secs = 30
///
/// [store]
/// poll_interval_ms = 500
///
/// [device]
/// bell = true
/// notifications = true
///
/// [logging]
/// level = "warn"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub client: ClientSection,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    /// Written to `client.clientId` (empty = generated per run)
    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
}

fn default_heartbeat() -> u64 {
    DEFAULT_HEARTBEAT.as_secs()
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            client_id: None,
            heartbeat_secs: default_heartbeat(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,

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

/// What the terminal device may do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Ring the terminal bell for vibration and tones
    #[serde(default = "default_true")]
    pub bell: bool,

    /// Print notifications; refused as a denied permission when false
    #[serde(default = "default_true")]
    pub notifications: bool,
}

fn default_true() -> bool {
    true
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            bell: true,
            notifications: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

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
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from(custom_path: Option<&Path>) -> Result<Self, ConfigError> {
        match custom_path {
            Some(path) => Self::load(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("client.toml"))
    }

    /// Database path: configured, else the data directory shared with the controller.
    pub fn store_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.store.path {
            return Ok(path.clone());
        }
        project_dirs()
            .map(|dirs| dirs.data_dir().join("sessions.db"))
            .ok_or_else(|| ConfigError::ValidationError("no data directory; set store.path".to_string()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.store.poll_interval_ms)
    }

    pub fn client_config(&self) -> ClientConfig {
        let generated = ClientConfig::generate();
        ClientConfig {
            client_id: self.client.client_id.clone().unwrap_or(generated.client_id),
            heartbeat_interval: Duration::from_secs(self.client.heartbeat_secs),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn create_default_if_missing() -> Result<bool, ConfigError> {
        if let Some(path) = Self::default_path() {
            if !path.exists() {
                Self::default().save(&path)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Valid values: {:?}",
                self.logging.level, valid_levels
            )));
        }
        if self.client.heartbeat_secs == 0 {
            return Err(ConfigError::ValidationError(
                "heartbeat_secs must be greater than 0".to_string(),
            ));
        }
        if self.store.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Command-line arguments take precedence over config file values.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub debug: Option<bool>,
    pub store_path: Option<PathBuf>,
    pub client_id: Option<String>,
    pub no_bell: bool,
}

impl Config {
    pub fn with_overrides(mut self, overrides: &CliOverrides) -> Self {
        if overrides.debug == Some(true) {
            self.logging.level = "debug".to_string();
        }
        if let Some(ref path) = overrides.store_path {
            self.store.path = Some(path.clone());
        }
        if let Some(ref id) = overrides.client_id {
            self.client.client_id = Some(id.clone());
        }
        if overrides.no_bell {
            self.device.bell = false;
        }
        self
    }
}
