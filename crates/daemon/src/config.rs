//! Configuration management for the LanShare daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/lanshare/config.toml`.

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("port must be greater than 0")]
    InvalidPort,

    #[error("bind_address is not an IP address: {0}")]
    InvalidBindAddress(String),

    #[error("host_address is not an IP address: {0}")]
    InvalidHostAddress(String),

    #[error("max_file_size must be greater than 0")]
    InvalidMaxFileSize,

    #[error("{0} must be greater than 0 seconds")]
    InvalidDuration(&'static str),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the LanShare daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// HTTP server configuration.
    pub server: ServerConfig,

    /// Shared folder storage.
    pub storage: StorageConfig,

    /// Directory archive downloads.
    pub archive: ArchiveConfig,

    /// Caller display names.
    pub identity: IdentityConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for daemon state: metadata snapshot, audit log, scratch archives.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daily rolling log files. Logs go to stderr only when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind_address: String,

    /// Port to listen on.
    pub port: u16,

    /// Address of the hosting machine. Callers from this address (or
    /// loopback) are admins. Empty means loopback only.
    pub host_address: String,

    /// Take the caller address from `X-Forwarded-For` when present.
    pub trust_forwarded: bool,
}

/// Shared folder storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// The storage root served to clients.
    pub root: PathBuf,

    /// Maximum size of one uploaded file in bytes (default: 4 GiB).
    pub max_file_size: u64,

    /// Lifetime of temporary uploads in seconds (default: 24 hours).
    pub temp_ttl_secs: u64,

    /// Seconds between expiry sweeps (default: 5 minutes).
    pub sweep_interval_secs: u64,
}

/// Directory archive downloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Lifetime of a download token in seconds (default: 30 minutes).
    pub token_ttl_secs: u64,

    /// Seconds between token sweeps.
    pub sweep_interval_secs: u64,

    /// Fall back to the system `zip` program when it is installed.
    pub external_tool: bool,
}

/// Caller display names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdentityConfig {
    /// Name for callers not in `names`.
    pub fallback_name: String,

    /// Address to display name.
    pub names: HashMap<String, String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 9999,
            host_address: String::new(),
            trust_forwarded: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            max_file_size: 4 * 1024 * 1024 * 1024, // 4 GiB
            temp_ttl_secs: 24 * 60 * 60,
            sweep_interval_secs: 5 * 60,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: 30 * 60,
            sweep_interval_secs: 5 * 60,
            external_tool: true,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            fallback_name: "guest".to_string(),
            names: HashMap::new(),
        }
    }
}

impl StorageConfig {
    /// Lifetime of temporary uploads.
    pub fn temp_ttl(&self) -> Duration {
        Duration::from_secs(self.temp_ttl_secs)
    }

    /// Interval between expiry sweeps.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl ArchiveConfig {
    /// Lifetime of a download token.
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    /// Interval between token sweeps.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl DaemonConfig {
    /// Metadata snapshot location.
    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir.join("file_meta.json")
    }

    /// Audit log location.
    pub fn audit_log_path(&self) -> PathBuf {
        self.data_dir.join("audit.log")
    }

    /// Scratch directory for archives.
    pub fn scratch_dir(&self) -> PathBuf {
        self.data_dir.join("tmp")
    }

    /// PID file of a serving daemon.
    pub fn pid_path(&self) -> PathBuf {
        self.data_dir.join("lanshare.pid")
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lanshare")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lanshare")
}

/// Returns the default storage root.
fn default_storage_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("LanShare")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - LANSHARE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - LANSHARE_STORAGE_ROOT: Override the storage root
    /// - LANSHARE_PORT: Override the listen port
    /// - LANSHARE_HOST_ADDRESS: Override the admin host address
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("LANSHARE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(root) = std::env::var("LANSHARE_STORAGE_ROOT") {
            if !root.is_empty() {
                tracing::info!("Overriding storage root from environment: {}", root);
                self.storage.root = PathBuf::from(root);
            }
        }

        if let Ok(port) = std::env::var("LANSHARE_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Overriding port from environment: {}", port);
                    self.server.port = port;
                }
                Err(_) if port.is_empty() => {}
                Err(e) => tracing::warn!("Ignoring LANSHARE_PORT={:?}: {}", port, e),
            }
        }

        if let Ok(host) = std::env::var("LANSHARE_HOST_ADDRESS") {
            if !host.is_empty() {
                tracing::info!("Overriding host_address from environment: {}", host);
                self.server.host_address = host;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        if self.server.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.server.bind_address.parse::<IpAddr>().is_err() {
            return Err(ConfigError::InvalidBindAddress(
                self.server.bind_address.clone(),
            ));
        }
        let host = self.server.host_address.trim();
        if !host.is_empty() && host.parse::<IpAddr>().is_err() {
            return Err(ConfigError::InvalidHostAddress(host.to_string()));
        }

        if self.storage.max_file_size == 0 {
            return Err(ConfigError::InvalidMaxFileSize);
        }
        if self.storage.temp_ttl_secs == 0 {
            return Err(ConfigError::InvalidDuration("storage.temp_ttl_secs"));
        }
        if self.storage.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidDuration("storage.sweep_interval_secs"));
        }
        if self.archive.token_ttl_secs == 0 {
            return Err(ConfigError::InvalidDuration("archive.token_ttl_secs"));
        }
        if self.archive.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidDuration("archive.sweep_interval_secs"));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
