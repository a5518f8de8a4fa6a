//! Configuration management for gcdctl.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/gcdctl/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("gcd executable must not be empty")]
    EmptyExecutable,

    #[error("event_capacity must be greater than 0, got {0}")]
    InvalidEventCapacity(usize),

    #[error("shutdown_grace_secs must be between 0 and 3600 seconds, got {0}")]
    InvalidShutdownGrace(u64),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for gcdctl.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// How to invoke the gcd binary.
    pub gcd: GcdConfig,

    /// What to do with the spawned session.
    pub session: SessionConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Invocation of the gcd binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GcdConfig {
    /// Path or name of the gcd executable.
    pub executable: String,

    /// Configuration file handed to gcd with `-c`. Omitted when empty.
    pub config_path: String,

    /// Start gcd in interactive command mode (`--configtest`).
    pub configtest: bool,

    /// Push G-code without machine adaptation (`--raw`).
    pub raw: bool,

    /// Additional arguments appended verbatim.
    pub extra_args: Vec<String>,
}

/// Session behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Commands written to gcd's stdin, one per line.
    pub commands: Vec<String>,

    /// Close gcd's stdin once the commands are written.
    pub close_input: bool,

    /// Seconds between SIGTERM and SIGKILL when interrupted.
    pub shutdown_grace_secs: u64,

    /// Capacity of the session's event channel.
    pub event_capacity: usize,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for GcdConfig {
    fn default() -> Self {
        Self {
            executable: "./gcd".to_string(),
            config_path: "../v3.json".to_string(),
            configtest: true,
            raw: false,
            extra_args: Vec::new(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            commands: vec!["go G0X100Y100".to_string(), "q".to_string()],
            close_input: true,
            shutdown_grace_secs: 5,
            event_capacity: session::DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gcdctl")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - GCDCTL_EXECUTABLE: Override the gcd executable
    /// - GCDCTL_CONFIG_PATH: Override the configuration handed to gcd
    /// - GCDCTL_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(executable) = std::env::var("GCDCTL_EXECUTABLE") {
            if !executable.is_empty() {
                tracing::info!("Overriding gcd executable from environment: {}", executable);
                self.gcd.executable = executable;
            }
        }

        if let Ok(path) = std::env::var("GCDCTL_CONFIG_PATH") {
            if !path.is_empty() {
                tracing::info!("Overriding gcd config path from environment: {}", path);
                self.gcd.config_path = path;
            }
        }

        if let Ok(level) = std::env::var("GCDCTL_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.logging.log_level = level;
            }
        }
    }

    /// Log level to initialize tracing with, before overrides are applied.
    ///
    /// Honors `GCDCTL_LOG_LEVEL` so that logging can be set up first and the
    /// remaining overrides are logged by [`Config::apply_env_overrides`].
    pub fn effective_log_level(&self) -> String {
        match std::env::var("GCDCTL_LOG_LEVEL") {
            Ok(level) if !level.is_empty() => level.to_lowercase(),
            _ => self.logging.log_level.to_lowercase(),
        }
    }

    /// Validate the configuration values.
    ///
    /// The executable itself is not looked up here; a missing binary is
    /// reported when the session is spawned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gcd.executable.trim().is_empty() {
            return Err(ConfigError::EmptyExecutable);
        }

        if self.session.event_capacity == 0 {
            return Err(ConfigError::InvalidEventCapacity(self.session.event_capacity));
        }

        if self.session.shutdown_grace_secs > 3600 {
            return Err(ConfigError::InvalidShutdownGrace(
                self.session.shutdown_grace_secs,
            ));
        }

        let level = self.logging.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.log_level.clone()));
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

    /// Serialize configuration to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize configuration to JSON")
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
