//! Configuration management for ptyvisor.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/ptyvisor/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::manager::{
    SessionConfig, DEFAULT_COLS, DEFAULT_DEBOUNCE_INTERVAL, DEFAULT_GRACE_PERIOD,
    DEFAULT_MAX_BUFFER_CHARS, DEFAULT_READ_CHUNK_SIZE, DEFAULT_ROWS,
};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_buffer_chars must be at least 2, got {0}")]
    InvalidMaxBufferChars(usize),

    #[error("read_chunk_size must be between 1 and 1048576, got {0}")]
    InvalidReadChunkSize(usize),

    #[error("cols and rows must be non-zero, got {cols}x{rows}")]
    InvalidWindowSize { cols: u16, rows: u16 },

    #[error("default_timeout_secs must be between 1 and 3600, got {0}")]
    InvalidTimeout(u64),

    #[error("default_shell not found: {0}")]
    InvalidShellPath(String),

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Largest accepted read chunk.
const MAX_READ_CHUNK_SIZE: usize = 1024 * 1024;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub log: LogConfig,

    /// Defaults for PTY sessions.
    pub session: SessionSettings,

    /// Settings for one-shot helper commands.
    pub runner: RunnerConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Directory for daily rotated log files. Logs go to stderr when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

/// Session defaults as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionSettings {
    /// Output buffer cap, in characters.
    pub max_buffer_chars: usize,

    /// Quiet period before buffered output is delivered, in milliseconds.
    pub debounce_ms: u64,

    /// Bytes read from the PTY per readiness event.
    pub read_chunk_size: usize,

    /// Time between SIGTERM and SIGKILL, in milliseconds.
    pub grace_period_ms: u64,

    /// Initial terminal width.
    pub cols: u16,

    /// Initial terminal height.
    pub rows: u16,

    /// Shell used when no program is given.
    pub default_shell: String,
}

/// Settings for one-shot helper commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Timeout for helper commands, in seconds.
    pub default_timeout_secs: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_buffer_chars: DEFAULT_MAX_BUFFER_CHARS,
            debounce_ms: DEFAULT_DEBOUNCE_INTERVAL.as_millis() as u64,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            grace_period_ms: DEFAULT_GRACE_PERIOD.as_millis() as u64,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            default_shell: default_shell(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 10,
        }
    }
}

impl From<&SessionSettings> for SessionConfig {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            max_buffer_chars: settings.max_buffer_chars,
            debounce_interval: Duration::from_millis(settings.debounce_ms),
            read_chunk_size: settings.read_chunk_size,
            grace_period: Duration::from_millis(settings.grace_period_ms),
            cols: settings.cols,
            rows: settings.rows,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ptyvisor")
        .join("config.toml")
}

/// Returns the user's shell, falling back to `/bin/sh`.
fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|shell| !shell.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// Returns true if `name` is an existing file, or a bare name found on `PATH`.
fn shell_exists(name: &str) -> bool {
    let path = Path::new(name);
    if path.is_absolute() || name.contains('/') {
        return path.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(name).is_file()))
        .unwrap_or(false)
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PTYVISOR_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - PTYVISOR_SHELL: Override the default shell
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("PTYVISOR_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!(level = %level, "Overriding log level from environment");
                self.log.level = level;
            }
        }

        if let Ok(shell) = std::env::var("PTYVISOR_SHELL") {
            if !shell.is_empty() {
                tracing::info!(shell = %shell, "Overriding default shell from environment");
                self.session.default_shell = shell;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;

        if session.max_buffer_chars < 2 {
            return Err(ConfigError::InvalidMaxBufferChars(session.max_buffer_chars));
        }

        if session.read_chunk_size == 0 || session.read_chunk_size > MAX_READ_CHUNK_SIZE {
            return Err(ConfigError::InvalidReadChunkSize(session.read_chunk_size));
        }

        if session.cols == 0 || session.rows == 0 {
            return Err(ConfigError::InvalidWindowSize {
                cols: session.cols,
                rows: session.rows,
            });
        }

        let timeout = self.runner.default_timeout_secs;
        if timeout == 0 || timeout > 3600 {
            return Err(ConfigError::InvalidTimeout(timeout));
        }

        if !shell_exists(&session.default_shell) {
            return Err(ConfigError::InvalidShellPath(session.default_shell.clone()));
        }

        let level = self.log.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log.level.clone()));
        }

        Ok(())
    }

    /// Returns the runtime configuration for new sessions.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::from(&self.session)
    }

    /// Returns the timeout for helper commands.
    pub fn runner_timeout(&self) -> Duration {
        Duration::from_secs(self.runner.default_timeout_secs)
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
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

        tracing::debug!(path = %path.display(), "Configuration saved");
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
