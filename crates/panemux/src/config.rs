//! Configuration management for panemux.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/panemux/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{OverflowPolicy, SessionSettings, ShutdownPolicy};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("{field} must be greater than 0")]
    ZeroValue { field: &'static str },

    #[error("default_shell not found: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("term must not be empty")]
    EmptyTerm,
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Upper bound on `max_sessions`.
const MAX_SESSIONS_LIMIT: usize = 1000;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Host process settings.
    pub daemon: DaemonConfig,

    /// Settings applied to every session.
    pub session: SessionConfig,

    /// Graceful shutdown and restart timing.
    pub shutdown: ShutdownConfig,
}

/// Host process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Also write logs to this file when set.
    pub log_file: Option<PathBuf>,

    /// Overrides the default IPC socket location.
    pub socket_path: Option<PathBuf>,
}

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Program used when a request names none.
    pub default_shell: String,

    /// Maximum number of live sessions.
    pub max_sessions: usize,

    /// Scrollback chunks kept per session.
    pub scrollback_chunks: usize,

    /// Scrollback bytes kept per session.
    pub scrollback_bytes: usize,

    /// Events buffered per subscriber before the overflow policy applies.
    pub subscriber_capacity: usize,

    pub overflow: OverflowPolicy,

    /// `TERM` of spawned processes.
    pub term: String,

    /// How long to wait for buffered output after a process exits.
    pub exit_drain_ms: u64,
}

/// Shutdown timing, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShutdownConfig {
    pub grace_period_ms: u64,
    pub kill_timeout_ms: u64,
    pub restart_settle_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
            socket_path: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        let settings = SessionSettings::default();
        Self {
            default_shell: settings.default_shell,
            max_sessions: settings.max_sessions,
            scrollback_chunks: settings.scrollback_chunks,
            scrollback_bytes: settings.scrollback_bytes,
            subscriber_capacity: settings.subscriber_capacity,
            overflow: settings.overflow,
            term: settings.term,
            exit_drain_ms: settings.exit_drain.as_millis() as u64,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        let policy = ShutdownPolicy::default();
        Self {
            grace_period_ms: policy.grace_period.as_millis() as u64,
            kill_timeout_ms: policy.kill_timeout.as_millis() as u64,
            restart_settle_ms: policy.restart_settle.as_millis() as u64,
        }
    }
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            default_shell: config.default_shell.clone(),
            max_sessions: config.max_sessions,
            scrollback_chunks: config.scrollback_chunks,
            scrollback_bytes: config.scrollback_bytes,
            subscriber_capacity: config.subscriber_capacity,
            overflow: config.overflow,
            term: config.term.clone(),
            exit_drain: Duration::from_millis(config.exit_drain_ms),
            env: Vec::new(),
        }
    }
}

impl From<&ShutdownConfig> for ShutdownPolicy {
    fn from(config: &ShutdownConfig) -> Self {
        Self {
            grace_period: Duration::from_millis(config.grace_period_ms),
            kill_timeout: Duration::from_millis(config.kill_timeout_ms),
            restart_settle: Duration::from_millis(config.restart_settle_ms),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("panemux")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PANEMUX_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - PANEMUX_SHELL: Override the default shell
    /// - PANEMUX_SOCKET: Override the IPC socket path
    pub fn apply_env_overrides(&mut self) {
        if let Some(level) = non_empty_env("PANEMUX_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.daemon.log_level = level;
        }

        if let Some(shell) = non_empty_env("PANEMUX_SHELL") {
            tracing::info!("Overriding default_shell from environment: {}", shell);
            self.session.default_shell = shell;
        }

        if let Some(socket) = non_empty_env("PANEMUX_SOCKET") {
            tracing::info!("Overriding socket_path from environment: {}", socket);
            self.daemon.socket_path = Some(PathBuf::from(socket));
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;

        if session.max_sessions < 1 || session.max_sessions > MAX_SESSIONS_LIMIT {
            return Err(ConfigError::InvalidMaxSessions(session.max_sessions));
        }

        for (field, value) in [
            ("scrollback_chunks", session.scrollback_chunks),
            ("scrollback_bytes", session.scrollback_bytes),
            ("subscriber_capacity", session.subscriber_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroValue { field });
            }
        }

        if session.term.trim().is_empty() {
            return Err(ConfigError::EmptyTerm);
        }

        let shell_path = Path::new(&session.default_shell);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&session.default_shell).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(session.default_shell.clone()));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
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

    /// Load configuration from `~/.config/panemux/config.toml`.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
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

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings::from(&self.session)
    }

    pub fn shutdown_policy(&self) -> ShutdownPolicy {
        ShutdownPolicy::from(&self.shutdown)
    }

    /// The configured socket path, or the default location.
    pub fn socket_path(&self) -> PathBuf {
        self.daemon
            .socket_path
            .clone()
            .unwrap_or_else(crate::ipc::get_socket_path)
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
