//! Configuration management for the labterm daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/labterm/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{BridgeOptions, LifecycleOptions};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("listen_addr must be a socket address like 127.0.0.1:5000, got {0}")]
    InvalidListenAddr(String),

    #[error("max_message_size must be greater than 0")]
    InvalidMaxMessageSize,

    #[error("shell command must not be empty")]
    EmptyShell,

    #[error("default terminal size {rows}x{cols} is out of range")]
    InvalidTerminalSize { rows: u16, cols: u16 },

    #[error("read_buffer_size must be between 1 and 65536, got {0}")]
    InvalidReadBufferSize(usize),

    #[error("poll_interval_ms must be between 1 and 1000, got {0}")]
    InvalidPollInterval(u64),

    #[error("join_timeout_ms must be between 1 and 60000, got {0}")]
    InvalidJoinTimeout(u64),

    #[error("client_buffer must be greater than 0")]
    InvalidClientBuffer,

    #[error("command_timeout_secs must be between 1 and 600, got {0}")]
    InvalidCommandTimeout(u64),

    #[error("lab {0} must list at least one role")]
    EmptyLabRoles(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the labterm daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// WebSocket gateway configuration.
    pub gateway: GatewayConfig,

    /// Terminal session configuration.
    pub session: SessionConfig,

    /// Container runtime configuration.
    pub runtime: RuntimeConfig,

    /// Known labs, keyed by room name.
    pub labs: BTreeMap<String, LabConfig>,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for runtime state.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daily log files. Logs only go to stderr when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

/// WebSocket gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address the gateway listens on.
    pub listen_addr: String,

    /// Largest accepted frame in bytes.
    pub max_message_size: usize,
}

/// Terminal session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Command started inside the container.
    pub shell: Vec<String>,

    /// `TERM` exported to the shell.
    pub term: String,

    /// Rows used when a client sends no size.
    pub default_rows: u16,

    /// Columns used when a client sends no size.
    pub default_cols: u16,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Bytes read from a terminal at once.
    pub read_buffer_size: usize,

    /// Upper bound of one reader wait, in milliseconds.
    pub poll_interval_ms: u64,

    /// How long teardown waits for a reader, in milliseconds.
    pub join_timeout_ms: u64,

    /// Events buffered per client before output is dropped.
    pub client_buffer: usize,
}

/// Container runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Docker client binary, looked up on `PATH` unless absolute.
    pub docker_binary: String,

    /// Start stopped containers on demand.
    pub auto_start: bool,

    /// Container names by role, overriding `<role>-<room>`.
    pub container_names: BTreeMap<String, String>,

    /// Longest a single docker command may run, in seconds.
    pub command_timeout_secs: u64,
}

/// A lab environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct LabConfig {
    /// Human-readable description.
    pub description: String,

    /// Roles, one container each.
    pub roles: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            gateway: GatewayConfig::default(),
            session: SessionConfig::default(),
            runtime: RuntimeConfig::default(),
            labs: default_labs(),
        }
    }
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

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:5000".to_string(),
            max_message_size: labterm_protocol::MAX_MESSAGE_SIZE,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: vec![
                "/bin/bash".to_string(),
                "--login".to_string(),
                "-i".to_string(),
            ],
            term: "xterm-256color".to_string(),
            default_rows: labterm_protocol::DEFAULT_ROWS,
            default_cols: labterm_protocol::DEFAULT_COLS,
            max_sessions: 64,
            read_buffer_size: 1024,
            poll_interval_ms: 100,
            join_timeout_ms: 500,
            client_buffer: 256,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_binary: "docker".to_string(),
            auto_start: true,
            container_names: BTreeMap::new(),
            command_timeout_secs: 30,
        }
    }
}

fn default_labs() -> BTreeMap<String, LabConfig> {
    let mut labs = BTreeMap::new();
    labs.insert(
        "arp_poisoning".to_string(),
        LabConfig {
            description: "ARP cache poisoning".to_string(),
            roles: vec!["HostA".into(), "HostB".into(), "HostM".into()],
        },
    );
    labs.insert(
        "sniffing_spoofing".to_string(),
        LabConfig {
            description: "Packet sniffing with ARP spoofing".to_string(),
            roles: vec!["attacker".into(), "hostA".into(), "hostB".into()],
        },
    );
    labs
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("labterm")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("labterm")
}

impl RuntimeConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl SessionConfig {
    /// Bridge and controller settings derived from this section.
    pub fn lifecycle_options(&self) -> LifecycleOptions {
        LifecycleOptions {
            bridge: BridgeOptions {
                shell: self.shell.clone(),
                term: self.term.clone(),
                read_buffer_size: self.read_buffer_size,
                poll_interval: Duration::from_millis(self.poll_interval_ms),
                join_timeout: Duration::from_millis(self.join_timeout_ms),
            },
            max_sessions: self.max_sessions,
        }
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - LABTERM_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - LABTERM_LISTEN_ADDR: Override the gateway listen address
    /// - LABTERM_DOCKER: Override the docker binary
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("LABTERM_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(addr) = std::env::var("LABTERM_LISTEN_ADDR") {
            if !addr.is_empty() {
                tracing::info!("Overriding listen_addr from environment: {}", addr);
                self.gateway.listen_addr = addr;
            }
        }

        if let Ok(docker) = std::env::var("LABTERM_DOCKER") {
            if !docker.is_empty() {
                tracing::info!("Overriding docker_binary from environment: {}", docker);
                self.runtime.docker_binary = docker;
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

        if self.gateway.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddr(
                self.gateway.listen_addr.clone(),
            ));
        }

        if self.gateway.max_message_size == 0 {
            return Err(ConfigError::InvalidMaxMessageSize);
        }

        let session = &self.session;
        if session.max_sessions < 1 || session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(session.max_sessions));
        }

        if session.shell.first().map_or(true, |s| s.trim().is_empty()) {
            return Err(ConfigError::EmptyShell);
        }

        if !crate::router::ROWS_RANGE.contains(&session.default_rows)
            || !crate::router::COLS_RANGE.contains(&session.default_cols)
        {
            return Err(ConfigError::InvalidTerminalSize {
                rows: session.default_rows,
                cols: session.default_cols,
            });
        }

        if session.read_buffer_size < 1 || session.read_buffer_size > 65536 {
            return Err(ConfigError::InvalidReadBufferSize(session.read_buffer_size));
        }

        if session.poll_interval_ms < 1 || session.poll_interval_ms > 1000 {
            return Err(ConfigError::InvalidPollInterval(session.poll_interval_ms));
        }

        if session.join_timeout_ms < 1 || session.join_timeout_ms > 60_000 {
            return Err(ConfigError::InvalidJoinTimeout(session.join_timeout_ms));
        }

        if session.client_buffer == 0 {
            return Err(ConfigError::InvalidClientBuffer);
        }

        let timeout = self.runtime.command_timeout_secs;
        if !(1..=600).contains(&timeout) {
            return Err(ConfigError::InvalidCommandTimeout(timeout));
        }

        if let Some((name, _)) = self.labs.iter().find(|(_, lab)| lab.roles.is_empty()) {
            return Err(ConfigError::EmptyLabRoles(name.clone()));
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

    /// Container serving `role` in `lab`, honoring the override map.
    pub fn container_name(&self, role: &str, lab: &str) -> String {
        self.runtime
            .container_names
            .get(role)
            .cloned()
            .unwrap_or_else(|| format!("{}-{}", role, lab))
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
