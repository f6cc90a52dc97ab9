//! Configuration management for the Render Stats daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/render-stats/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default URL of the public IP echo service.
pub const DEFAULT_PUBLIC_IP_URL: &str = "https://api64.ipify.org?format=json";

/// Default listening port.
pub const DEFAULT_PORT: u16 = 8080;

/// Smallest accepted listen backlog.
pub const MIN_BACKLOG: i32 = 5;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("backlog must be at least 5, got {0}")]
    InvalidBacklog(i32),

    #[error("poll_interval_ms must be between 1 and 1000, got {0}")]
    InvalidPollInterval(u64),

    #[error("read_timeout_ms must be between 1 and 10000, got {0}")]
    InvalidReadTimeout(u64),

    #[error("max_request_bytes must be at least 256, got {0}")]
    InvalidMaxRequestBytes(usize),

    #[error("max_accepts_per_tick must be greater than 0")]
    InvalidMaxAccepts,

    #[error("discovery_timeout_ms must be between 1 and 30000, got {0}")]
    InvalidDiscoveryTimeout(u64),

    #[error("public_ip_timeout_ms must be between 1 and 30000, got {0}")]
    InvalidPublicIpTimeout(u64),

    #[error("public_ip_url must start with http:// or https://, got {0}")]
    InvalidPublicIpUrl(String),

    #[error("log_capacity must be greater than 0")]
    InvalidLogCapacity,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Render Stats daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Listening socket and poller configuration.
    pub server: ServerConfig,

    /// Port mapping and public address discovery.
    pub nat: NatConfig,

    /// Host firewall handling.
    pub firewall: FirewallConfig,

    /// Progress and log retention.
    pub stats: StatsConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for generated artifacts (QR images).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Listening socket and poller configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP port to listen on. `0` picks an ephemeral port.
    pub port: u16,

    /// Listen backlog.
    pub backlog: i32,

    /// Delay between poller ticks, in milliseconds.
    pub poll_interval_ms: u64,

    /// Per-connection read timeout, in milliseconds.
    pub read_timeout_ms: u64,

    /// Largest request head accepted before the connection is answered.
    pub max_request_bytes: usize,

    /// Connections accepted per poller tick.
    pub max_accepts_per_tick: usize,
}

/// Port mapping and public address discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NatConfig {
    /// Try to map the port on the LAN gateway via UPnP.
    pub upnp_enabled: bool,

    /// Gateway discovery timeout, in milliseconds.
    pub discovery_timeout_ms: u64,

    /// Mapping lease in seconds (0 = until removed).
    pub lease_secs: u32,

    /// Description attached to the mapping on the gateway.
    pub description: String,

    /// IP echo service used when mapping fails.
    pub public_ip_url: String,

    /// Timeout of the IP echo request, in milliseconds.
    pub public_ip_timeout_ms: u64,
}

/// Host firewall handling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FirewallConfig {
    /// Add and remove an inbound allow rule around the server lifetime.
    pub enabled: bool,

    /// Name of the rule where the platform tool supports one.
    pub rule_name: String,
}

/// Progress and log retention.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StatsConfig {
    /// Characters of job log retained for the viewer.
    pub log_capacity: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            backlog: MIN_BACKLOG,
            poll_interval_ms: 100,
            read_timeout_ms: 1000,
            max_request_bytes: 8 * 1024,
            max_accepts_per_tick: 8,
        }
    }
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            upnp_enabled: true,
            discovery_timeout_ms: 2000,
            lease_secs: 0,
            description: "Render Stats".to_string(),
            public_ip_url: DEFAULT_PUBLIC_IP_URL.to_string(),
            public_ip_timeout_ms: 5000,
        }
    }
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rule_name: "Render Stats".to_string(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            log_capacity: crate::stats::DEFAULT_LOG_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Poller re-arm interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Per-connection read timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl NatConfig {
    /// Gateway discovery timeout.
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    /// IP echo request timeout.
    pub fn public_ip_timeout(&self) -> Duration {
        Duration::from_millis(self.public_ip_timeout_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("render-stats")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("render-stats")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - RENDER_STATS_PORT: Override the listening port
    /// - RENDER_STATS_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("RENDER_STATS_PORT") {
            if !port.is_empty() {
                match port.parse::<u16>() {
                    Ok(port) => {
                        tracing::info!("Overriding port from environment: {}", port);
                        self.server.port = port;
                    }
                    Err(_) => {
                        tracing::warn!("Ignoring invalid RENDER_STATS_PORT value: {}", port);
                    }
                }
            }
        }

        if let Ok(level) = std::env::var("RENDER_STATS_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let server = &self.server;
        if server.backlog < MIN_BACKLOG {
            return Err(ConfigError::InvalidBacklog(server.backlog));
        }
        if !(1..=1000).contains(&server.poll_interval_ms) {
            return Err(ConfigError::InvalidPollInterval(server.poll_interval_ms));
        }
        if !(1..=10_000).contains(&server.read_timeout_ms) {
            return Err(ConfigError::InvalidReadTimeout(server.read_timeout_ms));
        }
        if server.max_request_bytes < 256 {
            return Err(ConfigError::InvalidMaxRequestBytes(server.max_request_bytes));
        }
        if server.max_accepts_per_tick == 0 {
            return Err(ConfigError::InvalidMaxAccepts);
        }

        let nat = &self.nat;
        if !(1..=30_000).contains(&nat.discovery_timeout_ms) {
            return Err(ConfigError::InvalidDiscoveryTimeout(nat.discovery_timeout_ms));
        }
        if !(1..=30_000).contains(&nat.public_ip_timeout_ms) {
            return Err(ConfigError::InvalidPublicIpTimeout(nat.public_ip_timeout_ms));
        }
        let url = &nat.public_ip_url;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigError::InvalidPublicIpUrl(url.clone()));
        }

        if self.stats.log_capacity == 0 {
            return Err(ConfigError::InvalidLogCapacity);
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
