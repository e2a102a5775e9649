//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::client::ReconnectPolicy;
use crate::governor::GovernorConfig;
use crate::websocket::{DeliveryMode, HubConfig};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub governor: GovernorConfig,

    #[serde(default)]
    pub hub: HubConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Relay server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3567
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    /// Create config with custom host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Get the socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Terminal client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Name of the saved-session slot
    #[serde(default = "default_profile")]
    pub profile: String,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

fn default_server_url() -> String {
    "ws://localhost:3567/ws".to_string()
}

fn default_profile() -> String {
    "default".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            profile: default_profile(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("parley").join("config.toml")),
            Some(PathBuf::from("/etc/parley/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from any variable source
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("PARLEY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = parsed(&lookup, "PARLEY_PORT").or_else(|| parsed(&lookup, "PORT")) {
            self.server.port = port;
        }

        if let Some(max) = parsed(&lookup, "MAX_CONNECTIONS_PER_IP") {
            self.governor.max_connections_per_ip = max;
        }
        if let Some(attempts) = parsed(&lookup, "AUTH_ATTEMPTS_PER_MIN") {
            self.governor.auth_attempts_per_minute = attempts;
        }

        if let Some(delivery) = parsed::<DeliveryMode, _>(&lookup, "PARLEY_DELIVERY") {
            self.hub.delivery = delivery;
        }

        if let Some(url) = lookup("PARLEY_SERVER_URL") {
            self.client.server_url = url;
        }

        if let Some(level) = lookup("PARLEY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("PARLEY_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Read and parse one variable; unparsable values are ignored
fn parsed<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(variable = name, value = %raw, error = %e, "Ignoring invalid environment value");
            None
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Parley Configuration
#
# Environment variables override these settings:
# - PARLEY_HOST
# - PARLEY_PORT (or PORT)
# - MAX_CONNECTIONS_PER_IP
# - AUTH_ATTEMPTS_PER_MIN
# - PARLEY_DELIVERY
# - PARLEY_SERVER_URL
# - PARLEY_LOG_LEVEL
# - PARLEY_LOG_FORMAT

[server]
# Relay host
host = "0.0.0.0"

# Relay port
port = 3567

[governor]
# Simultaneously open connections allowed per source address
max_connections_per_ip = 10

# Authentication attempts allowed per address inside one window
auth_attempts_per_minute = 5

# Authentication window (seconds)
window_secs = 60

# How often stale attempts are pruned (seconds)
sweep_interval_secs = 60

[hub]
# Outbound queue depth per connection; a connection that falls this far
# behind is dropped
queue_capacity = 256

# scoped: conversation traffic goes to its participants only
# global: every connection receives everything
delivery = "scoped"

[client]
# Relay URL used by the terminal client
server_url = "ws://localhost:3567/ws"

# Saved-session slot
profile = "default"

[client.reconnect]
# Consecutive failures before giving up
max_attempts = 5

# Backoff grows by this much per failure (ms)
backoff_step_ms = 1000

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
