//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::ApiConfig;
use crate::websocket::HubConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub websocket: WebSocketConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            cors_origins: self.cors_origins.clone(),
            ..ApiConfig::new(self.host.clone(), self.port)
        }
    }
}

/// WebSocket hub configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Outbound messages queued per connection before it is dropped
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_session: usize,

    /// Largest inbound frame (bytes)
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,

    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Header carrying the authenticated user id
    #[serde(default = "default_identity_header")]
    pub identity_header: String,
}

fn default_max_connections() -> usize {
    10_000
}

fn default_mailbox_capacity() -> usize {
    256
}

fn default_max_subscriptions() -> usize {
    64
}

fn default_max_message_size() -> usize {
    512
}

fn default_ping_interval() -> u64 {
    54
}

fn default_pong_timeout() -> u64 {
    60
}

fn default_write_timeout() -> u64 {
    10
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_identity_header() -> String {
    "x-user-id".to_string()
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            mailbox_capacity: default_mailbox_capacity(),
            max_subscriptions_per_session: default_max_subscriptions(),
            max_message_size: default_max_message_size(),
            ping_interval_secs: default_ping_interval(),
            pong_timeout_secs: default_pong_timeout(),
            write_timeout_secs: default_write_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            identity_header: default_identity_header(),
        }
    }
}

impl WebSocketConfig {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            max_connections: self.max_connections,
            mailbox_capacity: self.mailbox_capacity,
            max_subscriptions: self.max_subscriptions_per_session,
            max_message_size: self.max_message_size,
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            pong_timeout: Duration::from_secs(self.pong_timeout_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
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

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
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
        config.validate()?;
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Result<Self, ConfigError> {
        // Try default config locations
        let config_paths = [
            dirs::config_dir().map(|p| p.join("devicestream").join("config.toml")),
            Some(PathBuf::from("/etc/devicestream/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load_with_env(path);
            }
        }

        // Fall back to environment-only config
        let config = Self::from_env();
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the hub cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ws = &self.websocket;
        let non_zero = [
            ("websocket.max_connections", ws.max_connections as u64),
            ("websocket.mailbox_capacity", ws.mailbox_capacity as u64),
            (
                "websocket.max_subscriptions_per_session",
                ws.max_subscriptions_per_session as u64,
            ),
            ("websocket.max_message_size", ws.max_message_size as u64),
            ("websocket.ping_interval_secs", ws.ping_interval_secs),
            ("websocket.pong_timeout_secs", ws.pong_timeout_secs),
            ("websocket.write_timeout_secs", ws.write_timeout_secs),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
        }

        if ws.identity_header.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "websocket.identity_header must not be empty".to_string(),
            ));
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(ConfigError::Invalid(format!(
                "logging.format must be \"pretty\" or \"json\", got {:?}",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Values that fail to parse are ignored.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        // Server overrides
        if let Some(host) = lookup("DEVICESTREAM_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("DEVICESTREAM_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }

        // WebSocket overrides
        if let Some(max) = lookup("DEVICESTREAM_MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
            self.websocket.max_connections = max;
        }
        if let Some(capacity) =
            lookup("DEVICESTREAM_MAILBOX_CAPACITY").and_then(|v| v.parse().ok())
        {
            self.websocket.mailbox_capacity = capacity;
        }

        // Logging overrides
        if let Some(level) = lookup("DEVICESTREAM_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("DEVICESTREAM_LOG_FORMAT") {
            self.logging.format = format;
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

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# DeviceStream Configuration
#
# Environment variables override these settings:
# - DEVICESTREAM_HOST
# - DEVICESTREAM_PORT
# - DEVICESTREAM_MAX_CONNECTIONS
# - DEVICESTREAM_MAILBOX_CAPACITY
# - DEVICESTREAM_LOG_LEVEL
# - DEVICESTREAM_LOG_FORMAT

[server]
# HTTP server host
host = "0.0.0.0"

# HTTP server port
port = 8080

# Allowed CORS origins (empty allows any)
cors_origins = []

[websocket]
# Maximum concurrent connections
max_connections = 10000

# Outbound messages queued per connection before a slow client is dropped
mailbox_capacity = 256

# Maximum device subscriptions per connection
max_subscriptions_per_session = 64

# Largest inbound message (bytes)
max_message_size = 512

# Ping quiet connections this often (seconds)
ping_interval_secs = 54

# Drop connections silent for this long (seconds)
pong_timeout_secs = 60

# Deadline for a single outbound write (seconds)
write_timeout_secs = 10

# How long shutdown waits for connections to close (seconds)
shutdown_timeout_secs = 5

# Header carrying the authenticated user id
identity_header = "x-user-id"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
