//! Server configuration.
//!
//! Configuration is loaded from, in increasing priority:
//! - Built-in defaults
//! - A TOML file (explicit path, or the first of the default locations)
//! - Environment variables (`PARLEY_PORT`, `PARLEY_BROKER__URL`, ...)

use anyhow::{ensure, Context, Result};
use parley_broker::RedisConfig;
use parley_core::{EngineConfig, RoomConfig, StoreConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

const DEFAULT_PATHS: [&str; 3] = [
    "parley.toml",
    "/etc/parley/parley.toml",
    "~/.config/parley/parley.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub chat: ChatConfig,

    #[serde(default)]
    pub presence: PresenceConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Broker backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    #[default]
    Redis,
    /// In-process broker. Single node only.
    Memory,
}

/// Broker connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub kind: BrokerKind,

    #[serde(default = "default_broker_url")]
    pub url: String,

    /// Per-command timeout in milliseconds.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,

    /// Connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

/// Messaging limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Approximate number of entries kept per conversation log.
    #[serde(default = "default_log_max_len")]
    pub log_max_len: usize,

    #[serde(default = "default_history_limit")]
    pub history_default_limit: usize,

    #[serde(default = "default_history_max")]
    pub history_max_limit: usize,

    /// Maximum message body size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    #[serde(default = "default_max_rooms")]
    pub max_rooms_per_connection: usize,

    /// Buffered events per room before slow receivers lag.
    #[serde(default = "default_room_capacity")]
    pub room_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Lifetime of presence markers in seconds.
    #[serde(default = "default_presence_ttl")]
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Retention of receipts and pending entries in seconds.
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Presence refresh interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,
}

/// Handshake token verification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret. Required to accept connections.
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// Required `iss` claim, if set.
    #[serde(default)]
    pub issuer: Option<String>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Prometheus listener port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_broker_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_command_timeout() -> u64 {
    5_000
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_log_max_len() -> usize {
    10_000
}

fn default_history_limit() -> usize {
    50
}

fn default_history_max() -> usize {
    500
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_rooms() -> usize {
    100
}

fn default_room_capacity() -> usize {
    1024
}

fn default_presence_ttl() -> u64 {
    3600
}

fn default_retention() -> u64 {
    86_400 // 24 hours
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            broker: BrokerConfig::default(),
            chat: ChatConfig::default(),
            presence: PresenceConfig::default(),
            delivery: DeliveryConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            auth: AuthConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::default(),
            url: default_broker_url(),
            command_timeout_ms: default_command_timeout(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            log_max_len: default_log_max_len(),
            history_default_limit: default_history_limit(),
            history_max_limit: default_history_max(),
            max_message_size: default_max_message_size(),
            max_rooms_per_connection: default_max_rooms(),
            room_capacity: default_room_capacity(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_presence_ttl(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or the default locations, then apply
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// override has the wrong type.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let base = match path {
            Some(path) => Self::from_file(shellexpand::tilde(path).as_ref())?,
            None => Self::discover()?,
        };
        base.with_env_overrides()
    }

    fn discover() -> Result<Self> {
        for path in &DEFAULT_PATHS {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Layer `PARLEY_*` environment variables over this configuration.
    /// Nested keys use `__`, e.g. `PARLEY_AUTH__JWT_SECRET`.
    ///
    /// # Errors
    ///
    /// Returns an error if an override cannot be deserialized.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_source(
            config::Environment::with_prefix("PARLEY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
    }

    fn with_source<S>(self, source: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let layered = config::Config::builder()
            .add_source(config::Config::try_from(&self).context("Failed to layer config")?)
            .add_source(source)
            .build()
            .context("Failed to read environment overrides")?;

        let config: Config = layered
            .try_deserialize()
            .context("Invalid configuration override")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.heartbeat.interval_ms > 0,
            "heartbeat.interval_ms must be greater than zero"
        );
        ensure!(
            self.presence.ttl_secs > 0,
            "presence.ttl_secs must be greater than zero"
        );
        ensure!(
            self.heartbeat_interval() < Duration::from_secs(self.presence.ttl_secs),
            "heartbeat.interval_ms ({}) must be shorter than presence.ttl_secs ({}s)",
            self.heartbeat.interval_ms,
            self.presence.ttl_secs
        );
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Settings for the messaging engine.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            store: StoreConfig {
                log_max_len: self.chat.log_max_len,
                history_default_limit: self.chat.history_default_limit,
                history_max_limit: self.chat.history_max_limit,
            },
            rooms: RoomConfig {
                max_rooms_per_connection: self.chat.max_rooms_per_connection,
                room_capacity: self.chat.room_capacity,
            },
            presence_ttl: Duration::from_secs(self.presence.ttl_secs),
            delivery_retention: Duration::from_secs(self.delivery.retention_secs),
            max_message_size: self.chat.max_message_size,
        }
    }

    #[must_use]
    pub fn redis_config(&self) -> RedisConfig {
        RedisConfig {
            url: self.broker.url.clone(),
            command_timeout: Duration::from_millis(self.broker.command_timeout_ms),
            connect_timeout: Duration::from_millis(self.broker.connect_timeout_ms),
        }
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat.interval_ms)
    }
}
