//! Configuration management.
//!
//! Values come from an optional config file overlaid with `SPEEDLINE__*`
//! environment variables, e.g. `SPEEDLINE__SERVER__PORT=9000` or
//! `SPEEDLINE__STORAGE__BACKEND=postgres`.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::telemetry::{LoggingConfig, MetricsConfig};

const ENV_PREFIX: &str = "SPEEDLINE";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Document storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Reconciliation configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// Push channel configuration
    #[serde(default)]
    pub websocket: WebSocketConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Which [`crate::store::DocumentStore`] backs the service.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    File,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Storage backend
    #[serde(default)]
    pub backend: StorageBackend,

    /// State file for the `file` backend
    #[serde(default = "default_state_path")]
    pub path: PathBuf,

    /// PostgreSQL connection URL (falls back to `DATABASE_URL`)
    #[serde(default)]
    pub url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// How long to wait for a pooled connection
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_state_path(),
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

impl StorageConfig {
    /// The configured database URL, or `DATABASE_URL` from the environment.
    ///
    /// Heroku-style `postgres://` URLs are accepted as-is.
    pub fn database_url(&self) -> Option<String> {
        self.url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .or_else(|| std::env::var("DATABASE_URL").ok())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// How many versions a client may trail before its update is rejected
    #[serde(default = "default_staleness_threshold")]
    pub staleness_threshold: u64,

    /// Storage retry policy
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            staleness_threshold: default_staleness_threshold(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            multiplier: default_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// Buffered snapshots per subscriber before it starts skipping
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Per-message send deadline; slower connections are dropped
    #[serde(default = "default_send_timeout", with = "humantime_serde")]
    pub send_timeout: Duration,

    /// Maximum inbound message size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            send_timeout: default_send_timeout(),
            max_message_size: default_max_message_size(),
        }
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_state_path() -> PathBuf { PathBuf::from("./speedline_state.json") }
fn default_max_connections() -> u32 { 10 }
fn default_min_connections() -> u32 { 1 }
fn default_acquire_timeout() -> Duration { Duration::from_secs(5) }
fn default_staleness_threshold() -> u64 { 5 }
fn default_max_attempts() -> u32 { 3 }
fn default_initial_backoff() -> Duration { Duration::from_millis(100) }
fn default_max_backoff() -> Duration { Duration::from_secs(2) }
fn default_multiplier() -> f64 { 2.0 }
fn default_channel_capacity() -> usize { 64 }
fn default_send_timeout() -> Duration { Duration::from_secs(5) }
fn default_max_message_size() -> usize { 1024 * 1024 }

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides on top.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Address the HTTP server binds to.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
