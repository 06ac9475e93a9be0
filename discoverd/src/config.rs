use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::{DEFAULT_KEY_PREFIX, MISSED_HEARTBEAT_TTL_SECS};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Lifetime of a registration without heartbeats
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
    /// How often expired registrations are reaped
    #[serde(default = "default_expiry_interval")]
    pub expiry_interval_ms: u64,
    /// Store events buffered per watcher before it is considered lagging
    #[serde(default = "default_watch_capacity")]
    pub watch_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Interval of SSE keep-alive comments on subscribe streams
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/discover/registry.db")
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_ttl() -> u64 {
    MISSED_HEARTBEAT_TTL_SECS
}

fn default_expiry_interval() -> u64 {
    500
}

fn default_watch_capacity() -> usize {
    1024
}

fn default_listen() -> String {
    "0.0.0.0:1112".to_string()
}

fn default_keep_alive() -> u64 {
    15
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            key_prefix: default_key_prefix(),
            ttl_secs: default_ttl(),
            expiry_interval_ms: default_expiry_interval(),
            watch_capacity: default_watch_capacity(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            keep_alive_secs: default_keep_alive(),
        }
    }
}

impl StoreConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn expiry_interval(&self) -> Duration {
        Duration::from_millis(self.expiry_interval_ms)
    }
}

impl ApiConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Like `load`, but a missing file yields the defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }
}
