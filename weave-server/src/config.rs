use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use weave_collab::{RegistryConfig, ServerConfig, MAX_RECONSTRUCT_DEPTH};

/// Process configuration, read from `.env` and the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Interface both listeners bind to (default: 127.0.0.1)
    pub host: String,
    /// WebSocket sync port (default: 9090)
    pub sync_port: u16,
    /// HTTP API port (default: 9091)
    pub api_port: u16,
    /// RocksDB directory. Unset keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// JSON file with users, folders and projects.
    pub directory_file: Option<PathBuf>,
    pub grace_period: Duration,
    pub max_peers_per_room: usize,
    pub broadcast_capacity: usize,
    /// Zero disables heartbeat pings.
    pub heartbeat_secs: u64,
    pub max_reconstruct_depth: usize,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

impl Default for Config {
    fn default() -> Self {
        let registry = RegistryConfig::default();
        let server = ServerConfig::default();
        Self {
            host: "127.0.0.1".to_string(),
            sync_port: 9090,
            api_port: 9091,
            data_dir: None,
            directory_file: None,
            grace_period: registry.grace_period,
            max_peers_per_room: server.max_peers_per_room,
            broadcast_capacity: registry.broadcast_capacity,
            heartbeat_secs: server.heartbeat_interval_secs,
            max_reconstruct_depth: MAX_RECONSTRUCT_DEPTH,
        }
    }
}

impl Config {
    /// Load `.env` if present, then read the `WEAVE_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let path = |key: &str| lookup(key).filter(|v| !v.is_empty()).map(PathBuf::from);

        Ok(Self {
            host: lookup("WEAVE_HOST").unwrap_or(defaults.host),
            sync_port: parse(&lookup, "WEAVE_SYNC_PORT", defaults.sync_port)?,
            api_port: parse(&lookup, "WEAVE_API_PORT", defaults.api_port)?,
            data_dir: path("WEAVE_DATA_DIR"),
            directory_file: path("WEAVE_DIRECTORY_FILE"),
            grace_period: Duration::from_secs(parse(
                &lookup,
                "WEAVE_GRACE_PERIOD_SECS",
                defaults.grace_period.as_secs(),
            )?),
            max_peers_per_room: parse(&lookup, "WEAVE_MAX_PEERS_PER_ROOM", defaults.max_peers_per_room)?,
            broadcast_capacity: parse(&lookup, "WEAVE_BROADCAST_CAPACITY", defaults.broadcast_capacity)?,
            heartbeat_secs: parse(&lookup, "WEAVE_HEARTBEAT_SECS", defaults.heartbeat_secs)?,
            max_reconstruct_depth: parse(
                &lookup,
                "WEAVE_MAX_RECONSTRUCT_DEPTH",
                defaults.max_reconstruct_depth,
            )?,
        })
    }

    pub fn sync_addr(&self) -> String {
        format!("{}:{}", self.host, self.sync_port)
    }

    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.host, self.api_port)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.sync_addr(),
            max_peers_per_room: self.max_peers_per_room,
            heartbeat_interval_secs: self.heartbeat_secs,
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            grace_period: self.grace_period,
            broadcast_capacity: self.broadcast_capacity,
            ..RegistryConfig::default()
        }
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}
