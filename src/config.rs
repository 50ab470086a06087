//! Relay Server Configuration
//!
//! Configuration loaded from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::storage::StorageBackend;

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the relay accepts clients on.
    pub listen_addr: SocketAddr,
    /// Address of the HTTP health/metrics listener.
    pub admin_addr: SocketAddr,
    /// Bearer token required for `/metrics` and `/conversations`. None disables the check.
    pub admin_token: Option<String>,
    /// Maximum concurrent connections. Zero means unlimited.
    pub max_connections: usize,
    /// Maximum frame size in bytes, terminator excluded.
    pub max_frame_size: usize,
    /// Storage backend (memory or sqlite).
    pub storage_backend: StorageBackend,
    /// Data directory for persistent storage.
    pub data_dir: PathBuf,
    /// Idle timeout in seconds. Zero disables it.
    pub idle_timeout_secs: u64,
    /// Time allowed for the handshake frame in seconds. Zero disables it.
    pub handshake_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 65432)),
            admin_addr: SocketAddr::from(([127, 0, 0, 1], 65433)),
            admin_token: None,
            max_connections: 0,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            storage_backend: StorageBackend::Sqlite,
            data_dir: PathBuf::from("./data"),
            idle_timeout_secs: 0,
            handshake_timeout_secs: 0,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl RelayConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(addr) = env_parse("RELAY_LISTEN_ADDR") {
            config.listen_addr = addr;
        }

        if let Some(addr) = env_parse("RELAY_ADMIN_ADDR") {
            config.admin_addr = addr;
        }

        if let Ok(token) = std::env::var("RELAY_ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        if let Some(val) = env_parse("RELAY_MAX_CONNECTIONS") {
            config.max_connections = val;
        }

        if let Some(val) = env_parse("RELAY_MAX_FRAME_SIZE") {
            config.max_frame_size = val;
        }

        if let Ok(val) = std::env::var("RELAY_STORAGE_BACKEND") {
            config.storage_backend = match val.to_lowercase().as_str() {
                "memory" => StorageBackend::Memory,
                _ => StorageBackend::Sqlite,
            };
        }

        if let Ok(val) = std::env::var("RELAY_DATA_DIR") {
            config.data_dir = PathBuf::from(val);
        }

        if let Some(val) = env_parse("RELAY_IDLE_TIMEOUT") {
            config.idle_timeout_secs = val;
        }

        if let Some(val) = env_parse("RELAY_HANDSHAKE_TIMEOUT") {
            config.handshake_timeout_secs = val;
        }

        config
    }

    /// Returns the idle timeout, if enabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.idle_timeout_secs)
    }

    /// Returns the handshake timeout, if enabled.
    pub fn handshake_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.handshake_timeout_secs)
    }

    /// Returns the connection cap, if enabled.
    pub fn connection_cap(&self) -> Option<usize> {
        (self.max_connections > 0).then_some(self.max_connections)
    }
}
