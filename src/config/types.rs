//! Configuration Types

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub manager: ManagerConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

/// Connection manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Upper bound on every readiness wait in accept and read loops
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Size of the per-connection read buffer
    pub read_buffer_size: usize,
    pub listen_backlog: u32,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub accept_backoff_initial: Duration,
    #[serde(with = "humantime_serde")]
    pub accept_backoff_max: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Server façade configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    #[serde(with = "humantime_serde")]
    pub broadcast_interval: Duration,
    /// Consecutive failed broadcast writes before a peer is untracked (0 = never)
    pub broadcast_failure_limit: u32,
    /// Open a client connection to our own listener after start-up
    pub self_connect: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    pub print_received_data: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            read_buffer_size: 1024,
            listen_backlog: 1024,
            connect_timeout: Duration::from_secs(10),
            accept_backoff_initial: Duration::from_millis(50),
            accept_backoff_max: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 12301,
            broadcast_interval: Duration::from_secs(1),
            broadcast_failure_limit: 3,
            self_connect: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            print_received_data: true,
        }
    }
}
