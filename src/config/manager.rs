//! Configuration Manager

use super::{Config, LoggingConfig, ManagerConfig};
use crate::net::make_sock_addr;
use crate::Result;
use anyhow::{bail, Context};
use std::path::Path;
use std::time::Duration;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();

        if let Ok(bind_addr) = std::env::var("TCPMGR_BIND_ADDR") {
            config.server.bind_addr = bind_addr;
        }

        if let Ok(port) = std::env::var("TCPMGR_PORT") {
            config.server.port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid TCPMGR_PORT: {}", port))?;
        }

        if let Ok(interval) = std::env::var("TCPMGR_POLL_INTERVAL") {
            config.manager.poll_interval = humantime::parse_duration(&interval)
                .with_context(|| format!("Invalid TCPMGR_POLL_INTERVAL: {}", interval))?;
        }

        if let Ok(buffer_size) = std::env::var("TCPMGR_READ_BUFFER_SIZE") {
            config.manager.read_buffer_size = buffer_size
                .parse::<usize>()
                .with_context(|| format!("Invalid TCPMGR_READ_BUFFER_SIZE: {}", buffer_size))?;
        }

        if let Ok(log_level) = std::env::var("TCPMGR_LOG_LEVEL") {
            config.logging.log_level = log_level;
        }

        config.validate()?;
        Ok(config)
    }
}

impl ManagerConfig {
    /// Check that every manager setting is usable.
    ///
    /// `ConnectionManager::new` calls this, so a zero buffer or poll interval
    /// never reaches the loops.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            bail!("poll_interval must be greater than 0");
        }

        if self.poll_interval > Duration::from_secs(60) {
            bail!("poll_interval cannot exceed 60 seconds");
        }

        if self.read_buffer_size < 64 {
            bail!("read_buffer_size must be at least 64 bytes");
        }

        if self.read_buffer_size > 1048576 {
            bail!("read_buffer_size cannot exceed 1MB");
        }

        if self.listen_backlog == 0 {
            bail!("listen_backlog must be greater than 0");
        }

        if self.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }

        if self.accept_backoff_initial.is_zero() {
            bail!("accept_backoff_initial must be greater than 0");
        }

        if self.accept_backoff_initial > self.accept_backoff_max {
            bail!("accept_backoff_initial cannot exceed accept_backoff_max");
        }

        if self.shutdown_timeout.is_zero() {
            bail!("shutdown_timeout must be greater than 0");
        }

        Ok(())
    }
}

impl LoggingConfig {
    /// Log level to filter with when `RUST_LOG` is unset.
    ///
    /// `--verbose` wins over `--log-level`, which wins over the configured level.
    pub fn effective_level<'a>(&'a self, cli_level: Option<&'a str>, verbose: bool) -> &'a str {
        if verbose {
            "debug"
        } else {
            cli_level.unwrap_or(self.log_level.as_str())
        }
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.manager
            .validate()
            .with_context(|| "Manager configuration validation failed")?;

        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_logging_config()
            .with_context(|| "Logging configuration validation failed")?;

        Ok(())
    }

    /// Validate server configuration
    fn validate_server_config(&self) -> Result<()> {
        make_sock_addr(&self.server.bind_addr, self.server.port)
            .with_context(|| format!("server.bind_addr '{}' is not a valid address", self.server.bind_addr))?;

        if self.server.broadcast_interval.is_zero() {
            bail!("broadcast_interval must be greater than 0");
        }

        Ok(())
    }

    /// Validate logging configuration
    fn validate_logging_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.log_level.as_str()) {
            bail!(
                "logging.log_level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        bind: Option<&str>,
        port: Option<u16>,
        broadcast_interval: Option<u64>,
        self_connect: bool,
        quiet_data: bool,
    ) {
        if let Some(bind_addr) = bind {
            self.server.bind_addr = bind_addr.to_string();
            tracing::info!("CLI override: bind address set to {}", bind_addr);
        }

        if let Some(port) = port {
            self.server.port = port;
            tracing::info!("CLI override: port set to {}", port);
        }

        if let Some(interval_secs) = broadcast_interval {
            self.server.broadcast_interval = Duration::from_secs(interval_secs);
            tracing::info!("CLI override: broadcast interval set to {}s", interval_secs);
        }

        if self_connect {
            self.server.self_connect = true;
            tracing::info!("CLI override: self-connect enabled");
        }

        if quiet_data {
            self.logging.print_received_data = false;
            tracing::info!("CLI override: received data printing disabled");
        }
    }
}
