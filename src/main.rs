//! tcpmgr - TCP Connection Manager demo server
//!
//! Listens for peers, prints whatever they send and broadcasts a numbered
//! message to all of them at a fixed interval until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tcpmgr::{
    config::ConfigManager,
    shutdown::ShutdownAwareTask,
    ConnectionManager, DataArrived, ShutdownCoordinator, TcpServer,
};

/// CLI arguments for tcpmgr
#[derive(Parser, Debug)]
#[command(name = "tcpmgr")]
#[command(about = "tcpmgr - TCP connection manager demo server")]
#[command(version)]
#[command(long_about = "
tcpmgr - TCP connection manager demo server

Accepts TCP peers, prints the bytes they send and periodically broadcasts
a numbered message to every connected peer.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  TCPMGR_BIND_ADDR         - Listen address (e.g., 127.0.0.1 or ::1)
  TCPMGR_PORT              - Listen port
  TCPMGR_POLL_INTERVAL     - Accept/read poll interval (e.g., 2s, 500ms)
  TCPMGR_READ_BUFFER_SIZE  - Read buffer size in bytes
  TCPMGR_LOG_LEVEL         - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "config.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Listen address (overrides config file)
    #[arg(short, long, help = "Listen address (e.g., 127.0.0.1 or ::1)")]
    pub bind: Option<String>,

    /// Port to listen on (overrides config file)
    #[arg(short, long, help = "Port to listen on")]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error); overrides config file
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Seconds between broadcast messages
    #[arg(long, help = "Seconds between broadcast messages")]
    pub broadcast_interval: Option<u64>,

    /// Connect a client to our own listener after start-up
    #[arg(long, help = "Connect a client to our own listener")]
    pub self_connect: bool,

    /// Do not print received data
    #[arg(short, long, help = "Do not print received data")]
    pub quiet_data: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,

    /// Print connection metrics on shutdown
    #[arg(long, help = "Print connection metrics on shutdown")]
    pub print_metrics: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Load configuration with priority: CLI args > config file > environment > defaults.
    let config_exists = args.config.exists();
    let mut config = if config_exists {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };

    init_tracing(
        config
            .logging
            .effective_level(args.log_level.as_deref(), args.verbose),
    )?;

    info!("Starting tcpmgr v{}", env!("CARGO_PKG_VERSION"));
    if config_exists {
        info!("Loaded configuration from {}", args.config.display());
    } else {
        info!("Config file not found, using environment variables and defaults");
    }

    config.merge_with_cli_args(
        args.bind.as_deref(),
        args.port,
        args.broadcast_interval,
        args.self_connect,
        args.quiet_data,
    );

    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("Configuration summary:");
        info!("  Listen address: {}:{}", config.server.bind_addr, config.server.port);
        info!("  Poll interval: {:?}", config.manager.poll_interval);
        info!("  Read buffer: {} bytes", config.manager.read_buffer_size);
        info!("  Broadcast interval: {:?}", config.server.broadcast_interval);
        info!(
            "  Broadcast failure limit: {}",
            config.server.broadcast_failure_limit
        );
        return Ok(());
    }

    let shutdown_coordinator = ShutdownCoordinator::new(config.manager.shutdown_timeout);
    let manager = ConnectionManager::new(config.manager.clone())?;

    if config.logging.print_received_data {
        let weak = manager.downgrade();
        manager.events().new_connection.connect(move |identity| {
            let manager = match weak.upgrade() {
                Some(manager) => manager,
                None => return,
            };
            manager.subscribe_data(identity, print_data);
        });
    }

    let mut server = TcpServer::new(manager.clone())
        .with_failure_limit(config.server.broadcast_failure_limit);
    let listener = server
        .start(&config.server.bind_addr, config.server.port)
        .await
        .context("Failed to start server")?;
    let server = std::sync::Arc::new(server);

    let client = if config.server.self_connect {
        match manager
            .open_connection(listener.peer_ip(), listener.peer_port())
            .await
        {
            Ok(client) => {
                info!("Self-connected client {}", client);
                if config.logging.print_received_data {
                    manager.subscribe_data(&client, print_data);
                }
                Some(client)
            }
            Err(e) => {
                warn!("Self-connect failed: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    let broadcaster = {
        let server = std::sync::Arc::clone(&server);
        let interval = config.server.broadcast_interval;
        ShutdownAwareTask::spawn(&shutdown_coordinator, "broadcaster", move |shutdown| async move {
            let mut ticker = tokio::time::interval(interval);
            let mut counter: u64 = 0;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        counter += 1;
                        let message = format!("Message from server no.: {}", counter);
                        let delivered = server.broadcast(message.as_bytes()).await;
                        info!("Broadcast #{} delivered to {} peers", counter, delivered);
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    };

    info!("tcpmgr listening on {}", listener);
    info!("Press Ctrl+C or send SIGTERM/SIGINT to shutdown gracefully");

    if let Err(e) = shutdown_coordinator.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
        shutdown_coordinator.trigger();
    }

    info!("Initiating graceful shutdown...");

    if let Err(e) = broadcaster.join().await {
        error!("Broadcaster failed: {}", e);
    }

    if let Some(client) = client {
        manager.close_conn(&client);
    }
    drop(server);

    let result = shutdown_coordinator.shutdown_connection_manager(&manager).await;

    if args.print_metrics {
        match manager.metrics().render() {
            Ok(text) => println!("{}", text),
            Err(e) => warn!("Failed to render metrics: {}", e),
        }
    }

    info!("Server shutdown complete");
    result
}

fn print_data(event: &DataArrived) {
    info!(
        "Received from {}: {}",
        event.identity,
        String::from_utf8_lossy(&event.bytes)
    );
}

/// Initialize tracing/logging. `RUST_LOG` takes precedence over `log_level`.
fn init_tracing(log_level: &str) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
