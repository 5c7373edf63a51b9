//! Graceful Shutdown Handling
//!
//! Waits for SIGTERM/SIGINT, cancels a shared token that background tasks
//! watch, and stops the connection manager within a bounded time.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionManager;
use crate::Result;

/// Owns the process-wide shutdown token and the manager stop deadline
pub struct ShutdownCoordinator {
    token: CancellationToken,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            timeout,
        }
    }

    /// Token cancelled once shutdown is requested
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Request shutdown. Calling it again has no effect.
    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            debug!("Shutdown requested");
        }
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for SIGTERM, SIGINT, Ctrl+C or a manual `trigger`, then make
    /// sure shutdown is requested.
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal as unix_signal, SignalKind};

            let mut sigterm = unix_signal(SignalKind::terminate())?;
            let mut sigint = unix_signal(SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
                _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
                _ = signal::ctrl_c() => info!("Received Ctrl+C, initiating graceful shutdown"),
                _ = self.token.cancelled() => debug!("Shutdown triggered internally"),
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                res = signal::ctrl_c() => {
                    res?;
                    info!("Received Ctrl+C, initiating graceful shutdown");
                }
                _ = self.token.cancelled() => debug!("Shutdown triggered internally"),
            }
        }

        self.trigger();
        Ok(())
    }

    /// Stop the connection manager, giving up after the configured timeout.
    ///
    /// Also triggers shutdown so every task watching the token winds down.
    pub async fn shutdown_connection_manager(&self, manager: &ConnectionManager) -> Result<()> {
        self.trigger();

        let started = Instant::now();
        info!(
            "Closing {} connections (timeout: {:?})",
            manager.connection_count(),
            self.timeout
        );

        match tokio::time::timeout(self.timeout, manager.stop()).await {
            Ok(Ok(())) => {
                info!("Connection manager stopped in {:?}", started.elapsed());
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Connection manager failed to stop cleanly: {:#}", e);
                Err(e)
            }
            Err(_) => {
                warn!(
                    "Shutdown timeout reached with {} background tasks still running",
                    manager.active_tasks()
                );
                anyhow::bail!("connection manager did not stop within {:?}", self.timeout)
            }
        }
    }
}

/// A named task that is handed the shutdown token when spawned
pub struct ShutdownAwareTask {
    name: String,
    handle: JoinHandle<()>,
}

impl ShutdownAwareTask {
    pub fn spawn<F, Fut>(coordinator: &ShutdownCoordinator, name: &str, task_fn: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.to_string();
        let task = task_fn(coordinator.token());
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            debug!("Starting task: {}", task_name);
            task.await;
            debug!("Task finished: {}", task_name);
        });

        Self { name, handle }
    }

    /// Wait for the task to return. A panic inside it is reported as an error.
    pub async fn join(self) -> Result<()> {
        match self.handle.await {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => {
                debug!("Task {} was cancelled", self.name);
                Ok(())
            }
            Err(e) => {
                error!("Task {} failed: {}", self.name, e);
                anyhow::bail!("task {} failed: {}", self.name, e)
            }
        }
    }
}
