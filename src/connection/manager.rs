//! Connection Manager Implementation
//!
//! The manager is the single owner of every registered socket. Outbound
//! connections, listening sockets and accepted peers all live in one
//! handle-keyed registry; background accept and read loops only hold weak
//! references back to it and re-resolve connections by handle.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{bail, Context};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::AcceptBackoff;
use super::conn::{Connection, ConnectionRole, ReadLoop, Socket};
use super::tasks::TaskTracker;
use super::{ConnectionIdentity, SocketHandle};
use crate::config::ManagerConfig;
use crate::events::{DataArrived, EventBus, SubscriptionId};
use crate::metrics::ConnectionMetrics;
use crate::net::{self, IpVersion};
use crate::Result;

struct Shared {
    config: ManagerConfig,
    events: EventBus,
    metrics: Arc<ConnectionMetrics>,
    connections: Mutex<HashMap<SocketHandle, Arc<Connection>>>,
    tasks: TaskTracker,
    finishing: AtomicBool,
    shutdown: CancellationToken,
    next_handle: AtomicU64,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Manages TCP sockets, their background loops and lifecycle events.
///
/// Cloning is cheap and every clone refers to the same registry. Dropping the
/// last clone cancels every background loop.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

/// Non-owning reference to a [`ConnectionManager`]
#[derive(Clone)]
pub struct WeakConnectionManager {
    shared: Weak<Shared>,
}

impl WeakConnectionManager {
    /// Get the manager back if it is still alive
    pub fn upgrade(&self) -> Option<ConnectionManager> {
        self.shared.upgrade().map(|shared| ConnectionManager { shared })
    }
}

impl ConnectionManager {
    /// Create a new ConnectionManager.
    ///
    /// Must be called from within a tokio runtime; the task cleaner is
    /// spawned immediately. Fails if `config` does not pass
    /// [`ManagerConfig::validate`].
    pub fn new(config: ManagerConfig) -> Result<Self> {
        tokio::runtime::Handle::try_current()
            .context("connection manager must be created inside a tokio runtime")?;
        config
            .validate()
            .context("invalid connection manager configuration")?;

        let metrics = Arc::new(ConnectionMetrics::new()?);
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new(shutdown.clone());

        debug!(
            "Connection manager created (poll interval {:?}, read buffer {} bytes)",
            config.poll_interval, config.read_buffer_size
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                events: EventBus::new(),
                metrics,
                connections: Mutex::new(HashMap::new()),
                tasks,
                finishing: AtomicBool::new(false),
                shutdown,
                next_handle: AtomicU64::new(1),
            }),
        })
    }

    pub fn downgrade(&self) -> WeakConnectionManager {
        WeakConnectionManager {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    /// Lifecycle events published by this manager
    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    pub fn metrics(&self) -> &ConnectionMetrics {
        &self.shared.metrics
    }

    /// Whether `stop` has begun
    pub fn is_finishing(&self) -> bool {
        self.shared.finishing.load(Ordering::SeqCst)
    }

    /// Connect to `dest:port` and start reading from it
    pub async fn open_connection(&self, dest: &str, port: u16) -> Result<ConnectionIdentity> {
        self.connect(dest, port, None).await
    }

    /// Connect to `dest:port` from the fixed local endpoint `src:src_port`
    pub async fn open_connection_from(
        &self,
        dest: &str,
        port: u16,
        src: &str,
        src_port: u16,
    ) -> Result<ConnectionIdentity> {
        let source = net::make_sock_addr(src, src_port)
            .with_context(|| format!("invalid source address {}:{}", src, src_port))?;
        self.connect(dest, port, Some(source)).await
    }

    async fn connect(
        &self,
        dest: &str,
        port: u16,
        source: Option<SocketAddr>,
    ) -> Result<ConnectionIdentity> {
        self.ensure_running()?;

        if dest.is_empty() {
            bail!("destination address is empty");
        }

        let dest_addr = net::make_sock_addr(dest, port)
            .with_context(|| format!("invalid destination address {}:{}", dest, port))?;

        let stream = net::connect_stream(dest_addr, source, self.shared.config.connect_timeout)
            .await?;

        let identity =
            ConnectionIdentity::new(self.allocate_handle(), dest_addr.ip().to_string(), port);
        let conn = Connection::stream(
            identity.clone(),
            ConnectionRole::Outbound,
            stream,
            self.shared.shutdown.child_token(),
        );

        self.register(conn)?;
        self.shared.metrics.record_opened();
        info!("Opened connection {}", identity);

        self.start_reading(&identity);
        Ok(identity)
    }

    /// Bind and listen on `addr:port` and start accepting peers
    pub async fn open_listen_socket(&self, addr: &str, port: u16) -> Result<ConnectionIdentity> {
        self.listen(addr, port, None)
    }

    /// Like [`open_listen_socket`](Self::open_listen_socket), with `on_accept`
    /// subscribed to the listener's targeted signal before accepting starts.
    pub async fn open_listen_socket_with<F>(
        &self,
        addr: &str,
        port: u16,
        on_accept: F,
    ) -> Result<ConnectionIdentity>
    where
        F: Fn(&ConnectionIdentity) + Send + Sync + 'static,
    {
        self.listen(addr, port, Some(Box::new(on_accept)))
    }

    #[allow(clippy::type_complexity)]
    fn listen(
        &self,
        addr: &str,
        port: u16,
        on_accept: Option<Box<dyn Fn(&ConnectionIdentity) + Send + Sync>>,
    ) -> Result<ConnectionIdentity> {
        self.ensure_running()?;

        let bind_addr = net::make_sock_addr(addr, port)
            .with_context(|| format!("invalid listen address {}:{}", addr, port))?;
        let listener = net::bind_listener(bind_addr, self.shared.config.listen_backlog)?;
        let local = listener
            .local_addr()
            .context("couldn't read bound listener address")?;

        let identity =
            ConnectionIdentity::new(self.allocate_handle(), local.ip().to_string(), local.port());
        let conn = Connection::listener(
            identity.clone(),
            listener,
            self.shared.shutdown.child_token(),
        );

        self.register(conn)?;
        self.shared.metrics.record_opened();

        if let Some(on_accept) = on_accept {
            self.shared
                .events
                .new_connection_on_listener
                .connect(identity.handle(), move |peer| on_accept(peer));
        }

        info!("Listening on {}", identity);
        if !self.start_reading(&identity) {
            bail!("listener {} closed before accepting started", identity);
        }
        Ok(identity)
    }

    /// Start the background loop of a registered connection.
    ///
    /// Listeners get an accept loop, streams a read loop. Returns false when
    /// the identity is unknown or a loop is already running.
    pub fn start_reading(&self, identity: &ConnectionIdentity) -> bool {
        let conn = match self.lookup(identity.handle()) {
            Some(conn) => conn,
            None => {
                debug!("start_reading: {} is not registered", identity);
                return false;
            }
        };

        if !conn.claim_reader() {
            debug!("start_reading: loop already running for {}", identity);
            return false;
        }

        let socket = match conn.socket() {
            Some(socket) => socket,
            None => return false,
        };

        let handle = conn.identity().handle();
        let on_exit = close_on_exit(self.downgrade(), conn.identity().clone());
        let spawned = match socket {
            Socket::Stream(stream) => {
                let read_loop = ReadLoop {
                    identity: conn.identity().clone(),
                    stream,
                    data_arrived: conn.data_arrived().clone(),
                    cancel: conn.cancel_token(),
                    poll_interval: self.shared.config.poll_interval,
                    buffer_size: self.shared.config.read_buffer_size,
                    metrics: Arc::clone(&self.shared.metrics),
                };
                let read = async move {
                    read_loop.run().await;
                };
                self.shared.tasks.spawn(handle, read, on_exit)
            }
            Socket::Listener(listener) => {
                let accept_loop = AcceptLoop {
                    identity: conn.identity().clone(),
                    listener,
                    cancel: conn.cancel_token(),
                    poll_interval: self.shared.config.poll_interval,
                    backoff: AcceptBackoff::new(
                        self.shared.config.accept_backoff_initial,
                        self.shared.config.accept_backoff_max,
                    ),
                };
                let weak = self.downgrade();
                self.shared.tasks.spawn(handle, accept_loop.run(weak), on_exit)
            }
        };

        if !spawned {
            debug!("start_reading: shutting down, closing {}", identity);
            self.close_conn(identity);
            return false;
        }
        true
    }

    /// Write `bytes` to a registered connection.
    ///
    /// Returns false if the connection is gone or the send fails; never
    /// closes the connection itself.
    pub async fn write(&self, identity: &ConnectionIdentity, bytes: &[u8]) -> bool {
        match self.lookup(identity.handle()) {
            Some(conn) => conn.write(bytes, &self.shared.metrics).await,
            None => {
                debug!("write: {} is not registered", identity);
                self.shared.metrics.record_write_failure();
                false
            }
        }
    }

    /// Close a connection. Closing an unknown identity is a no-op that returns false.
    pub fn close_conn(&self, identity: &ConnectionIdentity) -> bool {
        let conn = match self.shared.connections.lock().remove(&identity.handle()) {
            Some(conn) => conn,
            None => return false,
        };

        conn.stop();
        if conn.role() == ConnectionRole::Listener {
            let dropped = self
                .shared
                .events
                .new_connection_on_listener
                .disconnect_key(&conn.identity().handle());
            debug!("Dropped {} accept subscriptions of {}", dropped, conn.identity());
        }

        self.shared.metrics.record_closed();
        info!("Closed connection {}", conn.identity());

        self.shared.events.connection_closed.emit(conn.identity());
        self.shared.tasks.notify_finished(conn.identity().handle());
        true
    }

    /// Stop every loop, close every connection and wait for all background
    /// tasks to finish. Lifecycle subscribers are detached afterwards.
    ///
    /// Fails if a background task panicked.
    pub async fn stop(&self) -> Result<()> {
        if !self.shared.finishing.swap(true, Ordering::SeqCst) {
            info!("Stopping connection manager");
        }
        self.shared.shutdown.cancel();

        let remaining: Vec<ConnectionIdentity> = self
            .shared
            .connections
            .lock()
            .values()
            .map(|conn| conn.identity().clone())
            .collect();

        for identity in &remaining {
            self.close_conn(identity);
        }

        let joined = self.shared.tasks.shutdown().await;
        self.shared.events.disconnect_all();
        joined?;

        info!(
            "Connection manager stopped ({} connections closed)",
            remaining.len()
        );
        Ok(())
    }

    /// Subscribe to bytes arriving on a connection
    pub fn subscribe_data<F>(&self, identity: &ConnectionIdentity, f: F) -> Option<SubscriptionId>
    where
        F: Fn(&DataArrived) + Send + Sync + 'static,
    {
        self.lookup(identity.handle())
            .map(|conn| conn.data_arrived().connect(f))
    }

    pub fn unsubscribe_data(&self, identity: &ConnectionIdentity, id: SubscriptionId) -> bool {
        self.lookup(identity.handle())
            .map(|conn| conn.data_arrived().disconnect(id))
            .unwrap_or(false)
    }

    /// Resolve `host` to its first address of the requested family
    pub async fn dns_lookup(host: &str, version: IpVersion) -> Option<String> {
        net::dns_lookup(host, version).await
    }

    pub fn contains(&self, identity: &ConnectionIdentity) -> bool {
        self.shared
            .connections
            .lock()
            .contains_key(&identity.handle())
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().len()
    }

    /// Snapshot of every registered identity, sorted
    pub fn connections(&self) -> Vec<ConnectionIdentity> {
        let mut identities: Vec<ConnectionIdentity> = self
            .shared
            .connections
            .lock()
            .values()
            .map(|conn| conn.identity().clone())
            .collect();
        identities.sort();
        identities
    }

    pub fn is_reading(&self, identity: &ConnectionIdentity) -> bool {
        self.lookup(identity.handle())
            .map(|conn| conn.is_reading())
            .unwrap_or(false)
    }

    pub fn role(&self, identity: &ConnectionIdentity) -> Option<ConnectionRole> {
        self.lookup(identity.handle()).map(|conn| conn.role())
    }

    /// Number of background loops not yet reclaimed
    pub fn active_tasks(&self) -> usize {
        self.shared.tasks.len()
    }

    fn lookup(&self, handle: SocketHandle) -> Option<Arc<Connection>> {
        self.shared.connections.lock().get(&handle).cloned()
    }

    fn allocate_handle(&self) -> SocketHandle {
        SocketHandle::from_raw(self.shared.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_finishing() {
            bail!("connection manager is stopping");
        }
        Ok(())
    }

    fn register(&self, conn: Connection) -> Result<()> {
        let mut connections = self.shared.connections.lock();
        if self.is_finishing() {
            conn.stop();
            bail!("connection manager is stopping; dropped {}", conn.identity());
        }
        connections.insert(conn.identity().handle(), Arc::new(conn));
        Ok(())
    }

    fn adopt_accepted(&self, listener: &ConnectionIdentity, stream: TcpStream, peer: SocketAddr) {
        let identity = ConnectionIdentity::unassigned(peer.ip().to_string(), peer.port())
            .with_handle(self.allocate_handle());
        let conn = Connection::stream(
            identity.clone(),
            ConnectionRole::Accepted {
                listener: listener.handle(),
            },
            stream,
            self.shared.shutdown.child_token(),
        );

        if let Err(e) = self.register(conn) {
            debug!("Discarding peer accepted on {}: {}", listener, e);
            return;
        }
        self.shared.metrics.record_opened();
        self.shared.metrics.record_accepted();
        info!("Accepted connection {} on {}", identity, listener);

        if self.announce_accepted(listener, &identity) {
            self.start_reading(&identity);
        }
    }

    /// Fire the new-connection events for a freshly registered peer.
    ///
    /// Skipped when the peer was already closed (e.g. by a concurrent
    /// `stop`), so no subscriber starts tracking a connection whose closed
    /// event has already fired.
    fn announce_accepted(&self, listener: &ConnectionIdentity, identity: &ConnectionIdentity) -> bool {
        if !self.contains(identity) {
            debug!("Peer {} closed before it was announced", identity);
            return false;
        }

        self.shared.events.new_connection.emit(identity);
        self.shared
            .events
            .new_connection_on_listener
            .send_to(&listener.handle(), identity);
        true
    }
}

/// Exit hook for a background loop: the loop's connection is closed however
/// the loop ended, including by a panicking subscriber.
fn close_on_exit(
    manager: WeakConnectionManager,
    identity: ConnectionIdentity,
) -> impl FnOnce() + Send + 'static {
    move || {
        if let Some(manager) = manager.upgrade() {
            manager.close_conn(&identity);
            manager.shared.tasks.notify_finished(identity.handle());
        }
    }
}

/// Background loop turning incoming peers on one listener into connections
struct AcceptLoop {
    identity: ConnectionIdentity,
    listener: Arc<TcpListener>,
    cancel: CancellationToken,
    poll_interval: Duration,
    backoff: AcceptBackoff,
}

impl AcceptLoop {
    async fn run(mut self, manager: WeakConnectionManager) {
        debug!("Accept loop started for {}", self.identity);

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = timeout(self.poll_interval, self.listener.accept()) => match result {
                    Err(_) => continue,
                    Ok(accepted) => accepted,
                },
            };

            match accepted {
                Ok((stream, peer)) => {
                    self.backoff.reset();
                    match manager.upgrade() {
                        Some(manager) => manager.adopt_accepted(&self.identity, stream, peer),
                        None => break,
                    }
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(os_error = ?e.raw_os_error(),
                          "accept failed on {}: {}; retrying in {:?}", self.identity, e, delay);
                    if let Some(manager) = manager.upgrade() {
                        manager.shared.metrics.record_accept_error();
                    }
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        debug!("Accept loop for {} finished", self.identity);
    }
}
