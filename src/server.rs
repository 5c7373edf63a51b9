//! TCP Server
//!
//! Thin façade over a [`ConnectionManager`]: listens on one socket, tracks
//! the peers accepted on it and writes broadcasts to all of them.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::bail;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionIdentity, ConnectionManager};
use crate::events::SubscriptionId;
use crate::Result;

/// Tracked peers with their count of consecutive failed broadcast writes
type PeerTable = Arc<Mutex<BTreeMap<ConnectionIdentity, u32>>>;

pub struct TcpServer {
    manager: ConnectionManager,
    listener: Option<ConnectionIdentity>,
    peers: PeerTable,
    closed_subscription: Option<SubscriptionId>,
    failure_limit: u32,
}

impl TcpServer {
    /// Create a server on top of `manager`. Nothing is opened until `start`.
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            listener: None,
            peers: Arc::new(Mutex::new(BTreeMap::new())),
            closed_subscription: None,
            failure_limit: 3,
        }
    }

    /// Untrack a peer after `limit` consecutive failed broadcast writes.
    /// A limit of 0 keeps failing peers forever.
    pub fn with_failure_limit(mut self, limit: u32) -> Self {
        self.failure_limit = limit;
        self
    }

    /// Open the listening socket and start tracking accepted peers
    pub async fn start(&mut self, addr: &str, port: u16) -> Result<ConnectionIdentity> {
        if let Some(listener) = &self.listener {
            bail!("server already listening on {}", listener);
        }

        let peers = Arc::clone(&self.peers);
        let subscription = self.manager.events().connection_closed.connect(move |identity| {
            if peers.lock().remove(identity).is_some() {
                debug!("Untracked closed peer {}", identity);
            }
        });

        let peers = Arc::clone(&self.peers);
        let opened = self
            .manager
            .open_listen_socket_with(addr, port, move |identity| {
                peers.lock().insert(identity.clone(), 0);
            })
            .await;

        match opened {
            Ok(listener) => {
                info!("Server listening on {}", listener);
                self.closed_subscription = Some(subscription);
                self.listener = Some(listener.clone());
                Ok(listener)
            }
            Err(e) => {
                self.manager.events().connection_closed.disconnect(subscription);
                Err(e)
            }
        }
    }

    /// Identity of the listening socket, once started
    pub fn listener(&self) -> Option<&ConnectionIdentity> {
        self.listener.as_ref()
    }

    /// Snapshot of the tracked peers, sorted
    pub fn peers(&self) -> Vec<ConnectionIdentity> {
        self.peers.lock().keys().cloned().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Write `bytes` to every tracked peer and return how many writes succeeded
    pub async fn broadcast(&self, bytes: &[u8]) -> usize {
        let targets = self.peers();
        let mut delivered = 0;

        for peer in &targets {
            let ok = self.manager.write(peer, bytes).await;
            if ok {
                delivered += 1;
            }
            self.record_write(peer, ok);
        }

        debug!("Broadcast {} bytes to {}/{} peers", bytes.len(), delivered, targets.len());
        delivered
    }

    fn record_write(&self, peer: &ConnectionIdentity, ok: bool) {
        let mut peers = self.peers.lock();
        let failures = match peers.get_mut(peer) {
            Some(failures) => failures,
            None => return,
        };

        if ok {
            *failures = 0;
            return;
        }

        *failures += 1;
        if self.failure_limit > 0 && *failures >= self.failure_limit {
            warn!(
                "Dropping peer {} after {} consecutive failed writes",
                peer, self.failure_limit
            );
            peers.remove(peer);
        }
    }

    /// Close the listener and every tracked peer
    pub fn stop(&mut self) {
        if let Some(subscription) = self.closed_subscription.take() {
            self.manager.events().connection_closed.disconnect(subscription);
        }

        if let Some(listener) = self.listener.take() {
            self.manager.close_conn(&listener);
            info!("Server on {} stopped", listener);
        }

        let peers: Vec<ConnectionIdentity> = std::mem::take(&mut *self.peers.lock())
            .into_keys()
            .collect();
        for peer in &peers {
            self.manager.close_conn(peer);
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.stop();
    }
}
