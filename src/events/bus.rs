//! Connection Event Bus

use bytes::Bytes;

use super::{Signal, TargetedSignal};
use crate::connection::{ConnectionIdentity, SocketHandle};

/// Payload of a connection's data-arrived event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataArrived {
    /// Connection the bytes were read from
    pub identity: ConnectionIdentity,
    /// Bytes returned by one successful read
    pub bytes: Bytes,
}

/// Lifecycle events published by a connection manager.
///
/// Owned by the manager and reached through `ConnectionManager::events`.
/// Data-arrived events live on each connection and are subscribed through
/// `ConnectionManager::subscribe_data`.
#[derive(Debug, Default)]
pub struct EventBus {
    /// Fired for every peer accepted on any listener
    pub new_connection: Signal<ConnectionIdentity>,
    /// Fired once per connection when it is removed from the registry
    pub connection_closed: Signal<ConnectionIdentity>,
    /// Fired for peers accepted on one listener, keyed by its handle
    pub new_connection_on_listener: TargetedSignal<SocketHandle, ConnectionIdentity>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every subscriber of every lifecycle event
    pub fn disconnect_all(&self) {
        self.new_connection.disconnect_all();
        self.connection_closed.disconnect_all();
        self.new_connection_on_listener.disconnect_all();
    }
}
