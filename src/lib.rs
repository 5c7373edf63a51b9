//! tcpmgr Library
//!
//! TCP Connection Manager Library
//!
//! Creates listening and outbound sockets, accepts incoming peers, runs one
//! read loop per connection and publishes connection-lifecycle and
//! data-arrival events to decoupled consumers.

pub mod config;
pub mod connection;
pub mod events;
pub mod metrics;
pub mod net;
pub mod server;
pub mod shutdown;

pub use config::Config;
pub use connection::{
    ConnectionIdentity, ConnectionManager, ConnectionRole, SocketHandle, WeakConnectionManager,
};
pub use events::{DataArrived, EventBus, Signal, SubscriptionId, TargetedSignal};
pub use server::TcpServer;
pub use shutdown::ShutdownCoordinator;

/// Common error type for the connection manager
pub type Result<T> = anyhow::Result<T>;
