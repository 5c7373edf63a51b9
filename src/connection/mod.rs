//! Connection Management Module
//!
//! Handles socket registration, accept and read loops, and connection lifecycle.

mod backoff;
mod conn;
pub mod identity;
pub mod manager;
mod tasks;

pub use conn::ConnectionRole;
pub use identity::{ConnectionIdentity, SocketHandle};
pub use manager::{ConnectionManager, WeakConnectionManager};
