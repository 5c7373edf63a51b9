//! Connection Identity

use std::fmt;

/// Registry key issued by the connection manager for one socket.
///
/// Handles are allocated from a per-manager counter and never reused, so a
/// recycled OS descriptor can never alias a stale registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SocketHandle(u64);

impl SocketHandle {
    /// Placeholder carried by an identity before its socket is assigned
    pub const UNASSIGNED: SocketHandle = SocketHandle(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_assigned(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sock-{}", self.0)
    }
}

/// Socket handle plus peer address: the name of one connection.
///
/// Equality and ordering are structural over all three fields, in field
/// order, so identities can key maps and be de-duplicated in sets.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionIdentity {
    handle: SocketHandle,
    peer_ip: String,
    peer_port: u16,
}

impl ConnectionIdentity {
    pub fn new(handle: SocketHandle, peer_ip: impl Into<String>, peer_port: u16) -> Self {
        Self {
            handle,
            peer_ip: peer_ip.into(),
            peer_port,
        }
    }

    /// Identity for a peer whose socket has not been assigned yet
    pub fn unassigned(peer_ip: impl Into<String>, peer_port: u16) -> Self {
        Self::new(SocketHandle::UNASSIGNED, peer_ip, peer_port)
    }

    /// Assign the socket handle, consuming the unassigned identity
    pub fn with_handle(self, handle: SocketHandle) -> Self {
        Self { handle, ..self }
    }

    pub fn handle(&self) -> SocketHandle {
        self.handle
    }

    pub fn peer_ip(&self) -> &str {
        &self.peer_ip
    }

    pub fn peer_port(&self) -> u16 {
        self.peer_port
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.peer_ip.contains(':') {
            write!(f, "{} [{}]:{}", self.handle, self.peer_ip, self.peer_port)
        } else {
            write!(f, "{} {}:{}", self.handle, self.peer_ip, self.peer_port)
        }
    }
}
