//! Socket Primitives Module
//!
//! Address parsing, name resolution and raw socket setup shared by the
//! connection manager.

pub mod addr;
pub mod socket;

pub use addr::{address_family, dns_lookup, make_sock_addr, AddressFamily, IpVersion};
pub use socket::{bind_listener, connect_stream, new_tcp_socket};
