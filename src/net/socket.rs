//! Raw Socket Setup

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::debug;

use crate::Result;

/// Create an unconnected TCP socket matching the family of `addr`
pub fn new_tcp_socket(addr: &SocketAddr) -> Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    };
    socket.with_context(|| format!("couldn't create socket for {}", addr))
}

/// Create a listening socket bound to `addr`.
///
/// Address reuse is enabled before binding. The returned listener is
/// non-blocking and registered with the runtime.
pub fn bind_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener> {
    let socket = new_tcp_socket(&addr)?;
    socket
        .set_reuseaddr(true)
        .context("couldn't set SO_REUSEADDR option")?;
    socket
        .bind(addr)
        .with_context(|| format!("cannot bind to {}", addr))?;
    let listener = socket
        .listen(backlog)
        .with_context(|| format!("cannot listen on {}", addr))?;

    debug!("Listening socket bound to {} (backlog {})", addr, backlog);
    Ok(listener)
}

/// Connect to `dest`, optionally from a fixed local endpoint.
///
/// Address reuse is only enabled when a source endpoint is given, so that an
/// outbound connection can be re-established from the same local port.
pub async fn connect_stream(
    dest: SocketAddr,
    source: Option<SocketAddr>,
    connect_timeout: Duration,
) -> Result<TcpStream> {
    let socket = new_tcp_socket(&dest)?;

    if let Some(source) = source {
        socket
            .set_reuseaddr(true)
            .context("couldn't set SO_REUSEADDR option")?;
        socket
            .bind(source)
            .with_context(|| format!("couldn't bind source address {}", source))?;
        debug!("Outbound socket bound to source {}", source);
    }

    match timeout(connect_timeout, socket.connect(dest)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(anyhow!("couldn't connect to {}: {}", dest, e)),
        Err(_) => Err(anyhow!(
            "connection to {} timed out after {:?}",
            dest,
            connect_timeout
        )),
    }
}
