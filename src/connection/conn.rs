//! Connection Implementation

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{ConnectionIdentity, SocketHandle};
use crate::events::{DataArrived, Signal};
use crate::metrics::ConnectionMetrics;

/// How a registered socket came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// Listening socket; its background loop accepts peers
    Listener,
    /// Socket connected by `open_connection`
    Outbound,
    /// Peer accepted on the given listening socket
    Accepted { listener: SocketHandle },
}

/// OS socket owned by a connection
#[derive(Clone)]
pub(crate) enum Socket {
    Stream(Arc<TcpStream>),
    Listener(Arc<TcpListener>),
}

/// One live socket registered with the connection manager.
///
/// The socket is shared with the connection's background loop only; the
/// registry is the sole owner of the `Connection` itself.
pub(crate) struct Connection {
    identity: ConnectionIdentity,
    role: ConnectionRole,
    socket: Mutex<Option<Socket>>,
    write_lock: tokio::sync::Mutex<()>,
    data_arrived: Signal<DataArrived>,
    cancel: CancellationToken,
    reading: AtomicBool,
    stopped: AtomicBool,
    opened_at: Instant,
}

impl Connection {
    /// Wrap a connected stream
    pub(crate) fn stream(
        identity: ConnectionIdentity,
        role: ConnectionRole,
        stream: TcpStream,
        cancel: CancellationToken,
    ) -> Self {
        Self::with_socket(identity, role, Socket::Stream(Arc::new(stream)), cancel)
    }

    /// Wrap a listening socket
    pub(crate) fn listener(
        identity: ConnectionIdentity,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Self {
        Self::with_socket(
            identity,
            ConnectionRole::Listener,
            Socket::Listener(Arc::new(listener)),
            cancel,
        )
    }

    fn with_socket(
        identity: ConnectionIdentity,
        role: ConnectionRole,
        socket: Socket,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            identity,
            role,
            socket: Mutex::new(Some(socket)),
            write_lock: tokio::sync::Mutex::new(()),
            data_arrived: Signal::new(),
            cancel,
            reading: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            opened_at: Instant::now(),
        }
    }

    pub(crate) fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    pub(crate) fn role(&self) -> ConnectionRole {
        self.role
    }

    pub(crate) fn data_arrived(&self) -> &Signal<DataArrived> {
        &self.data_arrived
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn socket(&self) -> Option<Socket> {
        self.socket.lock().clone()
    }

    pub(crate) fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Acquire) && !self.is_stopped()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Claim the right to run this connection's background loop.
    ///
    /// Returns false when a loop was already claimed or the connection is
    /// stopped, which makes starting a loop twice a no-op.
    pub(crate) fn claim_reader(&self) -> bool {
        if self.is_stopped() {
            return false;
        }
        self.reading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Send the whole buffer to the peer.
    ///
    /// Returns false on any send error, on a stopped connection, or when the
    /// connection is stopped while the send is pending.
    pub(crate) async fn write(&self, bytes: &[u8], metrics: &ConnectionMetrics) -> bool {
        let stream = match self.socket() {
            Some(Socket::Stream(stream)) => stream,
            Some(Socket::Listener(_)) => {
                debug!("Refusing write to listening socket {}", self.identity);
                metrics.record_write_failure();
                return false;
            }
            None => {
                debug!("Write on stopped connection {}", self.identity);
                metrics.record_write_failure();
                return false;
            }
        };

        let _guard = self.write_lock.lock().await;
        let mut written = 0;

        while written < bytes.len() {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("Connection {} stopped during write ({} of {} bytes sent)",
                           self.identity, written, bytes.len());
                    metrics.record_write_failure();
                    return false;
                }
                ready = stream.writable() => {
                    if let Err(e) = ready {
                        warn!(os_error = ?e.raw_os_error(), "send failed on {}: {}", self.identity, e);
                        metrics.record_write_failure();
                        return false;
                    }
                }
            }

            match stream.try_write(&bytes[written..]) {
                Ok(0) => {
                    warn!("send failed on {}: peer accepted no bytes", self.identity);
                    metrics.record_write_failure();
                    return false;
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    warn!(os_error = ?e.raw_os_error(), "send failed on {}: {}", self.identity, e);
                    metrics.record_write_failure();
                    return false;
                }
            }
        }

        metrics.record_bytes_sent(bytes.len());
        true
    }

    /// Stop the connection. Only the first call has any effect.
    ///
    /// Detaches every data-arrived subscriber, cancels the background loop
    /// and releases the socket. The descriptor is closed as soon as the loop
    /// drops its reference, which it does on observing the cancellation.
    pub(crate) fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.data_arrived.disconnect_all();
        self.cancel.cancel();
        drop(self.socket.lock().take());

        debug!(
            "Connection {} stopped after {:?}",
            self.identity,
            self.opened_at.elapsed()
        );
        true
    }
}

/// Why a read loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    Cancelled,
    PeerClosed,
    Failed,
}

/// Background loop moving bytes from one peer socket to its subscribers
pub(crate) struct ReadLoop {
    pub(crate) identity: ConnectionIdentity,
    pub(crate) stream: Arc<TcpStream>,
    pub(crate) data_arrived: Signal<DataArrived>,
    pub(crate) cancel: CancellationToken,
    pub(crate) poll_interval: Duration,
    pub(crate) buffer_size: usize,
    pub(crate) metrics: Arc<ConnectionMetrics>,
}

impl ReadLoop {
    /// Read until the peer closes, the socket fails, or the loop is cancelled.
    ///
    /// Each wait for readability is bounded by `poll_interval`. Every
    /// successful read emits exactly one data-arrived event carrying only the
    /// bytes that were read.
    pub(crate) async fn run(self) -> ReadOutcome {
        let mut buffer = vec![0u8; self.buffer_size];
        debug!("Read loop started for {}", self.identity);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break ReadOutcome::Cancelled,
                ready = timeout(self.poll_interval, self.stream.readable()) => match ready {
                    Err(_) => continue,
                    Ok(Err(e)) => {
                        warn!(os_error = ?e.raw_os_error(),
                              "poll failed on {}; closing connection: {}", self.identity, e);
                        break ReadOutcome::Failed;
                    }
                    Ok(Ok(())) => {}
                }
            }

            match self.stream.try_read(&mut buffer) {
                Ok(0) => {
                    info!("Connection {} was closed by peer", self.identity);
                    break ReadOutcome::PeerClosed;
                }
                Ok(n) => {
                    trace!("Read {} bytes from {}", n, self.identity);
                    self.metrics.record_bytes_received(n);
                    self.data_arrived.emit(&DataArrived {
                        identity: self.identity.clone(),
                        bytes: Bytes::copy_from_slice(&buffer[..n]),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    warn!(os_error = ?e.raw_os_error(),
                          "receive failed on {}; closing connection: {}", self.identity, e);
                    break ReadOutcome::Failed;
                }
            }
        };

        debug!("Read loop for {} finished: {:?}", self.identity, outcome);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::bind_listener;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncWriteExt;

    async fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 8).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn connection(stream: TcpStream) -> Connection {
        Connection::stream(
            ConnectionIdentity::new(SocketHandle::from_raw(1), "127.0.0.1", 1),
            ConnectionRole::Outbound,
            stream,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (client, _server) = stream_pair().await;
        let conn = connection(client);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        conn.data_arrived().connect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(conn.stop());
        assert!(!conn.stop());
        assert!(conn.is_stopped());
        assert!(conn.data_arrived().is_empty());
        assert!(conn.socket().is_none());
        assert!(conn.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_claim_reader_only_once() {
        let (client, _server) = stream_pair().await;
        let conn = connection(client);

        assert!(conn.claim_reader());
        assert!(!conn.claim_reader());
        assert!(conn.is_reading());

        conn.stop();
        assert!(!conn.is_reading());
    }

    #[tokio::test]
    async fn test_write_after_stop_fails() {
        let (client, _server) = stream_pair().await;
        let conn = connection(client);
        let metrics = ConnectionMetrics::new().unwrap();

        assert!(conn.write(b"hello", &metrics).await);
        conn.stop();
        assert!(!conn.write(b"hello", &metrics).await);
        assert_eq!(metrics.snapshot().write_failures, 1);
        assert_eq!(metrics.snapshot().bytes_sent, 5);
    }

    #[tokio::test]
    async fn test_read_loop_emits_once_per_read_and_ends_on_eof() {
        let (mut client, server) = stream_pair().await;
        let signal = Signal::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(AtomicUsize::new(0));

        let sink = Arc::clone(&received);
        let counter = Arc::clone(&events);
        signal.connect(move |event: &DataArrived| {
            counter.fetch_add(1, Ordering::SeqCst);
            sink.lock().extend_from_slice(&event.bytes);
        });

        let read_loop = ReadLoop {
            identity: ConnectionIdentity::new(SocketHandle::from_raw(2), "127.0.0.1", 2),
            stream: Arc::new(server),
            data_arrived: signal,
            cancel: CancellationToken::new(),
            poll_interval: Duration::from_millis(50),
            buffer_size: 1024,
            metrics: Arc::new(ConnectionMetrics::new().unwrap()),
        };
        let handle = tokio::spawn(read_loop.run());

        client.write_all(b"PING").await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, ReadOutcome::PeerClosed);
        assert_eq!(received.lock().as_slice(), b"PING");
        assert!(events.load(Ordering::SeqCst) >= 1);
        assert!(events.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn test_read_loop_observes_cancellation() {
        let (_client, server) = stream_pair().await;
        let cancel = CancellationToken::new();

        let read_loop = ReadLoop {
            identity: ConnectionIdentity::new(SocketHandle::from_raw(3), "127.0.0.1", 3),
            stream: Arc::new(server),
            data_arrived: Signal::new(),
            cancel: cancel.clone(),
            poll_interval: Duration::from_secs(30),
            buffer_size: 1024,
            metrics: Arc::new(ConnectionMetrics::new().unwrap()),
        };
        let handle = tokio::spawn(read_loop.run());

        cancel.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, ReadOutcome::Cancelled);
    }
}
