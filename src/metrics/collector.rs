//! Connection Metrics Collector

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use crate::Result;

/// Point-in-time copy of every connection metric
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_opened: u64,
    pub connections_accepted: u64,
    pub connections_closed: u64,
    pub accept_errors: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub write_failures: u64,
    pub active_connections: i64,
}

/// Prometheus counters for socket lifecycle and traffic
pub struct ConnectionMetrics {
    registry: Registry,
    connections_opened_total: IntCounter,
    connections_accepted_total: IntCounter,
    connections_closed_total: IntCounter,
    accept_errors_total: IntCounter,
    bytes_received_total: IntCounter,
    bytes_sent_total: IntCounter,
    write_failures_total: IntCounter,
    active_connections: IntGauge,
}

impl ConnectionMetrics {
    /// Create the collector and register every metric on a private registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let connections_opened_total = IntCounter::new(
            "tcpmgr_connections_opened_total",
            "Sockets registered by the manager (outbound, listening and accepted)",
        )?;
        let connections_accepted_total = IntCounter::new(
            "tcpmgr_connections_accepted_total",
            "Peers accepted on listening sockets",
        )?;
        let connections_closed_total = IntCounter::new(
            "tcpmgr_connections_closed_total",
            "Sockets removed from the registry",
        )?;
        let accept_errors_total = IntCounter::new(
            "tcpmgr_accept_errors_total",
            "Failed accept calls on listening sockets",
        )?;
        let bytes_received_total = IntCounter::new(
            "tcpmgr_bytes_received_total",
            "Bytes delivered through data-arrived events",
        )?;
        let bytes_sent_total = IntCounter::new(
            "tcpmgr_bytes_sent_total",
            "Bytes written to peers",
        )?;
        let write_failures_total = IntCounter::new(
            "tcpmgr_write_failures_total",
            "Writes that failed or targeted a closed connection",
        )?;
        let active_connections = IntGauge::new(
            "tcpmgr_active_connections",
            "Sockets currently present in the registry",
        )?;

        registry.register(Box::new(connections_opened_total.clone()))?;
        registry.register(Box::new(connections_accepted_total.clone()))?;
        registry.register(Box::new(connections_closed_total.clone()))?;
        registry.register(Box::new(accept_errors_total.clone()))?;
        registry.register(Box::new(bytes_received_total.clone()))?;
        registry.register(Box::new(bytes_sent_total.clone()))?;
        registry.register(Box::new(write_failures_total.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;

        Ok(Self {
            registry,
            connections_opened_total,
            connections_accepted_total,
            connections_closed_total,
            accept_errors_total,
            bytes_received_total,
            bytes_sent_total,
            write_failures_total,
            active_connections,
        })
    }

    pub fn record_opened(&self) {
        self.connections_opened_total.inc();
        self.active_connections.inc();
    }

    pub fn record_accepted(&self) {
        self.connections_accepted_total.inc();
    }

    pub fn record_closed(&self) {
        self.connections_closed_total.inc();
        self.active_connections.dec();
    }

    pub fn record_accept_error(&self) {
        self.accept_errors_total.inc();
    }

    pub fn record_bytes_received(&self, bytes: usize) {
        self.bytes_received_total.inc_by(bytes as u64);
    }

    pub fn record_bytes_sent(&self, bytes: usize) {
        self.bytes_sent_total.inc_by(bytes as u64);
    }

    pub fn record_write_failure(&self) {
        self.write_failures_total.inc();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_opened: self.connections_opened_total.get(),
            connections_accepted: self.connections_accepted_total.get(),
            connections_closed: self.connections_closed_total.get(),
            accept_errors: self.accept_errors_total.get(),
            bytes_received: self.bytes_received_total.get(),
            bytes_sent: self.bytes_sent_total.get(),
            write_failures: self.write_failures_total.get(),
            active_connections: self.active_connections.get(),
        }
    }

    /// Render every metric in the Prometheus text exposition format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl std::fmt::Debug for ConnectionMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
