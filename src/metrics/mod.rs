//! Metrics Module
//!
//! Prometheus counters for socket lifecycle and traffic.

pub mod collector;

pub use collector::{ConnectionMetrics, MetricsSnapshot};
