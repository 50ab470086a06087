//! Prometheus Metrics for Parlor Relay
//!
//! Provides observability metrics for monitoring the relay server.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Relay server metrics.
#[derive(Clone)]
pub struct RelayMetrics {
    /// Registry for all metrics.
    pub registry: Arc<Registry>,

    // Connection metrics
    /// Total connections accepted.
    pub connections_total: IntCounter,
    /// Current registered sessions.
    pub connections_active: IntGauge,
    /// Connections closed because the connection cap was reached.
    pub connections_rejected: IntCounter,
    /// Connections closed before a valid handshake.
    pub handshake_failures: IntCounter,

    // Frame metrics
    /// Application frames received.
    pub frames_received: IntCounter,
    /// Frames skipped because they did not parse.
    pub frames_malformed: IntCounter,
    /// Frames queued on the receiver's connection.
    pub frames_forwarded: IntCounter,
    /// Frames whose receiver was offline.
    pub frames_offline: IntCounter,
    /// Frames dropped because the receiver's queue was full.

    // Storage metrics
    /// Messages persisted.
    pub messages_persisted: IntCounter,
    /// Appends that failed.
    pub persist_failures: IntCounter,
    /// Time spent in the store append, in seconds.
    pub append_duration: Histogram,
    /// Current number of stored messages.
    pub messages_stored: IntGauge,
}

impl RelayMetrics {
    /// Creates a new metrics instance with all counters registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| {
            let c = IntCounter::with_opts(Opts::new(name, help)).unwrap();
            registry.register(Box::new(c.clone())).unwrap();
            c
        };
        let gauge = |name: &str, help: &str| {
            let g = IntGauge::with_opts(Opts::new(name, help)).unwrap();
            registry.register(Box::new(g.clone())).unwrap();
            g
        };

        let connections_total = counter("relay_connections_total", "Total connections accepted");
        let connections_active = gauge(
            "relay_connections_active",
            "Current registered sessions",
        );
        let connections_rejected = counter(
            "relay_connections_rejected_total",
            "Connections rejected at the connection cap",
        );
        let handshake_failures = counter(
            "relay_handshake_failures_total",
            "Connections closed before a valid handshake",
        );

        let frames_received = counter(
            "relay_frames_received_total",
            "Application frames received",
        );
        let frames_malformed = counter(
            "relay_frames_malformed_total",
            "Frames skipped because they did not parse",
        );
        let frames_forwarded = counter(
            "relay_frames_forwarded_total",
            "Frames queued for an online receiver",
        );
        let frames_offline = counter(
            "relay_frames_offline_total",
            "Frames whose receiver was offline",
        );

        let messages_persisted = counter(
            "relay_messages_persisted_total",
            "Messages written to the store",
        );
        let persist_failures = counter(
            "relay_persist_failures_total",
            "Store appends that failed",
        );

        let append_duration = Histogram::with_opts(HistogramOpts::new(
            "relay_append_duration_seconds",
            "Store append duration in seconds",
        ))
        .unwrap();
        registry
            .register(Box::new(append_duration.clone()))
            .unwrap();

        let messages_stored = gauge("relay_messages_stored", "Current number of stored messages");

        RelayMetrics {
            registry: Arc::new(registry),
            connections_total,
            connections_active,
            connections_rejected,
            handshake_failures,
            frames_received,
            frames_malformed,
            frames_forwarded,
            frames_offline,
            messages_persisted,
            persist_failures,
            append_duration,
            messages_stored,
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
