// src/core/metrics.rs

//! Defines and registers Prometheus metrics for node monitoring.
//!
//! This module uses `lazy_static` so metrics are registered once for the whole
//! process, no matter how many nodes it runs.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, TextEncoder, register_counter, register_counter_vec,
    register_gauge, register_histogram,
};
use tracing::error;

lazy_static! {
    // --- Gauges ---
    /// The number of connections currently registered.
    pub static ref CONNECTIONS: Gauge =
        register_gauge!("peerlink_connections", "Number of currently registered peer connections.").unwrap();

    // --- Counters ---
    /// Inbound queries read off the wire.
    pub static ref QUERIES_RECEIVED_TOTAL: Counter =
        register_counter!("peerlink_queries_received_total", "Total number of inbound queries received.").unwrap();
    /// Outbound calls, labeled by outcome (`success` or a call error label).
    pub static ref CALLS_TOTAL: CounterVec =
        register_counter_vec!("peerlink_calls_total", "Total number of outbound calls, labeled by outcome.", &["outcome"]).unwrap();
    /// Inbound queries answered with a queue-overflow status.
    pub static ref QUEUE_OVERFLOWS_TOTAL: Counter =
        register_counter!("peerlink_queue_overflows_total", "Total number of queries rejected by the task pool.").unwrap();
    pub static ref PINGS_TOTAL: Counter =
        register_counter!("peerlink_pings_total", "Total number of keepalive pings issued.").unwrap();
    /// Answers whose request id was not pending.
    pub static ref UNEXPECTED_ANSWERS_TOTAL: Counter =
        register_counter!("peerlink_unexpected_answers_total", "Total number of answers with an unknown request id.").unwrap();

    // --- Histograms ---
    /// Latency of outbound calls, from send to classified outcome.
    pub static ref CALL_LATENCY_SECONDS: Histogram =
        register_histogram!("peerlink_call_latency_seconds", "Latency of outbound calls in seconds.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_else(|e| {
        error!("Failed to encode metrics: {}", e);
        String::new()
    })
}
