//! Metrics collection and export for the Sandesh coordinator.
//!
//! Uses the `metrics` crate for instrumentation and exports to
//! Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "sandesh_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "sandesh_connections_active";
    pub const SESSIONS_TOTAL: &str = "sandesh_sessions_total";
    pub const SESSIONS_ACTIVE: &str = "sandesh_sessions_active";
    pub const MESSAGES_TOTAL: &str = "sandesh_messages_total";
    pub const MESSAGES_BYTES: &str = "sandesh_messages_bytes";
    pub const LATENCY_SECONDS: &str = "sandesh_latency_seconds";
    pub const ERRORS_TOTAL: &str = "sandesh_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of live connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of live connections"
    );
    metrics::describe_counter!(
        names::SESSIONS_TOTAL,
        "Total number of sessions requested, labeled by kind"
    );
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Current number of tracked sessions");
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of frames processed");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Frame processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new live connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a requested session.
pub fn record_session(kind: &str) {
    counter!(names::SESSIONS_TOTAL, "kind" => kind.to_string()).increment(1);
}

/// Update the tracked session count.
pub fn set_active_sessions(count: usize) {
    gauge!(names::SESSIONS_ACTIVE).set(count as f64);
}

/// Record a processed frame.
pub fn record_message(bytes: usize, direction: &str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction.to_string()).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction.to_string()).increment(bytes as u64);
}

/// Record frame processing latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
