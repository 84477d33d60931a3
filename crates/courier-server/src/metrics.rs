//! Metrics collection and export for the courier server.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "courier_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "courier_connections_active";
    pub const MESSAGES_PUBLISHED_TOTAL: &str = "courier_messages_published_total";
    pub const MESSAGES_BYTES: &str = "courier_messages_bytes";
    pub const FILES_SERVED_TOTAL: &str = "courier_files_served_total";
    pub const USERS_REGISTERED_TOTAL: &str = "courier_users_registered_total";
    pub const ERRORS_TOTAL: &str = "courier_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of SSE subscriptions since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active SSE subscriptions"
    );
    metrics::describe_counter!(
        names::MESSAGES_PUBLISHED_TOTAL,
        "Total number of messages accepted for publishing"
    );
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of published payloads");
    metrics::describe_counter!(names::FILES_SERVED_TOTAL, "Total staged files served");
    metrics::describe_counter!(names::USERS_REGISTERED_TOTAL, "Total users registered");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of handler errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record an accepted publish.
pub fn record_published(kind: &str, bytes: usize) {
    counter!(names::MESSAGES_PUBLISHED_TOTAL, "kind" => kind.to_string()).increment(1);
    counter!(names::MESSAGES_BYTES, "kind" => kind.to_string()).increment(bytes as u64);
}

/// Record a served staged file.
pub fn record_file_served() {
    counter!(names::FILES_SERVED_TOTAL).increment(1);
}

/// Record a user registration.
pub fn record_user_registered() {
    counter!(names::USERS_REGISTERED_TOTAL).increment(1);
}

/// Record a handler error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Metrics guard that tracks an active subscription for its lifetime.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
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
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}
