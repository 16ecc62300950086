//! Metrics collection and export for Huddle.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "huddle_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "huddle_connections_active";
    pub const ACTIONS_TOTAL: &str = "huddle_actions_total";
    pub const EVENTS_TOTAL: &str = "huddle_events_total";
    pub const FRAME_BYTES: &str = "huddle_frame_bytes";
    pub const MESSAGES_CREATED: &str = "huddle_messages_created_total";
    pub const MESSAGES_SWEPT: &str = "huddle_messages_swept_total";
    pub const ROOMS_ACTIVE: &str = "huddle_rooms_active";
    pub const LATENCY_SECONDS: &str = "huddle_action_latency_seconds";
    pub const ERRORS_TOTAL: &str = "huddle_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::ACTIONS_TOTAL, "Inbound actions by kind");
    metrics::describe_counter!(names::EVENTS_TOTAL, "Outbound events by kind");
    metrics::describe_counter!(names::FRAME_BYTES, "WebSocket frame bytes by direction");
    metrics::describe_counter!(names::MESSAGES_CREATED, "Chat messages created by kind");
    metrics::describe_counter!(
        names::MESSAGES_SWEPT,
        "Soft-deleted messages removed after retention"
    );
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Rooms with at least one live connection");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Action processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

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

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record an inbound action.
pub fn record_action(kind: &'static str, bytes: usize) {
    counter!(names::ACTIONS_TOTAL, "kind" => kind).increment(1);
    counter!(names::FRAME_BYTES, "direction" => "inbound").increment(bytes as u64);
}

/// Record an outbound event.
pub fn record_event(kind: &'static str, bytes: usize) {
    counter!(names::EVENTS_TOTAL, "kind" => kind).increment(1);
    counter!(names::FRAME_BYTES, "direction" => "outbound").increment(bytes as u64);
}

/// Record a created chat message.
pub fn record_message_created(kind: &'static str) {
    counter!(names::MESSAGES_CREATED, "kind" => kind).increment(1);
}

/// Record messages removed by a sweep.
pub fn record_swept(count: usize) {
    counter!(names::MESSAGES_SWEPT).increment(count as u64);
}

/// Record action latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Update active room count.
pub fn set_active_rooms(count: usize) {
    gauge!(names::ROOMS_ACTIVE).set(count as f64);
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
