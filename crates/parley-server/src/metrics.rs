//! Metrics collection and export.
//!
//! Instrumentation goes through the `metrics` facade and is exported in
//! Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use parley_core::fanout::{FANOUT_DELIVERIES, FANOUT_DROPPED};
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "parley_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "parley_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "parley_connections_rejected_total";
    pub const EVENTS_TOTAL: &str = "parley_events_total";
    pub const FRAMES_BYTES: &str = "parley_frames_bytes";
    pub const EVENT_LATENCY_SECONDS: &str = "parley_event_latency_seconds";
    pub const ROOMS_ACTIVE: &str = "parley_rooms_active";
    pub const ERRORS_TOTAL: &str = "parley_errors_total";
}

/// Describe every metric the server emits.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of accepted connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Connections closed at handshake for missing or invalid identity"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Client events handled, by event name");
    metrics::describe_counter!(names::FRAMES_BYTES, "Frame bytes, by direction");
    metrics::describe_histogram!(
        names::EVENT_LATENCY_SECONDS,
        "Client event handling latency in seconds"
    );
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Current number of local rooms");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Errors, by type");
    metrics::describe_counter!(FANOUT_DELIVERIES, "Live events queued to local connections");
    metrics::describe_counter!(FANOUT_DROPPED, "Broker publications that could not be decoded");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics listener.
///
/// # Errors
///
/// Returns an error if the listener cannot be installed.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

pub fn record_rejected() {
    counter!(names::CONNECTIONS_REJECTED).increment(1);
}

/// Record one handled client event.
pub fn record_event(event: &'static str, seconds: f64) {
    counter!(names::EVENTS_TOTAL, "event" => event).increment(1);
    histogram!(names::EVENT_LATENCY_SECONDS, "event" => event).record(seconds);
}

pub fn record_bytes(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

pub fn set_active_rooms(count: usize) {
    gauge!(names::ROOMS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Counts a connection as active for its lifetime.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
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
