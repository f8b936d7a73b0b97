//! Prometheus Metrics Module
//!
//! Exposes stream client metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Frames**: Frames received by event kind, malformed frames
//! - **Handler**: Errors and panics raised by the user handler
//! - **Commands**: Control messages written to the socket
//! - **Connection**: Supervisor state and reconnect attempts
//! - **Queues**: Depth of the isolation queues
//! - **Latency**: End-to-end latency and throughput per reporting window
//!
//! Recording functions are no-ops until a recorder is installed, so the
//! library can be used without an exporter.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::application::services::LatencyReport;
use crate::domain::command::Action;
use crate::domain::frame::EventKind;
use crate::domain::session::ConnectionState;

static INSTALLED: OnceLock<SocketAddr> = OnceLock::new();

/// Error type for metrics operations.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Failed to install metrics exporter.
    #[error("metrics installation error: {0}")]
    Installation(String),
}

/// Install the Prometheus exporter with an HTTP listener on `port`.
///
/// Metrics are served at `/metrics`. Calling this again is a no-op.
///
/// # Errors
///
/// Returns an error if the exporter fails to start (e.g., port already in use).
pub fn init_metrics(port: u16) -> Result<SocketAddr, MetricsError> {
    if let Some(addr) = INSTALLED.get() {
        return Ok(*addr);
    }

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| MetricsError::Installation(e.to_string()))?;
    register_metrics();

    tracing::info!(addr = %addr, "Prometheus metrics exporter started");
    Ok(*INSTALLED.get_or_init(|| addr))
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Inbound
    describe_counter!(
        "dataservices_frames_received_total",
        "Frames received from the market data feed by event kind"
    );
    describe_counter!(
        "dataservices_malformed_frames_total",
        "Frames that could not be decoded"
    );
    describe_counter!(
        "dataservices_handler_errors_total",
        "Errors and panics raised by the message handler"
    );

    // Outbound
    describe_counter!(
        "dataservices_commands_sent_total",
        "Control commands written to the socket by action"
    );

    // Connection
    describe_counter!(
        "dataservices_reconnects_total",
        "Reconnection attempts"
    );
    describe_gauge!(
        "dataservices_connection_state",
        "Supervisor state (0 idle, 1 connecting, 2 open, 3 reconnecting, 4 closing, 5 closed)"
    );

    // Isolation queues
    describe_gauge!(
        "dataservices_queue_depth",
        "Messages waiting in an isolation queue"
    );

    // Latency
    describe_histogram!(
        "dataservices_latency_seconds",
        "Average end-to-end latency per reporting window"
    );
    describe_gauge!(
        "dataservices_throughput_frames_per_second",
        "Frames per second over the last reporting window"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Queue whose depth is being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Server to client frames.
    Inbound,
    /// Client to server commands.
    Outbound,
}

impl QueueKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "server_to_client",
            Self::Outbound => "client_to_server",
        }
    }
}

/// Record a decoded frame.
pub fn record_frame_received(kind: EventKind) {
    counter!(
        "dataservices_frames_received_total",
        "event" => kind.as_str()
    )
    .increment(1);
}

/// Record an undecodable frame.
pub fn record_malformed_frame() {
    counter!("dataservices_malformed_frames_total").increment(1);
}

/// Record a handler failure.
pub fn record_handler_error() {
    counter!("dataservices_handler_errors_total").increment(1);
}

/// Record a command written to the socket.
pub fn record_command_sent(action: Action) {
    counter!(
        "dataservices_commands_sent_total",
        "action" => action.as_str()
    )
    .increment(1);
}

/// Record a reconnection attempt.
pub fn record_reconnect() {
    counter!("dataservices_reconnects_total").increment(1);
}

/// Update the supervisor state gauge.
pub fn set_connection_state(state: ConnectionState) {
    gauge!("dataservices_connection_state").set(state.as_gauge());
}

/// Update a queue depth gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_queue_depth(queue: QueueKind, depth: usize) {
    gauge!(
        "dataservices_queue_depth",
        "queue" => queue.as_str()
    )
    .set(depth as f64);
}

/// Record one latency report.
pub fn record_latency_report(report: &LatencyReport) {
    if let Some(latency) = report.average_latency {
        histogram!("dataservices_latency_seconds").record(latency.as_secs_f64());
    }
    gauge!("dataservices_throughput_frames_per_second").set(report.throughput_per_sec);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn queue_kind_as_str() {
        assert_eq!(QueueKind::Inbound.as_str(), "server_to_client");
        assert_eq!(QueueKind::Outbound.as_str(), "client_to_server");
    }

    #[test]
    fn recording_without_recorder_is_a_no_op() {
        record_frame_received(EventKind::Trade);
        record_malformed_frame();
        record_command_sent(Action::Subscribe);
        set_connection_state(ConnectionState::Open);
        set_queue_depth(QueueKind::Inbound, 3);
        record_latency_report(&LatencyReport {
            frames: 1,
            samples: 1,
            average_latency: Some(Duration::from_millis(4)),
            throughput_per_sec: 0.2,
            window: Duration::from_secs(5),
        });
    }
}
