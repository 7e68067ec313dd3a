//! Prometheus Metrics Module
//!
//! Exposes client metrics via the `metrics` facade.
//!
//! # Metrics Categories
//!
//! - **Frames**: inbound envelopes by kind, dropped frames by reason
//! - **Commands**: outbound commands by action
//! - **Connection**: connection status, reconnect attempts
//! - **Subscriptions**: size of the shared subscription set
//! - **Dispatch**: handler panics, request timeouts, dispatch latency
//!
//! Recording functions are no-ops until [`init_metrics`] installs a recorder.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::streaming::MessageKind;
use crate::infrastructure::stream::codec::CodecError;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics setup errors.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Exporter could not be built.
    #[error("failed to build Prometheus exporter: {0}")]
    Build(#[from] BuildError),
    /// Another global recorder is already installed.
    #[error("failed to install metrics recorder: {0}")]
    Install(String),
}

/// Install the Prometheus recorder.
///
/// With a port, an HTTP listener serving `/metrics` is spawned on the
/// current tokio runtime. Calling this again returns the existing handle.
///
/// # Errors
///
/// Returns an error if the exporter cannot be built or a different global
/// recorder is already installed.
pub fn init_metrics(port: Option<u16>) -> Result<PrometheusHandle, MetricsError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = if let Some(port) = port {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let (recorder, exporter) = PrometheusBuilder::new().with_http_listener(addr).build()?;
        let handle = recorder.handle();
        metrics::set_global_recorder(recorder).map_err(|e| MetricsError::Install(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = exporter.await {
                tracing::error!(error = ?e, "Metrics exporter stopped");
            }
        });
        tracing::info!(%addr, "Serving Prometheus metrics");
        handle
    } else {
        PrometheusBuilder::new().install_recorder()?
    };

    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Frames
    describe_counter!(
        "market_stream_frames_received_total",
        "Inbound envelopes decoded, by kind"
    );
    describe_counter!(
        "market_stream_frames_dropped_total",
        "Inbound frames dropped as malformed, by reason"
    );
    describe_counter!(
        "market_stream_commands_sent_total",
        "Outbound commands written to the socket, by action"
    );

    // Connection
    describe_gauge!(
        "market_stream_connected",
        "1 while a transport is open, 0 otherwise"
    );
    describe_counter!(
        "market_stream_reconnects_total",
        "Reconnection attempts scheduled"
    );

    // Subscriptions
    describe_gauge!(
        "market_stream_subscribed_symbols",
        "Symbols in the shared subscription set"
    );

    // Dispatch
    describe_counter!(
        "market_stream_handler_panics_total",
        "Envelope handlers that panicked, by kind"
    );
    describe_counter!(
        "market_stream_request_timeouts_total",
        "Queries that got no answer in time, by response kind"
    );
    describe_histogram!(
        "market_stream_dispatch_seconds",
        "Time to fan one envelope out to its handlers"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

const fn drop_reason(error: &CodecError) -> &'static str {
    match error {
        CodecError::Json(_) => "invalid_json",
        CodecError::UnknownMessageType(_) => "unknown_type",
        CodecError::InvalidFormat(_) => "invalid_format",
    }
}

/// Record an envelope received.
pub fn record_frame_received(kind: MessageKind) {
    counter!(
        "market_stream_frames_received_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record a frame dropped as malformed.
pub fn record_frame_dropped(error: &CodecError) {
    counter!(
        "market_stream_frames_dropped_total",
        "reason" => drop_reason(error)
    )
    .increment(1);
}

/// Record a command written to the socket.
pub fn record_command_sent(action: &'static str) {
    counter!(
        "market_stream_commands_sent_total",
        "action" => action
    )
    .increment(1);
}

/// Update the connection status gauge.
pub fn set_connection_status(connected: bool) {
    gauge!("market_stream_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Record a scheduled reconnection attempt.
pub fn record_reconnect_attempt() {
    counter!("market_stream_reconnects_total").increment(1);
}

/// Update the subscribed symbol count.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscribed_symbols(count: usize) {
    gauge!("market_stream_subscribed_symbols").set(count as f64);
}

/// Record a handler panic.
pub fn record_handler_panic(kind: MessageKind) {
    counter!(
        "market_stream_handler_panics_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record a query that timed out.
pub fn record_request_timeout(kind: MessageKind) {
    counter!(
        "market_stream_request_timeouts_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record how long one dispatch took.
pub fn record_dispatch_duration(duration: Duration) {
    histogram!("market_stream_dispatch_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_reasons() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(drop_reason(&CodecError::Json(json_err)), "invalid_json");
        assert_eq!(
            drop_reason(&CodecError::UnknownMessageType("bar".to_string())),
            "unknown_type"
        );
        assert_eq!(
            drop_reason(&CodecError::InvalidFormat(String::new())),
            "invalid_format"
        );
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_frame_received(MessageKind::Quote);
        record_command_sent("subscribe");
        set_connection_status(true);
        set_subscribed_symbols(3);
        record_dispatch_duration(Duration::from_micros(40));
        record_frame_dropped(&CodecError::InvalidFormat(String::new()));
    }
}
