//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the WebSocket adapter that implements the
//! application's stream port, plus configuration and observability.

/// WebSocket stream client, frame codec and dispatcher.
pub mod stream;

/// Environment-driven configuration.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
