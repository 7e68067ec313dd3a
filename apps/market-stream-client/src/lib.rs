#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Market Stream Client - Real-Time Market Data Multiplexer
//!
//! Maintains a single WebSocket connection to the dashboard backend's
//! market data endpoint and multiplexes quotes, trades and point-in-time
//! price queries to any number of in-process consumers.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Envelope types and pure logic
//!   - `streaming`: Message kinds, quotes, trades, routing types
//!   - `subscription`: Shared subscription set
//!   - `pricing`: Per-symbol price views and the previous-price cache
//!
//! - **Application**: Port definitions and consumer services
//!   - `ports`: `MarketStreamPort`
//!   - `services`: `PriceAggregator`, `KeepAlive`
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `stream`: WebSocket client, frame codec, dispatcher, backoff
//!   - `config`: Environment-driven settings
//!   - `metrics`: Prometheus instrumentation
//!   - `telemetry`: Tracing subscriber and OTLP export
//!
//! # Data Flow
//!
//! ```text
//!                    ┌──────────────┐     ┌────────────┐     ┌────────────────┐
//! Server WS ───────► │ FrameCodec   │───► │ Dispatcher │───► │ PriceAggregator│──► Consumer 1
//!                    └──────────────┘     │            │───► │ PriceAggregator│──► Consumer 2
//!                                         │            │───► get_price / get_snapshot
//!                                         └────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Streaming types with no I/O.
pub mod domain;

/// Application layer - Ports and consumer services.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::pricing::{PriceBoard, PriceCache, PriceChange, RealTimePrice};
pub use domain::streaming::{
    ConnectionState, Delivery, Envelope, Handler, HandlerId, MessageKind, Quote, Topic, Trade,
};
pub use domain::subscription::{SubscriptionChanges, SubscriptionRegistry, Symbol};

// Application
pub use application::ports::{MarketStreamError, MarketStreamPort};
pub use application::services::{
    KeepAlive, KeepAliveConfig, KeepAliveState, PriceAggregator, SymbolState,
};

// Stream client
pub use infrastructure::stream::{
    Command, FrameCodec, ReconnectConfig, ReconnectPolicy, SharedStreamClient, StreamClient,
    StreamClientConfig, StreamError,
};

// Configuration
pub use infrastructure::config::{ClientSettings, ConfigError};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
