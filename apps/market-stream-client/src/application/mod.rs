//! Application Layer - Port definitions and consumer-facing services.
//!
//! Services here talk to the stream through [`ports::MarketStreamPort`]
//! and never touch the socket directly.

/// Port interfaces for the market data stream.
pub mod ports;

/// Application services: price aggregation and keep-alive.
pub mod services;
