//! Domain Layer - Core streaming types and business logic.
//!
//! This layer contains the market data types, the subscription set and the
//! price folding rules. Nothing here performs I/O.

/// Market data envelope types (quotes, trades, prices, snapshots).
pub mod streaming;

/// Shared subscription set tracking.
pub mod subscription;

/// Derived per-symbol price views and the shared previous-price cache.
pub mod pricing;
