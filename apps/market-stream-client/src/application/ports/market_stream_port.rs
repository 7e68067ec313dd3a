//! Market Stream Port (Driven Port)
//!
//! Interface to the shared real-time market data connection.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::watch;

use crate::domain::pricing::PriceCache;
use crate::domain::streaming::{ConnectionState, Handler, HandlerId, Topic};
use crate::domain::subscription::SubscriptionChanges;

/// Market stream error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarketStreamError {
    /// No transport is open.
    #[error("Market stream not connected")]
    NotConnected,

    /// The command could not be handed to the transport.
    #[error("Market stream unavailable: {message}")]
    Unavailable {
        /// Error details.
        message: String,
    },
}

/// Port for the shared market data stream.
///
/// Subscriptions and handlers are shared by every consumer of the same
/// stream; a symbol stays subscribed until someone unsubscribes it.
#[async_trait]
pub trait MarketStreamPort: Send + Sync {
    /// Add symbols to the shared subscription set.
    fn subscribe(&self, symbols: &[String]) -> SubscriptionChanges;

    /// Remove symbols from the shared subscription set.
    fn unsubscribe(&self, symbols: &[String]) -> SubscriptionChanges;

    /// Register a handler for a topic.
    fn on(&self, topic: Topic, handler: Handler) -> HandlerId;

    /// Remove a handler registration. Returns whether it was present.
    fn off(&self, topic: Topic, id: HandlerId) -> bool;

    /// Send a keep-alive ping.
    fn ping(&self) -> Result<(), MarketStreamError>;

    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Observe connection state changes.
    fn watch_state(&self) -> watch::Receiver<ConnectionState>;

    /// Previous-price cache shared by every consumer of the stream.
    fn price_cache(&self) -> Arc<PriceCache>;

    /// Query the current price of a symbol.
    ///
    /// `None` when not connected, on timeout, or when the server has no
    /// price.
    async fn get_price(&self, symbol: &str) -> Option<Decimal>;

    /// Query a snapshot of a symbol.
    async fn get_snapshot(&self, symbol: &str) -> Option<serde_json::Value>;
}
