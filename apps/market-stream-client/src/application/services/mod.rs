//! Application Services
//!
//! Consumers of the shared stream, built only on [`MarketStreamPort`].
//!
//! - `PriceAggregator`: per-consumer price board for a set of symbols
//! - `KeepAlive`: periodic ping with missed-pong detection
//!
//! [`MarketStreamPort`]: crate::application::ports::MarketStreamPort

mod keepalive;
mod price_aggregator;

pub use keepalive::{KeepAlive, KeepAliveConfig, KeepAliveState};
pub use price_aggregator::{PriceAggregator, SymbolState};

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use tokio::sync::watch;

    use crate::application::ports::{MarketStreamError, MarketStreamPort};
    use crate::domain::pricing::PriceCache;
    use crate::domain::streaming::{ConnectionState, Envelope, Handler, HandlerId, Topic};
    use crate::domain::subscription::{SubscriptionChanges, SubscriptionRegistry};
    use crate::infrastructure::stream::Dispatcher;

    /// In-memory stream: envelopes are injected with [`FakeStream::emit`].
    pub struct FakeStream {
        pub dispatcher: Dispatcher,
        pub registry: SubscriptionRegistry,
        pub cache: Arc<PriceCache>,
        pub connected: AtomicBool,
        pub pings: AtomicUsize,
        pub price: Mutex<Option<Decimal>>,
        state_tx: watch::Sender<ConnectionState>,
    }

    impl FakeStream {
        pub fn new() -> Arc<Self> {
            let (state_tx, _) = watch::channel(ConnectionState::default());
            Arc::new(Self {
                dispatcher: Dispatcher::new(),
                registry: SubscriptionRegistry::new(),
                cache: Arc::new(PriceCache::new()),
                connected: AtomicBool::new(false),
                pings: AtomicUsize::new(0),
                price: Mutex::new(None),
                state_tx,
            })
        }

        pub fn emit(&self, envelope: Envelope) -> u64 {
            self.dispatcher.dispatch(envelope)
        }

        pub fn set_connected(&self, connected: bool) {
            self.connected.store(connected, Ordering::SeqCst);
            self.state_tx.send_replace(self.state());
        }
    }

    #[async_trait]
    impl MarketStreamPort for FakeStream {
        fn subscribe(&self, symbols: &[String]) -> SubscriptionChanges {
            self.registry.add(symbols)
        }

        fn unsubscribe(&self, symbols: &[String]) -> SubscriptionChanges {
            self.registry.remove(symbols)
        }

        fn on(&self, topic: Topic, handler: Handler) -> HandlerId {
            self.dispatcher.on(topic, handler)
        }

        fn off(&self, topic: Topic, id: HandlerId) -> bool {
            self.dispatcher.off(topic, id)
        }

        fn ping(&self) -> Result<(), MarketStreamError> {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(MarketStreamError::NotConnected);
            }
            self.pings.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn state(&self) -> ConnectionState {
            ConnectionState {
                connected: self.connected.load(Ordering::SeqCst),
                subscribed_symbols: self.registry.snapshot(),
                ..ConnectionState::default()
            }
        }

        fn watch_state(&self) -> watch::Receiver<ConnectionState> {
            self.state_tx.subscribe()
        }

        fn price_cache(&self) -> Arc<PriceCache> {
            Arc::clone(&self.cache)
        }

        async fn get_price(&self, _symbol: &str) -> Option<Decimal> {
            *self.price.lock()
        }

        async fn get_snapshot(&self, _symbol: &str) -> Option<serde_json::Value> {
            None
        }
    }
}
