//! Price Aggregator Service
//!
//! Per-consumer price board for a fixed set of symbols. Quote and trade
//! envelopes are folded into one [`RealTimePrice`] per symbol as they are
//! dispatched, and the whole board is published on a `watch` channel.
//!
//! Several aggregators may follow the same symbol. They share the stream's
//! subscription set and its previous-price cache, so the same tick produces
//! the same `change` everywhere.
//!
//! Detaching only deregisters handlers. Symbols stay subscribed until
//! someone calls `unsubscribe` on the stream.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::watch;

use crate::application::ports::MarketStreamPort;
use crate::domain::pricing::{PriceBoard, PriceCache, RealTimePrice};
use crate::domain::streaming::{Delivery, Envelope, Handler, HandlerId, MessageKind, Topic};
use crate::domain::subscription::{normalize_symbol, normalize_symbols};

/// Consumer-facing lifecycle of one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolState {
    /// Not followed by this aggregator, or the aggregator was closed.
    Unsubscribed,
    /// Followed, no data yet.
    Subscribing,
    /// At least one tick or price answer applied.
    Live,
}

/// Folds the stream into a per-symbol price board.
pub struct PriceAggregator {
    stream: Arc<dyn MarketStreamPort>,
    symbols: Arc<BTreeSet<String>>,
    board: Arc<watch::Sender<PriceBoard>>,
    registrations: Mutex<Vec<(Topic, HandlerId)>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for PriceAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceAggregator")
            .field("symbols", &self.symbols)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl PriceAggregator {
    /// Follow `symbols` on `stream`.
    ///
    /// Symbols are normalized and added to the shared subscription set;
    /// ones that were already subscribed are not sent again.
    pub fn new<I, S>(stream: Arc<dyn MarketStreamPort>, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let symbols = normalize_symbols(symbols);
        let board: PriceBoard = symbols
            .iter()
            .map(|symbol| (symbol.clone(), RealTimePrice::new(symbol.as_str())))
            .collect();
        let (board_tx, _) = watch::channel(board);

        let aggregator = Self {
            stream: Arc::clone(&stream),
            symbols: Arc::new(symbols.iter().cloned().collect()),
            board: Arc::new(board_tx),
            registrations: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        };

        let handler = aggregator.fold_handler(stream.price_cache());
        let mut registrations = Vec::with_capacity(2);
        for kind in [MessageKind::Quote, MessageKind::Trade] {
            let topic = Topic::Kind(kind);
            registrations.push((topic, stream.on(topic, Arc::clone(&handler))));
        }
        *aggregator.registrations.lock() = registrations;

        let changes = stream.subscribe(&symbols);
        tracing::debug!(
            symbols = ?symbols,
            newly_subscribed = changes.added.len(),
            "Price aggregator attached"
        );

        aggregator
    }

    fn fold_handler(&self, cache: Arc<PriceCache>) -> Handler {
        let board = Arc::clone(&self.board);
        let symbols = Arc::clone(&self.symbols);

        Arc::new(move |delivery: &Delivery| {
            fold(&board, &symbols, &cache, delivery);
        })
    }

    /// Symbols this aggregator follows, sorted.
    #[must_use]
    pub fn symbols(&self) -> Vec<String> {
        self.symbols.iter().cloned().collect()
    }

    /// Current view of one symbol.
    #[must_use]
    pub fn price(&self, symbol: &str) -> Option<RealTimePrice> {
        let symbol = normalize_symbol(symbol)?;
        self.board.borrow().get(&symbol).cloned()
    }

    /// Current view of every followed symbol.
    #[must_use]
    pub fn prices(&self) -> PriceBoard {
        self.board.borrow().clone()
    }

    /// Observe board updates.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<PriceBoard> {
        self.board.subscribe()
    }

    /// Lifecycle state of one symbol.
    #[must_use]
    pub fn symbol_state(&self, symbol: &str) -> SymbolState {
        let Some(symbol) = normalize_symbol(symbol) else {
            return SymbolState::Unsubscribed;
        };
        if self.is_closed() || !self.symbols.contains(&symbol) {
            return SymbolState::Unsubscribed;
        }

        let live = self
            .board
            .borrow()
            .get(&symbol)
            .is_some_and(RealTimePrice::has_data);
        if live {
            SymbolState::Live
        } else {
            SymbolState::Subscribing
        }
    }

    /// Whether the underlying stream currently has an open transport.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.stream.state().connected
    }

    /// Seed a symbol that has no data yet from a price query.
    ///
    /// Returns the price the server answered with. A symbol that already
    /// has data keeps its displayed price.
    pub async fn refresh(&self, symbol: &str) -> Option<Decimal> {
        let symbol = normalize_symbol(symbol)?;
        if self.is_closed() || !self.symbols.contains(&symbol) {
            return None;
        }

        let price = self.stream.get_price(&symbol).await?;
        self.board.send_modify(|board| {
            board
                .entry(symbol.clone())
                .or_insert_with(|| RealTimePrice::new(symbol.as_str()))
                .seed_price(price);
        });
        Some(price)
    }

    /// Deregister this aggregator's handlers.
    ///
    /// The board stops updating; the shared subscriptions stay in place.
    /// Calling this more than once is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let registrations = std::mem::take(&mut *self.registrations.lock());
        for (topic, id) in registrations {
            self.stream.off(topic, id);
        }
        tracing::debug!(symbols = ?self.symbols, "Price aggregator detached");
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for PriceAggregator {
    fn drop(&mut self) {
        self.close();
    }
}

fn fold(
    board: &watch::Sender<PriceBoard>,
    symbols: &BTreeSet<String>,
    cache: &PriceCache,
    delivery: &Delivery,
) {
    let symbol = match &delivery.envelope {
        Envelope::Quote { symbol, .. } | Envelope::Trade { symbol, .. } => symbol,
        _ => return,
    };
    let Some(symbol) = normalize_symbol(symbol) else {
        return;
    };
    if !symbols.contains(&symbol) {
        return;
    }

    board.send_modify(|board| {
        let view = board
            .entry(symbol.clone())
            .or_insert_with(|| RealTimePrice::new(symbol.as_str()));
        match &delivery.envelope {
            Envelope::Quote { data, .. } => view.apply_quote(data, delivery.seq, cache),
            Envelope::Trade { data, .. } => view.apply_trade(data, delivery.seq, cache),
            _ => {}
        }
    });
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::services::test_support::FakeStream;
    use crate::domain::streaming::{Quote, Trade};

    fn quote(symbol: &str, bid: i64, ask: i64) -> Envelope {
        Envelope::Quote {
            symbol: symbol.to_string(),
            data: Quote {
                symbol: symbol.to_string(),
                bid_price: Decimal::new(bid, 2),
                ask_price: Decimal::new(ask, 2),
                ..Quote::default()
            },
        }
    }

    fn trade(symbol: &str, price: i64) -> Envelope {
        Envelope::Trade {
            symbol: symbol.to_string(),
            data: Trade {
                symbol: symbol.to_string(),
                price: Decimal::new(price, 2),
                size: Decimal::from(10),
                timestamp: None,
            },
        }
    }

    fn attach(stream: &Arc<FakeStream>, symbols: &[&str]) -> PriceAggregator {
        let port: Arc<dyn MarketStreamPort> = stream.clone();
        PriceAggregator::new(port, symbols.iter().copied())
    }

    #[test]
    fn attaching_subscribes_and_registers_handlers() {
        let stream = FakeStream::new();
        let aggregator = attach(&stream, &["aapl", "MSFT", "AAPL"]);

        assert_eq!(aggregator.symbols(), vec!["AAPL", "MSFT"]);
        assert_eq!(stream.registry.symbols(), vec!["AAPL", "MSFT"]);
        assert_eq!(stream.dispatcher.handler_count(MessageKind::Quote), 1);
        assert_eq!(stream.dispatcher.handler_count(MessageKind::Trade), 1);
    }

    #[test]
    fn symbol_lifecycle() {
        let stream = FakeStream::new();
        let aggregator = attach(&stream, &["AAPL"]);

        assert_eq!(aggregator.symbol_state("TSLA"), SymbolState::Unsubscribed);
        assert_eq!(aggregator.symbol_state("AAPL"), SymbolState::Subscribing);
        assert!(!aggregator.price("AAPL").unwrap().has_data());

        stream.emit(quote("AAPL", 10000, 10002));
        assert_eq!(aggregator.symbol_state("aapl"), SymbolState::Live);

        aggregator.close();
        assert_eq!(aggregator.symbol_state("AAPL"), SymbolState::Unsubscribed);
    }

    #[test]
    fn quote_then_trade_fold() {
        let stream = FakeStream::new();
        let aggregator = attach(&stream, &["AAPL"]);

        stream.emit(quote("AAPL", 10000, 10002));
        stream.emit(trade("AAPL", 10050));

        let view = aggregator.price("AAPL").unwrap();
        assert_eq!(view.price, Some(Decimal::new(10001, 2)));
        assert_eq!(view.bid_price, Some(Decimal::new(10000, 2)));
        assert_eq!(view.last_trade_price, Some(Decimal::new(10050, 2)));
    }

    #[test]
    fn ignores_symbols_it_does_not_follow() {
        let stream = FakeStream::new();
        let aggregator = attach(&stream, &["AAPL"]);

        stream.emit(quote("MSFT", 40000, 40002));

        let board = aggregator.prices();
        assert_eq!(board.len(), 1);
        assert!(!board["AAPL"].has_data());
    }

    #[test]
    fn change_is_measured_against_previous_tick() {
        let stream = FakeStream::new();
        let aggregator = attach(&stream, &["AAPL"]);

        stream.emit(quote("AAPL", 10000, 10000));
        stream.emit(quote("AAPL", 10100, 10100));

        let view = aggregator.price("AAPL").unwrap();
        assert_eq!(view.change, Decimal::ONE);
        assert_eq!(view.change_percent, Decimal::ONE);
    }

    #[test]
    fn updates_apply_in_delivery_order() {
        let stream = FakeStream::new();
        let aggregator = attach(&stream, &["AAPL"]);
        let mut rx = aggregator.watch();

        stream.emit(trade("AAPL", 10000));
        stream.emit(trade("AAPL", 10100));
        stream.emit(trade("AAPL", 10000));

        assert!(rx.has_changed().unwrap());
        let view = rx.borrow_and_update()["AAPL"].clone();
        assert_eq!(view.price, Some(Decimal::from(100)));
        assert_eq!(view.change, Decimal::NEGATIVE_ONE);
    }

    #[test]
    fn simultaneous_views_report_the_same_change() {
        let stream = FakeStream::new();
        let first = attach(&stream, &["AAPL"]);
        let second = attach(&stream, &["AAPL", "MSFT"]);

        stream.emit(quote("AAPL", 10000, 10000));
        stream.emit(quote("AAPL", 10100, 10100));

        assert_eq!(first.price("AAPL").unwrap().change, Decimal::ONE);
        assert_eq!(second.price("AAPL").unwrap().change, Decimal::ONE);
    }

    #[test]
    fn cache_survives_detach() {
        let stream = FakeStream::new();
        {
            let early = attach(&stream, &["AAPL"]);
            stream.emit(quote("AAPL", 10000, 10000));
            drop(early);
        }

        let late = attach(&stream, &["AAPL"]);
        stream.emit(quote("AAPL", 10100, 10100));

        assert_eq!(late.price("AAPL").unwrap().change, Decimal::ONE);
    }

    #[test]
    fn drop_deregisters_but_keeps_subscriptions() {
        let stream = FakeStream::new();
        let aggregator = attach(&stream, &["AAPL"]);

        drop(aggregator);

        assert_eq!(stream.dispatcher.handler_count(MessageKind::Quote), 0);
        assert_eq!(stream.dispatcher.handler_count(MessageKind::Trade), 0);
        assert!(stream.registry.contains("AAPL"));
    }

    #[test]
    fn close_is_idempotent_and_freezes_board() {
        let stream = FakeStream::new();
        let aggregator = attach(&stream, &["AAPL"]);

        aggregator.close();
        aggregator.close();
        stream.emit(quote("AAPL", 10000, 10002));

        assert!(aggregator.is_closed());
        assert!(!aggregator.prices()["AAPL"].has_data());
    }

    #[tokio::test]
    async fn refresh_seeds_empty_symbol() {
        let stream = FakeStream::new();
        let aggregator = attach(&stream, &["AAPL"]);
        *stream.price.lock() = Some(Decimal::new(18950, 2));

        assert_eq!(aggregator.refresh("aapl").await, Some(Decimal::new(18950, 2)));
        assert_eq!(aggregator.symbol_state("AAPL"), SymbolState::Live);
        assert_eq!(
            aggregator.price("AAPL").unwrap().price,
            Some(Decimal::new(18950, 2))
        );
    }

    #[tokio::test]
    async fn refresh_without_answer_stays_subscribing() {
        let stream = FakeStream::new();
        let aggregator = attach(&stream, &["AAPL"]);

        assert_eq!(aggregator.refresh("AAPL").await, None);
        assert_eq!(aggregator.refresh("TSLA").await, None);
        assert_eq!(aggregator.symbol_state("AAPL"), SymbolState::Subscribing);
    }

    #[test]
    fn reports_connection_status() {
        let stream = FakeStream::new();
        let aggregator = attach(&stream, &["AAPL"]);

        assert!(!aggregator.is_connected());
        stream.set_connected(true);
        assert!(aggregator.is_connected());
    }
}
