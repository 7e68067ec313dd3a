//! Price Folding
//!
//! Derived per-symbol price views built from quote and trade envelopes, and
//! the previous-price cache they diff against.
//!
//! # Baseline
//!
//! `change` and `change_percent` measure tick-to-tick drift: the baseline is
//! the price observed on the previous tick for the same symbol, not a prior
//! close. The cache is shared by every view of a symbol and remembers the
//! sequence number of the envelope that last advanced it, so several views
//! folding the same envelope all report the same change.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::streaming::{Quote, Trade};

/// Decimal places kept on `change_percent`.
const CHANGE_PERCENT_SCALE: u32 = 4;

/// Snapshot of every symbol a consumer follows, keyed by symbol.
pub type PriceBoard = BTreeMap<String, RealTimePrice>;

// =============================================================================
// Price Change
// =============================================================================

/// Difference between a new price and the previously observed one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PriceChange {
    /// Price the change is measured against, if any was observed.
    pub previous: Option<Decimal>,
    /// Absolute change.
    pub change: Decimal,
    /// Change as a percentage of `previous`.
    pub change_percent: Decimal,
}

impl PriceChange {
    /// Compute the change from `previous` to `current`.
    ///
    /// No previous price, or a zero one, yields a zero change.
    #[must_use]
    pub fn between(previous: Option<Decimal>, current: Decimal) -> Self {
        match previous {
            Some(prev) if !prev.is_zero() => {
                let change = current - prev;
                let change_percent = (change / prev * Decimal::ONE_HUNDRED)
                    .round_dp(CHANGE_PERCENT_SCALE);
                Self {
                    previous,
                    change,
                    change_percent,
                }
            }
            _ => Self {
                previous,
                ..Self::default()
            },
        }
    }
}

// =============================================================================
// Price Cache
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    seq: u64,
    previous: Option<Decimal>,
    current: Decimal,
}

/// Per-symbol previous-price cache shared across all consumers.
///
/// Entries are never removed when a consumer detaches.
#[derive(Debug, Default)]
pub struct PriceCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl PriceCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `price` for `symbol` as observed on envelope `seq` and return
    /// the change against the baseline.
    ///
    /// The first observation of a given `seq` advances the cache; repeated
    /// observations of the same `seq` diff against the same baseline.
    pub fn observe(&self, symbol: &str, seq: u64, price: Decimal) -> PriceChange {
        let mut entries = self.entries.lock();

        let Some(entry) = entries.get_mut(symbol) else {
            entries.insert(
                symbol.to_string(),
                CacheEntry {
                    seq,
                    previous: None,
                    current: price,
                },
            );
            return PriceChange::between(None, price);
        };

        if seq > entry.seq {
            entry.previous = Some(entry.current);
            entry.current = price;
            entry.seq = seq;
            PriceChange::between(entry.previous, price)
        } else if seq == entry.seq {
            PriceChange::between(entry.previous, price)
        } else {
            // Stale tick: diff against the latest price without advancing.
            PriceChange::between(Some(entry.current), price)
        }
    }

    /// Latest observed price for `symbol`.
    #[must_use]
    pub fn last_price(&self, symbol: &str) -> Option<Decimal> {
        self.entries.lock().get(symbol).map(|e| e.current)
    }

    /// Number of symbols with a cached price.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if nothing has been observed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

// =============================================================================
// Real-Time Price
// =============================================================================

/// Derived price view for one symbol.
///
/// All fields start empty; a view that has never received data reads as
/// "no data yet" rather than an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealTimePrice {
    /// Symbol.
    pub symbol: String,
    /// Displayed price: quote mid when usable, else last trade price.
    pub price: Option<Decimal>,
    /// Best bid from the last quote.
    pub bid_price: Option<Decimal>,
    /// Best ask from the last quote.
    pub ask_price: Option<Decimal>,
    /// Last trade price.
    pub last_trade_price: Option<Decimal>,
    /// Last trade size.
    pub last_trade_size: Option<Decimal>,
    /// Change against the previously observed price.
    pub change: Decimal,
    /// Change as a percentage.
    pub change_percent: Decimal,
    /// Time of the last applied tick.
    pub last_update: Option<DateTime<Utc>>,
}

impl RealTimePrice {
    /// Create an empty view for `symbol`.
    #[must_use]
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            ..Self::default()
        }
    }

    /// Whether any tick has been applied.
    #[must_use]
    pub const fn has_data(&self) -> bool {
        self.last_update.is_some()
    }

    /// Whether the last quote had both sides.
    #[must_use]
    pub const fn has_usable_quote(&self) -> bool {
        self.bid_price.is_some() && self.ask_price.is_some()
    }

    /// Fold a quote into the view.
    pub fn apply_quote(&mut self, quote: &Quote, seq: u64, cache: &PriceCache) {
        self.bid_price = positive(quote.bid_price);
        self.ask_price = positive(quote.ask_price);
        self.price = quote.mid_price().or(self.last_trade_price);
        self.touch(quote.timestamp, seq, cache);
    }

    /// Fold a trade into the view.
    pub fn apply_trade(&mut self, trade: &Trade, seq: u64, cache: &PriceCache) {
        self.last_trade_price = Some(trade.price);
        self.last_trade_size = Some(trade.size);
        if !self.has_usable_quote() {
            self.price = Some(trade.price);
        }
        self.touch(trade.timestamp, seq, cache);
    }

    /// Seed an empty view from a point-in-time price answer.
    ///
    /// Does not advance the shared cache; change stays zero until the next
    /// tick.
    pub fn seed_price(&mut self, price: Decimal) {
        if self.price.is_none() {
            self.price = Some(price);
            self.last_update = Some(Utc::now());
        }
    }

    fn touch(&mut self, timestamp: Option<DateTime<Utc>>, seq: u64, cache: &PriceCache) {
        if let Some(price) = self.price {
            let diff = cache.observe(&self.symbol, seq, price);
            self.change = diff.change;
            self.change_percent = diff.change_percent;
        }
        self.last_update = Some(timestamp.unwrap_or_else(Utc::now));
    }
}

fn positive(value: Decimal) -> Option<Decimal> {
    (value > Decimal::ZERO).then_some(value)
}

// =============================================================================
// Tests
// =============================================================================
