//! Market Data Streaming Types
//!
//! Core domain types for the server-pushed envelopes: quotes, trades,
//! point-in-time prices and snapshots. These types are codec-agnostic and
//! represent the canonical internal representation of inbound data.
//!
//! # Wire Format (JSON)
//!
//! ```json
//! {"type": "connected", "connection_id": "c-91f2"}
//! {"type": "quote", "symbol": "AAPL", "data": {"bid_price": 189.10, "ask_price": 189.12, ...}}
//! {"type": "trade", "symbol": "AAPL", "data": {"price": 189.11, "size": 100, ...}}
//! {"type": "price", "symbol": "AAPL", "price": 189.11}
//! {"type": "snapshot", "symbol": "AAPL", "data": {...}}
//! {"type": "pong"}
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

mod connection;
mod routing;

pub use connection::ConnectionState;
pub use routing::{Delivery, Handler, HandlerId, Topic, WILDCARD};

// =============================================================================
// Message Kind
// =============================================================================

/// Discriminator for inbound envelopes, matching the `type` tag on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    /// Connection acknowledgment carrying the server-assigned id.
    Connected,
    /// Best bid/ask update.
    Quote,
    /// Executed trade.
    Trade,
    /// Response to a `get_price` query.
    Price,
    /// Response to a `get_snapshot` query.
    Snapshot,
    /// Response to a `ping`.
    Pong,
}

impl MessageKind {
    /// Get all message kinds.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Connected,
            Self::Quote,
            Self::Trade,
            Self::Price,
            Self::Snapshot,
            Self::Pong,
        ]
    }

    /// Wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Quote => "quote",
            Self::Trade => "trade",
            Self::Price => "price",
            Self::Snapshot => "snapshot",
            Self::Pong => "pong",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string is not a known message kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown message kind: {0}")]
pub struct UnknownMessageKind(pub String);

impl FromStr for MessageKind {
    type Err = UnknownMessageKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownMessageKind(s.to_string()))
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Real-time quote payload.
///
/// Field names are accepted in both `snake_case` and `camelCase`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    /// Symbol, when repeated inside the payload.
    #[serde(default)]
    pub symbol: String,

    /// Best bid price.
    #[serde(default, alias = "bidPrice")]
    pub bid_price: Decimal,

    /// Best bid size.
    #[serde(default, alias = "bidSize")]
    pub bid_size: Decimal,

    /// Best ask price.
    #[serde(default, alias = "askPrice")]
    pub ask_price: Decimal,

    /// Best ask size.
    #[serde(default, alias = "askSize")]
    pub ask_size: Decimal,

    /// Quote timestamp, if the server sent a parseable one.
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Quote {
    /// A quote is usable for pricing when both sides are positive.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.bid_price > Decimal::ZERO && self.ask_price > Decimal::ZERO
    }

    /// Mid price, or `None` when the quote is not usable.
    #[must_use]
    pub fn mid_price(&self) -> Option<Decimal> {
        self.is_usable()
            .then(|| (self.bid_price + self.ask_price) / Decimal::TWO)
    }

    /// Spread between ask and bid.
    #[must_use]
    pub fn spread(&self) -> Decimal {
        self.ask_price - self.bid_price
    }
}

/// Real-time trade payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    /// Symbol, when repeated inside the payload.
    #[serde(default)]
    pub symbol: String,

    /// Execution price.
    pub price: Decimal,

    /// Execution size.
    #[serde(default)]
    pub size: Decimal,

    /// Trade timestamp, if the server sent a parseable one.
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

// =============================================================================
// Envelope
// =============================================================================

/// A typed, server-pushed message unit distinguished by its `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Connection acknowledgment.
    Connected {
        /// Server-assigned connection identifier.
        connection_id: String,
    },
    /// Quote update.
    Quote {
        /// Quoted symbol.
        symbol: String,
        /// Quote payload.
        data: Quote,
    },
    /// Trade update.
    Trade {
        /// Traded symbol.
        symbol: String,
        /// Trade payload.
        data: Trade,
    },
    /// Point-in-time price answer.
    Price {
        /// Priced symbol.
        symbol: String,
        /// Price, absent when the server has none.
        #[serde(default)]
        price: Option<Decimal>,
    },
    /// Free-form snapshot answer.
    Snapshot {
        /// Snapshot symbol.
        symbol: String,
        /// Snapshot body.
        #[serde(default)]
        data: serde_json::Value,
    },
    /// Keep-alive answer.
    Pong,
}

impl Envelope {
    /// Get the kind of this envelope.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Connected { .. } => MessageKind::Connected,
            Self::Quote { .. } => MessageKind::Quote,
            Self::Trade { .. } => MessageKind::Trade,
            Self::Price { .. } => MessageKind::Price,
            Self::Snapshot { .. } => MessageKind::Snapshot,
            Self::Pong => MessageKind::Pong,
        }
    }

    /// Get the symbol this envelope refers to, if any.
    #[must_use]
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Self::Quote { symbol, .. }
            | Self::Trade { symbol, .. }
            | Self::Price { symbol, .. }
            | Self::Snapshot { symbol, .. } => Some(symbol),
            Self::Connected { .. } | Self::Pong => None,
        }
    }
}

// =============================================================================
// Timestamp parsing
// =============================================================================

/// Accepts RFC 3339, naive ISO 8601 (assumed UTC) and epoch milliseconds.
/// Anything else becomes `None` rather than failing the whole frame.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(parse_timestamp))
}

fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            }),
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_kind_round_trips_through_str() {
        for kind in MessageKind::all() {
            assert_eq!(kind.as_str().parse::<MessageKind>().unwrap(), *kind);
        }
        assert!("bar".parse::<MessageKind>().is_err());
    }

    #[test]
    fn quote_mid_price() {
        let quote = Quote {
            bid_price: Decimal::new(10000, 2),
            ask_price: Decimal::new(10002, 2),
            ..Quote::default()
        };
        assert_eq!(quote.mid_price(), Some(Decimal::new(10001, 2)));
        assert_eq!(quote.spread(), Decimal::new(2, 2));
    }

    #[test]
    fn one_sided_quote_is_not_usable() {
        let quote = Quote {
            bid_price: Decimal::ZERO,
            ask_price: Decimal::new(10002, 2),
            ..Quote::default()
        };
        assert!(!quote.is_usable());
        assert_eq!(quote.mid_price(), None);
    }

    #[test]
    fn quote_accepts_camel_case_fields() {
        let quote: Quote = serde_json::from_str(
            r#"{"symbol":"AAPL","bidPrice":189.1,"bidSize":3,"askPrice":"189.12","askSize":5}"#,
        )
        .unwrap();
        assert_eq!(quote.bid_price, Decimal::new(1891, 1));
        assert_eq!(quote.ask_price, Decimal::new(18912, 2));
        assert_eq!(quote.ask_size, Decimal::from(5));
        assert!(quote.timestamp.is_none());
    }

    #[test]
    fn timestamps_are_parsed_leniently() {
        let rfc: Trade =
            serde_json::from_str(r#"{"price":1,"timestamp":"2024-01-15T10:00:00Z"}"#).unwrap();
        assert!(rfc.timestamp.is_some());

        let naive: Trade =
            serde_json::from_str(r#"{"price":1,"timestamp":"2024-01-15T10:00:00.123"}"#).unwrap();
        assert!(naive.timestamp.is_some());

        let millis: Trade =
            serde_json::from_str(r#"{"price":1,"timestamp":1705312800000}"#).unwrap();
        assert_eq!(
            millis.timestamp.unwrap().timestamp_millis(),
            1_705_312_800_000
        );

        let garbage: Trade =
            serde_json::from_str(r#"{"price":1,"timestamp":"yesterday"}"#).unwrap();
        assert!(garbage.timestamp.is_none());
    }

    #[test]
    fn envelope_kind_and_symbol() {
        let pong = Envelope::Pong;
        assert_eq!(pong.kind(), MessageKind::Pong);
        assert_eq!(pong.symbol(), None);

        let price = Envelope::Price {
            symbol: "MSFT".to_string(),
            price: Some(Decimal::from(410)),
        };
        assert_eq!(price.kind(), MessageKind::Price);
        assert_eq!(price.symbol(), Some("MSFT"));
    }
}
