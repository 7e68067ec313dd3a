//! Outbound Command Frames
//!
//! Commands the client sends to the market data server, tagged by `action`:
//!
//! ```json
//! {"action": "subscribe", "symbols": ["AAPL", "MSFT"]}
//! {"action": "unsubscribe", "symbols": ["MSFT"]}
//! {"action": "get_price", "symbol": "AAPL"}
//! {"action": "get_snapshot", "symbol": "AAPL"}
//! {"action": "ping"}
//! ```

use serde::{Deserialize, Serialize};

/// Command frame sent to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    /// Start pushing data for symbols.
    Subscribe {
        /// Symbols to add.
        symbols: Vec<String>,
    },
    /// Stop pushing data for symbols.
    Unsubscribe {
        /// Symbols to remove.
        symbols: Vec<String>,
    },
    /// Ask for the current price of a symbol.
    GetPrice {
        /// Symbol to price.
        symbol: String,
    },
    /// Ask for a snapshot of a symbol.
    GetSnapshot {
        /// Symbol to snapshot.
        symbol: String,
    },
    /// Keep-alive probe.
    Ping,
}

impl Command {
    /// Wire name of the command, used as a metrics label.
    #[must_use]
    pub const fn action(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::GetPrice { .. } => "get_price",
            Self::GetSnapshot { .. } => "get_snapshot",
            Self::Ping => "ping",
        }
    }
}
