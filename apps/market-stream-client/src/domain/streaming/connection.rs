//! Observable connection state.

use std::collections::BTreeSet;

use serde::Serialize;

/// Snapshot of the shared connection.
///
/// `reconnect_exhausted` is terminal: no automatic attempts follow until
/// the caller connects again explicitly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    /// Whether a transport is open.
    pub connected: bool,
    /// Identifier assigned by the server's `connected` envelope.
    pub connection_id: Option<String>,
    /// Symbols in the shared subscription set.
    pub subscribed_symbols: BTreeSet<String>,
    /// Reconnection attempts scheduled since the last successful connect.
    pub reconnect_attempts: u32,
    /// Whether the reconnection budget ran out.
    pub reconnect_exhausted: bool,
}

impl ConnectionState {
    /// Whether the connection is down and not coming back on its own.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !self.connected && self.reconnect_exhausted
    }
}
