//! Subscription Registry
//!
//! Domain types for tracking which symbols the process wants pushed by the
//! server.
//!
//! # Design
//!
//! The registry is a single process-wide set of normalized symbols. It is
//! owned by the stream client, outlives any individual consumer and is the
//! source of truth replayed to the server after every (re)connect.
//!
//! Mutations report the delta they caused so the caller only puts symbols
//! on the wire that actually changed state.

use std::collections::BTreeSet;

use parking_lot::RwLock;

// =============================================================================
// Types
// =============================================================================

/// A normalized symbol string (trimmed, upper-case).
pub type Symbol = String;

/// Normalize a raw symbol. Returns `None` for blank input.
#[must_use]
pub fn normalize_symbol(raw: &str) -> Option<Symbol> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_uppercase())
}

/// Normalize a batch of raw symbols, dropping blanks and duplicates while
/// keeping first-seen order.
#[must_use]
pub fn normalize_symbols<I, S>(raw: I) -> Vec<Symbol>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = BTreeSet::new();
    raw.into_iter()
        .filter_map(|s| normalize_symbol(s.as_ref()))
        .filter(|s| seen.insert(s.clone()))
        .collect()
}

// =============================================================================
// Subscription Changes
// =============================================================================

/// Changes to the subscription set caused by a single mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionChanges {
    /// Symbols that were not present before and now are.
    pub added: Vec<Symbol>,
    /// Symbols that were present before and now are not.
    pub removed: Vec<Symbol>,
}

impl SubscriptionChanges {
    /// Check if there are any changes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Thread-safe set of subscribed symbols.
///
/// # Example
///
/// ```rust
/// use market_stream_client::domain::subscription::SubscriptionRegistry;
///
/// let registry = SubscriptionRegistry::new();
///
/// let changes = registry.add(["aapl", "MSFT"]);
/// assert_eq!(changes.added, vec!["AAPL".to_string(), "MSFT".to_string()]);
///
/// // Already present - nothing to send
/// let changes = registry.add(["AAPL"]);
/// assert!(changes.is_empty());
///
/// let changes = registry.remove(["msft"]);
/// assert_eq!(changes.removed, vec!["MSFT".to_string()]);
/// assert_eq!(registry.symbols(), vec!["AAPL".to_string()]);
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    symbols: RwLock<BTreeSet<Symbol>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add symbols to the set.
    ///
    /// Returns the symbols that were newly added.
    pub fn add<I, S>(&self, symbols: I) -> SubscriptionChanges
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let normalized = normalize_symbols(symbols);
        let mut set = self.symbols.write();
        let added = normalized
            .into_iter()
            .filter(|symbol| set.insert(symbol.clone()))
            .collect();

        SubscriptionChanges {
            added,
            removed: Vec::new(),
        }
    }

    /// Remove symbols from the set.
    ///
    /// Returns the symbols that were actually present.
    pub fn remove<I, S>(&self, symbols: I) -> SubscriptionChanges
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let normalized = normalize_symbols(symbols);
        let mut set = self.symbols.write();
        let removed = normalized
            .into_iter()
            .filter(|symbol| set.remove(symbol))
            .collect();

        SubscriptionChanges {
            added: Vec::new(),
            removed,
        }
    }

    /// Remove every symbol, returning what was removed.
    pub fn clear(&self) -> Vec<Symbol> {
        std::mem::take(&mut *self.symbols.write())
            .into_iter()
            .collect()
    }

    /// Get all subscribed symbols in sorted order.
    #[must_use]
    pub fn symbols(&self) -> Vec<Symbol> {
        self.symbols.read().iter().cloned().collect()
    }

    /// Get the subscribed symbols as a set.
    #[must_use]
    pub fn snapshot(&self) -> BTreeSet<Symbol> {
        self.symbols.read().clone()
    }

    /// Check whether a symbol is subscribed.
    #[must_use]
    pub fn contains(&self, symbol: &str) -> bool {
        normalize_symbol(symbol).is_some_and(|s| self.symbols.read().contains(&s))
    }

    /// Number of subscribed symbols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.read().len()
    }

    /// Check if no symbols are subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.read().is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
