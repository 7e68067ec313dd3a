//! Handler routing types shared by the dispatcher and its consumers.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::{Envelope, MessageKind, UnknownMessageKind};

/// Callback invoked for every matching envelope.
pub type Handler = Arc<dyn Fn(&Delivery) + Send + Sync>;

/// Wire spelling of the wildcard topic.
pub const WILDCARD: &str = "*";

/// What a handler is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Envelopes of one kind.
    Kind(MessageKind),
    /// Every envelope, after the kind-specific handlers.
    Any,
}

impl From<MessageKind> for Topic {
    fn from(kind: MessageKind) -> Self {
        Self::Kind(kind)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kind(kind) => fmt::Display::fmt(kind, f),
            Self::Any => f.write_str(WILDCARD),
        }
    }
}

impl FromStr for Topic {
    type Err = UnknownMessageKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == WILDCARD {
            Ok(Self::Any)
        } else {
            s.parse().map(Self::Kind)
        }
    }
}

/// Identifies one handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    /// Wrap a raw registration number.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw registration number.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// An envelope as handed to handlers.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Monotonic dispatch sequence number, unique per dispatcher.
    pub seq: u64,
    /// When the dispatcher received the envelope.
    pub received_at: DateTime<Utc>,
    /// The envelope itself.
    pub envelope: Envelope,
}
