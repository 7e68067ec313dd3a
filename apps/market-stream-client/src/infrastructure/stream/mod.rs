//! Market Data Stream Adapter
//!
//! WebSocket client for the dashboard backend's `/ws/market-data` endpoint:
//!
//! - **codec**: JSON frame decoding into envelopes
//! - **messages**: outbound command frames
//! - **reconnect**: exponential backoff policy
//! - **dispatcher**: per-kind fan-out and request correlation
//! - **client**: connection lifecycle and the public API

pub mod client;
pub mod codec;
pub mod dispatcher;
pub mod messages;
pub mod reconnect;

pub use client::{SharedStreamClient, StreamClient, StreamClientConfig, StreamError};
pub use codec::{CodecError, FrameCodec};
pub use dispatcher::{Dispatcher, PendingRequest};
pub use messages::Command;
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectPolicy};
