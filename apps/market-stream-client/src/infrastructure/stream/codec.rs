//! Frame Codec
//!
//! Parses inbound JSON text frames into typed [`Envelope`]s and serializes
//! outbound [`Command`]s.
//!
//! Each inbound frame is a single JSON object carrying a `type` tag. Frames
//! that are not objects, lack a known tag, or fail to match the payload shape
//! for their tag are rejected with a [`CodecError`]; the caller drops them.

use crate::domain::streaming::{Envelope, MessageKind};
use crate::infrastructure::stream::messages::Command;

/// Maximum number of characters of a bad frame echoed into an error.
const PREVIEW_LEN: usize = 50;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame carried a `type` tag that is not a known message kind.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// Frame is not a JSON object with a string `type` field.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// JSON codec for the market data stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode a JSON text frame into an envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not valid JSON, is not an object,
    /// has an unknown `type`, or its payload does not fit that type.
    pub fn decode(&self, text: &str) -> Result<Envelope, CodecError> {
        let value: serde_json::Value = serde_json::from_str(text.trim())?;

        let Some(object) = value.as_object() else {
            return Err(CodecError::InvalidFormat(format!(
                "expected JSON object, got: {}",
                preview(text)
            )));
        };

        let Some(tag) = object.get("type").and_then(serde_json::Value::as_str) else {
            return Err(CodecError::InvalidFormat(format!(
                "missing type field: {}",
                preview(text)
            )));
        };

        if tag.parse::<MessageKind>().is_err() {
            return Err(CodecError::UnknownMessageType(tag.to_string()));
        }

        Ok(serde_json::from_value(value)?)
    }

    /// Decode a binary frame, which must hold UTF-8 JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not UTF-8 or fail [`Self::decode`].
    pub fn decode_bytes(&self, data: &[u8]) -> Result<Envelope, CodecError> {
        let text = std::str::from_utf8(data)
            .map_err(|e| CodecError::InvalidFormat(format!("binary frame is not UTF-8: {e}")))?;
        self.decode(text)
    }

    /// Encode a command to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self, command: &Command) -> Result<String, CodecError> {
        Ok(serde_json::to_string(command)?)
    }
}

fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_LEN).collect()
}
