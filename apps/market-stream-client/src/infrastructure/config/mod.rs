//! Configuration Module
//!
//! Environment-driven settings for the stream client and watcher binary.

mod settings;

pub use settings::{ClientSettings, ConfigError, DEFAULT_API_URL, STREAM_PATH, stream_url_from_base};
