//! Client Configuration Settings
//!
//! Settings for the market stream client, loaded from environment variables.
//! Every value has a default; unparseable numbers fall back to it.

use std::time::Duration;

/// Path of the market data WebSocket endpoint on the API host.
pub const STREAM_PATH: &str = "/ws/market-data";

/// Default API base URL.
pub const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Complete client configuration.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// REST API base URL as configured.
    pub api_url: String,
    /// Derived WebSocket endpoint.
    pub stream_url: String,
    /// Bound on the WebSocket handshake.
    pub connect_timeout: Duration,
    /// Wait for `get_price` / `get_snapshot` answers.
    pub request_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Reconnection jitter as a fraction of the delay.
    pub reconnect_jitter: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Keep-alive ping interval.
    pub keepalive_interval: Duration,
    /// Warn when no pong arrives within this window.
    pub keepalive_timeout: Duration,
    /// Prometheus metrics port (0 = disabled).
    pub metrics_port: u16,
    /// Symbols the watcher binary follows.
    pub symbols: Vec<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            stream_url: format!("ws://localhost:8000{STREAM_PATH}"),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_millis(5000),
            reconnect_delay_initial: Duration::from_millis(1000),
            reconnect_delay_max: Duration::from_millis(30_000),
            reconnect_delay_multiplier: 2.0,
            reconnect_jitter: 0.0,
            max_reconnect_attempts: 10,
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(60),
            metrics_port: 0,
            symbols: Vec::new(),
        }
    }
}

impl ClientSettings {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the API URL has an unsupported scheme or a
    /// backoff parameter is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`Self::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let api_url = lookup("MARKET_STREAM_API_URL")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.api_url);
        let stream_url = stream_url_from_base(&api_url)?;

        let reconnect_delay_multiplier = parse_f64(
            &lookup,
            "MARKET_STREAM_RECONNECT_DELAY_MULTIPLIER",
            defaults.reconnect_delay_multiplier,
        );
        if reconnect_delay_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                key: "MARKET_STREAM_RECONNECT_DELAY_MULTIPLIER".to_string(),
                value: reconnect_delay_multiplier.to_string(),
            });
        }

        let reconnect_jitter = parse_f64(
            &lookup,
            "MARKET_STREAM_RECONNECT_JITTER",
            defaults.reconnect_jitter,
        );
        if !(0.0..1.0).contains(&reconnect_jitter) {
            return Err(ConfigError::InvalidValue {
                key: "MARKET_STREAM_RECONNECT_JITTER".to_string(),
                value: reconnect_jitter.to_string(),
            });
        }

        let reconnect_delay_initial = parse_duration_millis(
            &lookup,
            "MARKET_STREAM_RECONNECT_DELAY_INITIAL_MS",
            defaults.reconnect_delay_initial,
        );
        let reconnect_delay_max = parse_duration_millis(
            &lookup,
            "MARKET_STREAM_RECONNECT_DELAY_MAX_MS",
            defaults.reconnect_delay_max,
        );
        if reconnect_delay_initial > reconnect_delay_max {
            return Err(ConfigError::InvalidValue {
                key: "MARKET_STREAM_RECONNECT_DELAY_INITIAL_MS".to_string(),
                value: reconnect_delay_initial.as_millis().to_string(),
            });
        }

        let symbols = lookup("MARKET_STREAM_SYMBOLS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_uppercase)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            api_url,
            stream_url,
            connect_timeout: parse_duration_secs(
                &lookup,
                "MARKET_STREAM_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout,
            ),
            request_timeout: parse_duration_millis(
                &lookup,
                "MARKET_STREAM_REQUEST_TIMEOUT_MS",
                defaults.request_timeout,
            ),
            reconnect_delay_initial,
            reconnect_delay_max,
            reconnect_delay_multiplier,
            reconnect_jitter,
            max_reconnect_attempts: parse_u32(
                &lookup,
                "MARKET_STREAM_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
            keepalive_interval: parse_duration_secs(
                &lookup,
                "MARKET_STREAM_KEEPALIVE_INTERVAL_SECS",
                defaults.keepalive_interval,
            ),
            keepalive_timeout: parse_duration_secs(
                &lookup,
                "MARKET_STREAM_KEEPALIVE_TIMEOUT_SECS",
                defaults.keepalive_timeout,
            ),
            metrics_port: parse_u16(&lookup, "MARKET_STREAM_METRICS_PORT", defaults.metrics_port),
            symbols,
        })
    }

    /// Metrics port, if metrics export is enabled.
    #[must_use]
    pub const fn metrics_port(&self) -> Option<u16> {
        if self.metrics_port == 0 {
            None
        } else {
            Some(self.metrics_port)
        }
    }
}

/// Derive the WebSocket endpoint from an API base URL.
///
/// `http` becomes `ws` and `https` becomes `wss`; `ws`/`wss` bases are kept.
/// The fixed stream path is appended.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidBaseUrl`] for any other scheme.
pub fn stream_url_from_base(base: &str) -> Result<String, ConfigError> {
    let base = base.trim().trim_end_matches('/');
    let Some((scheme, rest)) = base.split_once("://") else {
        return Err(ConfigError::InvalidBaseUrl(base.to_string()));
    };

    let ws_scheme = match scheme.to_ascii_lowercase().as_str() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return Err(ConfigError::InvalidBaseUrl(base.to_string())),
    };

    if rest.is_empty() {
        return Err(ConfigError::InvalidBaseUrl(base.to_string()));
    }

    Ok(format!("{ws_scheme}://{rest}{STREAM_PATH}"))
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// API base URL is not http(s) or ws(s).
    #[error("invalid API base URL: {0}")]
    InvalidBaseUrl(String),
    /// Value parsed but is out of range.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Environment variable name.
        key: String,
        /// Offending value.
        value: String,
    },
}

fn parse_u16<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: u16) -> u16 {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_u32<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: u32) -> u32 {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_f64<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: f64) -> f64 {
    lookup(key)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

fn parse_duration_secs<F: Fn(&str) -> Option<String>>(
    lookup: &F,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_duration_millis<F: Fn(&str) -> Option<String>>(
    lookup: &F,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
