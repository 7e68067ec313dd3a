//! Keep-Alive Service
//!
//! Sends a `ping` command on a fixed interval while the stream is connected
//! and watches for the matching `pong` envelopes. A ping left unanswered
//! for longer than the pong timeout is logged and counted; recovery is left
//! to the stream's own reconnect logic.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::application::ports::MarketStreamPort;
use crate::domain::streaming::{Delivery, Handler, MessageKind, Topic};
use crate::infrastructure::config::ClientSettings;

/// Configuration for keep-alive behavior.
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// Interval between pings.
    pub interval: Duration,
    /// How long a ping may go unanswered before it is reported.
    pub pong_timeout: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
        }
    }
}

impl KeepAliveConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            interval,
            pong_timeout,
        }
    }

    /// Create configuration from client settings.
    #[must_use]
    pub const fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            interval: settings.keepalive_interval,
            pong_timeout: settings.keepalive_timeout,
        }
    }
}

/// Ping/pong bookkeeping shared with the pong handler.
#[derive(Debug, Default)]
pub struct KeepAliveState {
    last_pong: RwLock<Option<Instant>>,
    ping_sent_at: RwLock<Option<Instant>>,
    missed_pongs: AtomicU32,
}

impl KeepAliveState {
    /// Create empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a pong arrived; the outstanding ping is answered.
    pub fn record_pong(&self) {
        *self.last_pong.write() = Some(Instant::now());
        *self.ping_sent_at.write() = None;
    }

    /// Record that a ping went out. An older unanswered ping keeps its time.
    pub fn mark_ping_sent(&self) {
        self.ping_sent_at.write().get_or_insert_with(Instant::now);
    }

    /// Whether a ping is waiting for its pong.
    #[must_use]
    pub fn is_waiting_for_pong(&self) -> bool {
        self.ping_sent_at.read().is_some()
    }

    /// Time since the last pong, if one ever arrived.
    #[must_use]
    pub fn time_since_pong(&self) -> Option<Duration> {
        self.last_pong.read().map(|at| at.elapsed())
    }

    /// Number of pings reported as unanswered.
    #[must_use]
    pub fn missed_pongs(&self) -> u32 {
        self.missed_pongs.load(Ordering::SeqCst)
    }

    /// If the outstanding ping is older than `timeout`, count it as missed,
    /// forget it and return its age.
    pub fn take_overdue(&self, timeout: Duration) -> Option<Duration> {
        let mut sent_at = self.ping_sent_at.write();
        let elapsed = sent_at.as_ref()?.elapsed();
        if elapsed < timeout {
            return None;
        }
        *sent_at = None;
        self.missed_pongs.fetch_add(1, Ordering::SeqCst);
        Some(elapsed)
    }

    /// Forget the outstanding ping, e.g. after the connection dropped.
    pub fn reset(&self) {
        *self.ping_sent_at.write() = None;
    }
}

/// Periodic pinger bound to one stream.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use market_stream_client::application::ports::MarketStreamPort;
/// use market_stream_client::application::services::{KeepAlive, KeepAliveConfig};
/// use tokio_util::sync::CancellationToken;
///
/// fn spawn_keepalive(stream: Arc<dyn MarketStreamPort>, cancel: CancellationToken) {
///     let keepalive = KeepAlive::new(KeepAliveConfig::default(), stream, cancel);
///     tokio::spawn(keepalive.run());
/// }
/// ```
pub struct KeepAlive {
    config: KeepAliveConfig,
    stream: Arc<dyn MarketStreamPort>,
    state: Arc<KeepAliveState>,
    cancel: CancellationToken,
}

impl KeepAlive {
    /// Create a new keep-alive bound to `stream`.
    #[must_use]
    pub fn new(
        config: KeepAliveConfig,
        stream: Arc<dyn MarketStreamPort>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            stream,
            state: Arc::new(KeepAliveState::new()),
            cancel,
        }
    }

    /// Get the shared ping/pong state.
    #[must_use]
    pub fn state(&self) -> Arc<KeepAliveState> {
        Arc::clone(&self.state)
    }

    /// Run the keep-alive loop until cancelled.
    pub async fn run(self) {
        let pong_topic = Topic::Kind(MessageKind::Pong);
        let state = Arc::clone(&self.state);
        let on_pong: Handler = Arc::new(move |_: &Delivery| state.record_pong());
        let pong_id = self.stream.on(pong_topic, on_pong);

        let mut state_rx = self.stream.watch_state();
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Keep-alive cancelled");
                    break;
                }
                Ok(()) = state_rx.changed() => {
                    if !state_rx.borrow_and_update().connected {
                        self.state.reset();
                    }
                }
                _ = interval.tick() => self.check_and_ping(),
            }
        }

        self.stream.off(pong_topic, pong_id);
    }

    fn check_and_ping(&self) {
        if !self.stream.state().connected {
            self.state.reset();
            return;
        }

        if let Some(elapsed) = self.state.take_overdue(self.config.pong_timeout) {
            tracing::warn!(
                elapsed_secs = elapsed.as_secs(),
                timeout_secs = self.config.pong_timeout.as_secs(),
                missed = self.state.missed_pongs(),
                "No pong received in time"
            );
        }

        match self.stream.ping() {
            Ok(()) => self.state.mark_ping_sent(),
            Err(e) => tracing::debug!(error = %e, "Ping not sent"),
        }
    }
}
