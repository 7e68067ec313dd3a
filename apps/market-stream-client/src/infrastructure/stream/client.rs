//! Market Data Stream Client
//!
//! Owns the single WebSocket connection to the market data server and
//! multiplexes it between any number of in-process consumers.
//!
//! # Lifecycle
//!
//! - `connect()` opens the transport, or joins an attempt already in flight.
//! - Every successful (re)connect resets the backoff and replays the full
//!   subscription set as one `subscribe` command.
//! - An unexpected closure schedules a reconnect with exponential backoff.
//!   Once the attempt budget is spent the state is terminal until the caller
//!   connects again.
//! - `disconnect()` is intentional: it clears the subscription set and never
//!   triggers a reconnect.
//!
//! Each transport runs on its own task and carries an epoch number; closure
//! notices from a superseded transport are ignored.
//!
//! Background tasks hold a reference to the client, so it stays alive until
//! `disconnect()` is called.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::codec::{CodecError, FrameCodec};
use super::dispatcher::Dispatcher;
use super::messages::Command;
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{MarketStreamError, MarketStreamPort};
use crate::domain::pricing::PriceCache;
use crate::domain::streaming::{ConnectionState, Envelope, Handler, HandlerId, MessageKind, Topic};
use crate::domain::subscription::{SubscriptionChanges, SubscriptionRegistry, normalize_symbol};
use crate::infrastructure::config::ClientSettings;
use crate::infrastructure::metrics;

/// Shared handle to the stream client.
pub type SharedStreamClient = Arc<StreamClient>;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type ConnectFuture = Shared<BoxFuture<'static, Result<(), StreamError>>>;

// =============================================================================
// Error Type
// =============================================================================

/// Errors surfaced by the stream client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Transport could not be established.
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    /// Handshake did not complete in time.
    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),

    /// No transport is open.
    #[error("not connected")]
    NotConnected,

    /// Attempt abandoned because `disconnect()` was called.
    #[error("connection attempt cancelled")]
    Cancelled,

    /// Transport task is no longer accepting commands.
    #[error("failed to queue command")]
    SendFailed,
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the stream client.
#[derive(Debug, Clone)]
pub struct StreamClientConfig {
    /// WebSocket endpoint URL.
    pub url: String,
    /// Bound on the TCP + WebSocket handshake.
    pub connect_timeout: Duration,
    /// How long `get_price` / `get_snapshot` wait for an answer.
    pub request_timeout: Duration,
    /// Reconnection backoff.
    pub reconnect: ReconnectConfig,
}

impl StreamClientConfig {
    /// Create a configuration for `url` with default timeouts and backoff.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_millis(5000),
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Create configuration from client settings.
    #[must_use]
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            url: settings.stream_url.clone(),
            connect_timeout: settings.connect_timeout,
            request_timeout: settings.request_timeout,
            reconnect: ReconnectConfig::from_settings(settings),
        }
    }
}

// =============================================================================
// Internal State
// =============================================================================

#[derive(Debug, Default)]
struct Link {
    epoch: u64,
    outbound: Option<mpsc::UnboundedSender<Command>>,
    cancel: Option<CancellationToken>,
    connection_id: Option<String>,
}

#[derive(Debug)]
struct Lifecycle {
    policy: ReconnectPolicy,
    exhausted: bool,
    intentional_close: bool,
    reconnect_task: Option<JoinHandle<()>>,
}

// =============================================================================
// Stream Client
// =============================================================================

/// Reconnecting, multiplexed market data stream client.
///
/// Construct once and share as [`SharedStreamClient`].
pub struct StreamClient {
    config: StreamClientConfig,
    codec: FrameCodec,
    // Lock order: link, then registry. Lifecycle is never nested.
    link: Mutex<Link>,
    lifecycle: Mutex<Lifecycle>,
    pending_connect: Mutex<Option<ConnectFuture>>,
    registry: SubscriptionRegistry,
    dispatcher: Dispatcher,
    price_cache: Arc<PriceCache>,
    state_tx: watch::Sender<ConnectionState>,
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("url", &self.config.url)
            .field("state", &*self.state_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl StreamClient {
    /// Create a disconnected client.
    #[must_use]
    pub fn new(config: StreamClientConfig) -> Self {
        let policy = ReconnectPolicy::new(config.reconnect.clone());
        let (state_tx, _) = watch::channel(ConnectionState::default());

        Self {
            config,
            codec: FrameCodec::new(),
            link: Mutex::new(Link::default()),
            lifecycle: Mutex::new(Lifecycle {
                policy,
                exhausted: false,
                intentional_close: false,
                reconnect_task: None,
            }),
            pending_connect: Mutex::new(None),
            registry: SubscriptionRegistry::new(),
            dispatcher: Dispatcher::new(),
            price_cache: Arc::new(PriceCache::new()),
            state_tx,
        }
    }

    /// Create a disconnected client behind an `Arc`.
    #[must_use]
    pub fn shared(config: StreamClientConfig) -> SharedStreamClient {
        Arc::new(Self::new(config))
    }

    /// Get the client configuration.
    #[must_use]
    pub const fn config(&self) -> &StreamClientConfig {
        &self.config
    }

    // =========================================================================
    // Connection management
    // =========================================================================

    /// Open the transport.
    ///
    /// Resolves immediately when already open. Concurrent calls share one
    /// attempt. A failed attempt is also handed to the backoff policy, so the
    /// connection keeps trying in the background.
    ///
    /// # Errors
    ///
    /// Returns the failure of this attempt.
    pub async fn connect(self: &Arc<Self>) -> Result<(), StreamError> {
        {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.intentional_close = false;
            if lifecycle.exhausted {
                lifecycle.exhausted = false;
                lifecycle.policy.reset();
            }
            // The scheduled task only calls `attempt_connect`, never this.
            if let Some(task) = lifecycle.reconnect_task.take() {
                task.abort();
            }
        }

        if self.is_open() {
            return Ok(());
        }

        self.attempt_connect().await
    }

    /// Close the transport, clear subscriptions and stop reconnecting.
    pub fn disconnect(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.intentional_close = true;
            lifecycle.exhausted = false;
            lifecycle.policy.reset();
            if let Some(task) = lifecycle.reconnect_task.take() {
                task.abort();
            }
        }

        self.pending_connect.lock().take();

        let removed = {
            let mut link = self.link.lock();
            link.epoch += 1;
            link.outbound = None;
            link.connection_id = None;
            if let Some(cancel) = link.cancel.take() {
                cancel.cancel();
            }
            self.registry.clear()
        };

        tracing::info!(
            cleared_symbols = removed.len(),
            "Disconnected from market data stream"
        );
        metrics::set_connection_status(false);
        metrics::set_subscribed_symbols(0);
        self.publish_state();
    }

    /// Whether a transport is currently open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.link.lock().outbound.is_some()
    }

    /// Server-assigned identifier of the current connection.
    #[must_use]
    pub fn connection_id(&self) -> Option<String> {
        self.link.lock().connection_id.clone()
    }

    fn attempt_connect(self: &Arc<Self>) -> ConnectFuture {
        let mut pending = self.pending_connect.lock();
        if let Some(in_flight) = pending.as_ref() {
            return in_flight.clone();
        }

        let this = Arc::clone(self);
        let attempt = async move {
            let result = this.open_transport().await;
            this.pending_connect.lock().take();

            match &result {
                Ok(()) => {}
                Err(StreamError::Cancelled) => {
                    tracing::debug!("Connection attempt abandoned after disconnect");
                }
                Err(e) => {
                    tracing::warn!(error = %e, url = %this.config.url, "Market data connection failed");
                    this.schedule_reconnect();
                }
            }
            result
        }
        .boxed()
        .shared();

        *pending = Some(attempt.clone());
        attempt
    }

    async fn open_transport(self: &Arc<Self>) -> Result<(), StreamError> {
        if self.is_open() {
            return Ok(());
        }

        tracing::info!(url = %self.config.url, "Connecting to market data stream");

        let handshake = tokio_tungstenite::connect_async(self.config.url.as_str());
        let (ws, _response) = match tokio::time::timeout(self.config.connect_timeout, handshake)
            .await
        {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(StreamError::ConnectionFailed(e.to_string())),
            Err(_) => return Err(StreamError::Timeout(self.config.connect_timeout)),
        };

        let cancelled = self.lifecycle.lock().intentional_close;
        if cancelled {
            return Err(StreamError::Cancelled);
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let (epoch, replayed) = {
            let mut link = self.link.lock();
            link.epoch += 1;

            let symbols = self.registry.symbols();
            let replayed = symbols.len();
            if !symbols.is_empty() {
                // Receiver is alive: it is held by this function.
                let _ = outbound_tx.send(Command::Subscribe { symbols });
            }

            link.outbound = Some(outbound_tx);
            link.cancel = Some(cancel.clone());
            link.connection_id = None;
            (link.epoch, replayed)
        };

        {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.policy.reset();
            lifecycle.exhausted = false;
        }

        tracing::info!(epoch, replayed, "Connected to market data stream");
        metrics::set_connection_status(true);
        self.publish_state();

        tokio::spawn(Arc::clone(self).run_transport(epoch, ws, outbound_rx, cancel));

        Ok(())
    }

    async fn run_transport(
        self: Arc<Self>,
        epoch: u64,
        ws: WsStream,
        mut outbound: mpsc::UnboundedReceiver<Command>,
        cancel: CancellationToken,
    ) {
        let (mut write, mut read) = ws.split();

        let unexpected = loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    break false;
                }
                command = outbound.recv() => {
                    let Some(command) = command else {
                        let _ = write.send(Message::Close(None)).await;
                        break false;
                    };

                    let json = match self.codec.encode(&command) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::warn!(error = %e, action = command.action(), "Failed to encode command");
                            continue;
                        }
                    };

                    tracing::debug!(action = command.action(), "Sending command");
                    if let Err(e) = write.send(Message::Text(json.into())).await {
                        tracing::warn!(error = %e, "Failed to send command");
                        break true;
                    }
                    metrics::record_command_sent(command.action());
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_frame(epoch, self.codec.decode(&text));
                        }
                        Some(Ok(Message::Binary(data))) => {
                            self.handle_frame(epoch, self.codec.decode_bytes(&data));
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                tracing::warn!(error = %e, "Failed to answer ping");
                                break true;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(?frame, "Server sent close frame");
                            break true;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "Market data stream error");
                            break true;
                        }
                        None => {
                            tracing::info!("Market data stream ended");
                            break true;
                        }
                    }
                }
            }
        };

        self.on_transport_closed(epoch, unexpected);
    }

    fn on_transport_closed(self: &Arc<Self>, epoch: u64, unexpected: bool) {
        {
            let mut link = self.link.lock();
            if link.epoch != epoch {
                return;
            }
            link.outbound = None;
            link.cancel = None;
            link.connection_id = None;
        }

        metrics::set_connection_status(false);

        if unexpected {
            tracing::warn!(epoch, "Market data stream closed unexpectedly");
            self.schedule_reconnect();
        } else {
            tracing::debug!(epoch, "Market data transport closed");
        }
        self.publish_state();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.intentional_close {
                return;
            }

            match lifecycle.policy.try_next_delay() {
                Ok(delay) => {
                    let attempt = lifecycle.policy.attempt_count();
                    tracing::info!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        "Reconnecting to market data stream"
                    );
                    metrics::record_reconnect_attempt();

                    if let Some(previous) = lifecycle.reconnect_task.take()
                        && Some(previous.id()) != tokio::task::try_id()
                    {
                        previous.abort();
                    }

                    let this = Arc::clone(self);
                    lifecycle.reconnect_task = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Err(e) = this.attempt_connect().await {
                            tracing::debug!(attempt, error = %e, "Reconnect attempt failed");
                        }
                    }));
                }
                Err(e) => {
                    lifecycle.exhausted = true;
                    tracing::error!(error = %e, "Reconnect stopped; call connect() to retry");
                }
            }
        }
        self.publish_state();
    }

    // =========================================================================
    // Inbound frames
    // =========================================================================

    fn handle_frame(&self, epoch: u64, decoded: Result<Envelope, CodecError>) {
        match decoded {
            Ok(envelope) => self.handle_envelope(epoch, envelope),
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed frame");
                metrics::record_frame_dropped(&e);
            }
        }
    }

    fn handle_envelope(&self, epoch: u64, envelope: Envelope) {
        metrics::record_frame_received(envelope.kind());

        if let Envelope::Connected { connection_id } = &envelope {
            let current = {
                let mut link = self.link.lock();
                let current = link.epoch == epoch;
                if current {
                    link.connection_id = Some(connection_id.clone());
                }
                current
            };
            if current {
                tracing::info!(connection_id = %connection_id, "Connection acknowledged");
                self.publish_state();
            }
        }

        self.dispatcher.dispatch(envelope);
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Add symbols to the shared subscription set.
    ///
    /// Only newly added symbols are sent, and only when the transport is
    /// open; otherwise they go out with the replay on the next connect.
    pub fn subscribe<I, S>(&self, symbols: I) -> SubscriptionChanges
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let changes = {
            let link = self.link.lock();
            let changes = self.registry.add(symbols);
            if !changes.added.is_empty()
                && let Some(tx) = &link.outbound
            {
                let _ = tx.send(Command::Subscribe {
                    symbols: changes.added.clone(),
                });
            }
            changes
        };

        if !changes.is_empty() {
            tracing::debug!(symbols = ?changes.added, "Subscribed");
            metrics::set_subscribed_symbols(self.registry.len());
            self.publish_state();
        }
        changes
    }

    /// Remove symbols from the shared subscription set.
    ///
    /// Only symbols that were actually subscribed are sent.
    pub fn unsubscribe<I, S>(&self, symbols: I) -> SubscriptionChanges
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let changes = {
            let link = self.link.lock();
            let changes = self.registry.remove(symbols);
            if !changes.removed.is_empty()
                && let Some(tx) = &link.outbound
            {
                let _ = tx.send(Command::Unsubscribe {
                    symbols: changes.removed.clone(),
                });
            }
            changes
        };

        if !changes.is_empty() {
            tracing::debug!(symbols = ?changes.removed, "Unsubscribed");
            metrics::set_subscribed_symbols(self.registry.len());
            self.publish_state();
        }
        changes
    }

    /// Symbols in the shared subscription set, sorted.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.registry.symbols()
    }

    // =========================================================================
    // Commands and queries
    // =========================================================================

    /// Send a keep-alive ping.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::NotConnected`] when no transport is open.
    pub fn ping(&self) -> Result<(), StreamError> {
        self.send(Command::Ping)
    }

    /// Ask the server for the current price of `symbol`.
    ///
    /// Returns `None` when not connected, on timeout, or when the server
    /// has no price.
    pub async fn get_price(&self, symbol: &str) -> Option<Decimal> {
        let symbol = normalize_symbol(symbol)?;
        let command = Command::GetPrice {
            symbol: symbol.clone(),
        };

        match self.request(MessageKind::Price, &symbol, command).await? {
            Envelope::Price { price, .. } => price,
            _ => None,
        }
    }

    /// Ask the server for a snapshot of `symbol`.
    ///
    /// Returns `None` when not connected or on timeout.
    pub async fn get_snapshot(&self, symbol: &str) -> Option<serde_json::Value> {
        let symbol = normalize_symbol(symbol)?;
        let command = Command::GetSnapshot {
            symbol: symbol.clone(),
        };

        match self.request(MessageKind::Snapshot, &symbol, command).await? {
            Envelope::Snapshot { data, .. } => Some(data),
            _ => None,
        }
    }

    async fn request(&self, kind: MessageKind, symbol: &str, command: Command) -> Option<Envelope> {
        // Register first so an immediate answer cannot be missed.
        let pending = self.dispatcher.expect_response(kind, symbol);

        if let Err(e) = self.send(command) {
            tracing::debug!(kind = %kind, symbol, error = %e, "Query not sent");
            return None;
        }

        pending.wait(self.config.request_timeout).await
    }

    fn send(&self, command: Command) -> Result<(), StreamError> {
        let link = self.link.lock();
        let tx = link.outbound.as_ref().ok_or(StreamError::NotConnected)?;
        tx.send(command).map_err(|_| StreamError::SendFailed)
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    /// Register a handler for a topic.
    pub fn on(&self, topic: impl Into<Topic>, handler: Handler) -> HandlerId {
        self.dispatcher.on(topic, handler)
    }

    /// Remove a handler registration.
    pub fn off(&self, topic: impl Into<Topic>, id: HandlerId) -> bool {
        self.dispatcher.off(topic, id)
    }

    /// Get the envelope dispatcher.
    #[must_use]
    pub const fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Get the previous-price cache shared by all aggregators.
    #[must_use]
    pub fn price_cache(&self) -> Arc<PriceCache> {
        Arc::clone(&self.price_cache)
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        let (connected, connection_id) = {
            let link = self.link.lock();
            (link.outbound.is_some(), link.connection_id.clone())
        };
        let (reconnect_attempts, reconnect_exhausted) = {
            let lifecycle = self.lifecycle.lock();
            (lifecycle.policy.attempt_count(), lifecycle.exhausted)
        };

        ConnectionState {
            connected,
            connection_id,
            subscribed_symbols: self.registry.snapshot(),
            reconnect_attempts,
            reconnect_exhausted,
        }
    }

    /// Observe connection state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn publish_state(&self) {
        // Snapshot under the channel lock so publishers serialize.
        self.state_tx.send_if_modified(|current| {
            let state = self.state();
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

// =============================================================================
// Port Implementation
// =============================================================================

impl From<StreamError> for MarketStreamError {
    fn from(error: StreamError) -> Self {
        match error {
            StreamError::NotConnected => Self::NotConnected,
            other => Self::Unavailable {
                message: other.to_string(),
            },
        }
    }
}

#[async_trait]
impl MarketStreamPort for StreamClient {
    fn subscribe(&self, symbols: &[String]) -> SubscriptionChanges {
        Self::subscribe(self, symbols)
    }

    fn unsubscribe(&self, symbols: &[String]) -> SubscriptionChanges {
        Self::unsubscribe(self, symbols)
    }

    fn on(&self, topic: Topic, handler: Handler) -> HandlerId {
        Self::on(self, topic, handler)
    }

    fn off(&self, topic: Topic, id: HandlerId) -> bool {
        Self::off(self, topic, id)
    }

    fn ping(&self) -> Result<(), MarketStreamError> {
        Self::ping(self).map_err(Into::into)
    }

    fn state(&self) -> ConnectionState {
        Self::state(self)
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        Self::watch_state(self)
    }

    fn price_cache(&self) -> Arc<PriceCache> {
        Self::price_cache(self)
    }

    async fn get_price(&self, symbol: &str) -> Option<Decimal> {
        Self::get_price(self, symbol).await
    }

    async fn get_snapshot(&self, symbol: &str) -> Option<serde_json::Value> {
        Self::get_snapshot(self, symbol).await
    }
}
