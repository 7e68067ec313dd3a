//! In-process WebSocket server speaking the market data protocol.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use market_stream_client::{ReconnectConfig, StreamClientConfig};

#[derive(Debug, Clone)]
enum Push {
    Text(String),
    Drop,
}

#[derive(Default)]
struct Shared {
    connections: AtomicUsize,
    commands: Mutex<Vec<(usize, Value)>>,
    prices: Mutex<HashMap<String, String>>,
    answer_snapshots: AtomicBool,
}

/// Test server: records every command and answers `ping`, `get_price`
/// and `get_snapshot` the way the backend does.
pub struct MockServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    push_tx: broadcast::Sender<Push>,
    handle: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared::default());
        let (push_tx, _) = broadcast::channel(64);

        let accept_shared = Arc::clone(&shared);
        let accept_push = push_tx.clone();
        let handle = tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let index = accept_shared.connections.fetch_add(1, Ordering::SeqCst);
                let shared = Arc::clone(&accept_shared);
                let push_rx = accept_push.subscribe();
                tokio::spawn(async move {
                    if let Ok(ws) = tokio_tungstenite::accept_async(tcp).await {
                        serve(index, ws, shared, push_rx).await;
                    }
                });
            }
        });

        Self {
            addr,
            shared,
            push_tx,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws/market-data", self.addr)
    }

    /// Client config with fast reconnects.
    pub fn client_config(&self) -> StreamClientConfig {
        StreamClientConfig {
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_millis(500),
            reconnect: fast_reconnect(5),
            ..StreamClientConfig::new(self.url())
        }
    }

    /// Number of WebSocket connections accepted so far.
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// All commands received, tagged with the connection index.
    pub fn commands(&self) -> Vec<(usize, Value)> {
        self.shared.commands.lock().clone()
    }

    /// Commands with the given `action`.
    pub fn commands_with_action(&self, action: &str) -> Vec<(usize, Value)> {
        self.commands()
            .into_iter()
            .filter(|(_, cmd)| cmd["action"] == action)
            .collect()
    }

    /// Answer `get_price` for `symbol` with `price`.
    pub fn set_price(&self, symbol: &str, price: &str) {
        self.shared
            .prices
            .lock()
            .insert(symbol.to_string(), price.to_string());
    }

    /// Answer `get_snapshot` for any symbol.
    pub fn answer_snapshots(&self) {
        self.shared.answer_snapshots.store(true, Ordering::SeqCst);
    }

    /// Send a raw text frame on every open connection.
    pub fn push_text(&self, text: impl Into<String>) {
        let _ = self.push_tx.send(Push::Text(text.into()));
    }

    /// Send a JSON frame on every open connection.
    pub fn push(&self, value: &Value) {
        self.push_text(value.to_string());
    }

    /// Drop every open connection without a close handshake.
    pub fn drop_connections(&self) {
        let _ = self.push_tx.send(Push::Drop);
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
        let _ = self.push_tx.send(Push::Drop);
    }
}

async fn serve(
    index: usize,
    mut ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    shared: Arc<Shared>,
    mut push_rx: broadcast::Receiver<Push>,
) {
    let hello = json!({"type": "connected", "connection_id": format!("conn-{}", index + 1)});
    if ws.send(Message::Text(hello.to_string().into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            frame = ws.next() => {
                let Some(Ok(frame)) = frame else { return };
                let Message::Text(text) = frame else { continue };
                let Ok(command) = serde_json::from_str::<Value>(text.as_str()) else { continue };

                shared.commands.lock().push((index, command.clone()));

                if let Some(reply) = reply_to(&command, &shared)
                    && ws.send(Message::Text(reply.to_string().into())).await.is_err()
                {
                    return;
                }
            }
            push = push_rx.recv() => match push {
                Ok(Push::Text(text)) => {
                    if ws.send(Message::Text(text.into())).await.is_err() {
                        return;
                    }
                }
                Ok(Push::Drop) | Err(_) => return,
            },
        }
    }
}

fn reply_to(command: &Value, shared: &Shared) -> Option<Value> {
    let symbol = command["symbol"].as_str().unwrap_or_default();
    match command["action"].as_str()? {
        "ping" => Some(json!({"type": "pong"})),
        "get_price" => {
            let price = shared.prices.lock().get(symbol).cloned()?;
            Some(json!({"type": "price", "symbol": symbol, "price": price}))
        }
        "get_snapshot" if shared.answer_snapshots.load(Ordering::SeqCst) => Some(json!({
            "type": "snapshot",
            "symbol": symbol,
            "data": {"symbol": symbol, "open": "100.00", "volume": 1000}
        })),
        _ => None,
    }
}

/// TCP listener that counts accepted sockets and drops them before the
/// WebSocket handshake, so every connect attempt fails.
pub struct RefusingServer {
    addr: SocketAddr,
    accepts: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl RefusingServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&accepts);
        let handle = tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(tcp);
            }
        });

        Self {
            addr,
            accepts,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws/market-data", self.addr)
    }

    /// Number of TCP connections accepted so far.
    pub fn accepts(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }
}

impl Drop for RefusingServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Backoff with millisecond delays and a small attempt budget.
pub fn fast_reconnect(max_attempts: u32) -> ReconnectConfig {
    ReconnectConfig {
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(50),
        multiplier: 2.0,
        jitter_factor: 0.0,
        max_attempts,
    }
}

/// A `ws://` URL on a port nobody listens on.
pub async fn unreachable_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{addr}/ws/market-data")
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Await `future` with a two second bound.
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), future)
        .await
        .expect("timed out")
}
