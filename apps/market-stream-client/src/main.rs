//! Market Stream Watcher Binary
//!
//! Connects to the market data stream, follows a set of symbols and logs
//! every price board update and connection state change.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-stream-watch -- AAPL MSFT
//! ```
//!
//! Symbols given on the command line take precedence over
//! `MARKET_STREAM_SYMBOLS`.
//!
//! # Environment Variables
//!
//! - `MARKET_STREAM_API_URL`: Backend base URL (default: <http://localhost:8000>)
//! - `MARKET_STREAM_SYMBOLS`: Comma-separated symbols to follow
//! - `MARKET_STREAM_METRICS_PORT`: Prometheus metrics port (default: 0, disabled)
//! - `MARKET_STREAM_KEEPALIVE_INTERVAL_SECS`: Ping interval (default: 30)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;

use futures::future::join_all;
use market_stream_client::infrastructure::telemetry;
use market_stream_client::{
    ClientSettings, ConnectionState, KeepAlive, KeepAliveConfig, MarketStreamPort, PriceAggregator,
    PriceBoard, StreamClient, StreamClientConfig, init_metrics,
};
use tokio::signal;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting market stream watcher");

    let settings = ClientSettings::from_env()?;
    if let Err(e) = init_metrics(settings.metrics_port()) {
        tracing::warn!(error = %e, "Metrics disabled");
    }

    let symbols = requested_symbols(&settings);
    log_config(&settings, &symbols);

    let shutdown_token = CancellationToken::new();
    let client = StreamClient::shared(StreamClientConfig::from_settings(&settings));

    if let Err(e) = client.connect().await {
        tracing::warn!(error = %e, "Initial connect failed, retrying in background");
    }

    let stream: Arc<dyn MarketStreamPort> = client.clone();
    let aggregator = PriceAggregator::new(Arc::clone(&stream), &symbols);

    let keepalive = KeepAlive::new(
        KeepAliveConfig::from_settings(&settings),
        Arc::clone(&stream),
        shutdown_token.clone(),
    );
    let keepalive_handle = tokio::spawn(keepalive.run());

    tokio::spawn(log_board(aggregator.watch(), shutdown_token.clone()));
    tokio::spawn(log_state(client.watch_state(), shutdown_token.clone()));

    seed_prices(&aggregator).await;

    tracing::info!("Market stream watcher ready");

    await_shutdown(shutdown_token).await;

    aggregator.close();
    client.disconnect();
    if let Err(e) = keepalive_handle.await {
        tracing::warn!(error = %e, "Keep-alive task failed");
    }

    tracing::info!("Market stream watcher stopped");
    Ok(())
}

/// Symbols from the command line, else from settings.
fn requested_symbols(settings: &ClientSettings) -> Vec<String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        settings.symbols.clone()
    } else {
        args
    }
}

/// Seed every followed symbol from a price query, all at once.
async fn seed_prices(aggregator: &PriceAggregator) {
    let symbols = aggregator.symbols();
    let seeded = join_all(symbols.iter().map(|symbol| aggregator.refresh(symbol))).await;
    for (symbol, price) in symbols.iter().zip(seeded) {
        if let Some(price) = price {
            tracing::info!(symbol = %symbol, %price, "Seeded price");
        }
    }
}

/// Log the parsed configuration.
fn log_config(settings: &ClientSettings, symbols: &[String]) {
    tracing::info!(
        stream_url = %settings.stream_url,
        symbols = ?symbols,
        metrics_port = settings.metrics_port,
        "Configuration loaded"
    );
    tracing::debug!(
        connect_timeout_secs = settings.connect_timeout.as_secs(),
        request_timeout_ms = settings.request_timeout.as_millis(),
        max_reconnect_attempts = settings.max_reconnect_attempts,
        keepalive_interval_secs = settings.keepalive_interval.as_secs(),
        "Stream settings"
    );
}

/// Log every board update until shutdown.
async fn log_board(mut board_rx: watch::Receiver<PriceBoard>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            changed = board_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let board = board_rx.borrow_and_update().clone();
                for view in board.values().filter(|view| view.has_data()) {
                    tracing::info!(
                        symbol = %view.symbol,
                        price = ?view.price,
                        bid = ?view.bid_price,
                        ask = ?view.ask_price,
                        change = %view.change,
                        change_percent = %view.change_percent,
                        "Price update"
                    );
                }
            }
        }
    }
}

/// Log every connection state change until shutdown.
async fn log_state(mut state_rx: watch::Receiver<ConnectionState>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = state_rx.borrow_and_update().clone();
                if state.reconnect_exhausted {
                    tracing::error!(
                        attempts = state.reconnect_attempts,
                        "Reconnect attempts exhausted, stream is down"
                    );
                } else {
                    tracing::info!(
                        connected = state.connected,
                        connection_id = ?state.connection_id,
                        subscribed = state.subscribed_symbols.len(),
                        reconnect_attempts = state.reconnect_attempts,
                        "Connection state changed"
                    );
                }
            }
        }
    }
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }

    shutdown_token.cancel();
}
