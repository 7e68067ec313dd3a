//! Envelope Dispatcher
//!
//! Fans each inbound envelope out to every handler registered for its kind,
//! then to wildcard handlers, and resolves one-shot request correlators.
//!
//! Handlers run synchronously on the transport task, in registration order,
//! before the next frame is read. A handler that panics is logged and
//! skipped; the remaining handlers still run.
//!
//! Correlators are keyed by `(response kind, symbol)`. Every waiter on a key
//! is resolved by the first matching envelope and then removed. A waiter that
//! times out or is dropped removes itself.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;

use crate::domain::streaming::{Delivery, Envelope, Handler, HandlerId, MessageKind, Topic};
use crate::infrastructure::metrics;

// =============================================================================
// Types
// =============================================================================

struct Registration {
    id: HandlerId,
    handler: Handler,
}

type RequestKey = (MessageKind, String);

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Envelope>,
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Per-kind handler sets plus the request correlation table.
pub struct Dispatcher {
    handlers: RwLock<HashMap<Topic, Vec<Registration>>>,
    pending: Mutex<HashMap<RequestKey, Vec<Waiter>>>,
    next_handler_id: AtomicU64,
    next_request_id: AtomicU64,
    seq: AtomicU64,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("topics", &self.handlers.read().len())
            .field("pending", &self.pending.lock().len())
            .field("seq", &self.seq.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Create a dispatcher with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_handler_id: AtomicU64::new(1),
            next_request_id: AtomicU64::new(1),
            seq: AtomicU64::new(0),
        }
    }

    /// Register a handler for a topic.
    ///
    /// Registering the same handler under several topics yields one id per
    /// registration; each can be removed independently.
    pub fn on(&self, topic: impl Into<Topic>, handler: Handler) -> HandlerId {
        let id = HandlerId::new(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(topic.into())
            .or_default()
            .push(Registration { id, handler });
        id
    }

    /// Remove a handler registration.
    ///
    /// Returns `false` if `id` was not registered under `topic`.
    pub fn off(&self, topic: impl Into<Topic>, id: HandlerId) -> bool {
        let topic = topic.into();
        let mut handlers = self.handlers.write();
        let Some(registrations) = handlers.get_mut(&topic) else {
            return false;
        };

        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        let removed = registrations.len() != before;

        if registrations.is_empty() {
            handlers.remove(&topic);
        }
        removed
    }

    /// Number of handlers registered under `topic`.
    #[must_use]
    pub fn handler_count(&self, topic: impl Into<Topic>) -> usize {
        self.handlers.read().get(&topic.into()).map_or(0, Vec::len)
    }

    /// Deliver an envelope to its handlers and resolve matching requests.
    ///
    /// Returns the sequence number assigned to the envelope.
    pub fn dispatch(&self, envelope: Envelope) -> u64 {
        let started = Instant::now();
        let kind = envelope.kind();
        let delivery = Delivery {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            received_at: Utc::now(),
            envelope,
        };

        // Snapshot so handlers may call on/off without deadlocking.
        let targets: Vec<Handler> = {
            let handlers = self.handlers.read();
            [Topic::Kind(kind), Topic::Any]
                .iter()
                .filter_map(|topic| handlers.get(topic))
                .flatten()
                .map(|r| Arc::clone(&r.handler))
                .collect()
        };

        for handler in targets {
            if catch_unwind(AssertUnwindSafe(|| handler(&delivery))).is_err() {
                tracing::error!(kind = %kind, seq = delivery.seq, "Envelope handler panicked");
                metrics::record_handler_panic(kind);
            }
        }

        self.resolve(&delivery.envelope);
        metrics::record_dispatch_duration(started.elapsed());

        delivery.seq
    }

    fn resolve(&self, envelope: &Envelope) {
        let Some(symbol) = envelope.symbol() else {
            return;
        };

        let waiters = self
            .pending
            .lock()
            .remove(&(envelope.kind(), symbol.to_uppercase()));

        for waiter in waiters.into_iter().flatten() {
            // Receiver gone means the caller stopped waiting.
            let _ = waiter.tx.send(envelope.clone());
        }
    }

    // =========================================================================
    // Request correlation
    // =========================================================================

    /// Register a one-shot waiter for the next `kind` envelope for `symbol`.
    ///
    /// Register before sending the request so a fast answer is not missed.
    #[must_use]
    pub fn expect_response(&self, kind: MessageKind, symbol: &str) -> PendingRequest<'_> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let key = (kind, symbol.to_uppercase());
        let (tx, rx) = oneshot::channel();

        self.pending
            .lock()
            .entry(key.clone())
            .or_default()
            .push(Waiter { id, tx });

        PendingRequest {
            dispatcher: self,
            key,
            id,
            rx,
        }
    }

    /// Number of outstanding waiters for `(kind, symbol)`.
    #[must_use]
    pub fn pending_requests(&self, kind: MessageKind, symbol: &str) -> usize {
        self.pending
            .lock()
            .get(&(kind, symbol.to_uppercase()))
            .map_or(0, Vec::len)
    }

    fn cancel(&self, key: &RequestKey, id: u64) {
        let mut pending = self.pending.lock();
        if let Some(waiters) = pending.get_mut(key) {
            waiters.retain(|w| w.id != id);
            if waiters.is_empty() {
                pending.remove(key);
            }
        }
    }
}

// =============================================================================
// Pending Request
// =============================================================================

/// A registered correlator awaiting its response.
///
/// Dropping it, whether after a response, a timeout or cancellation of the
/// awaiting task, removes it from the correlation table.
pub struct PendingRequest<'a> {
    dispatcher: &'a Dispatcher,
    key: RequestKey,
    id: u64,
    rx: oneshot::Receiver<Envelope>,
}

impl fmt::Debug for PendingRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("kind", &self.key.0)
            .field("symbol", &self.key.1)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl PendingRequest<'_> {
    /// Wait up to `timeout` for the response.
    ///
    /// Returns `None` on timeout.
    pub async fn wait(mut self, timeout: Duration) -> Option<Envelope> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(envelope)) => Some(envelope),
            Ok(Err(_)) => None,
            Err(_) => {
                tracing::debug!(
                    kind = %self.key.0,
                    symbol = %self.key.1,
                    timeout_ms = timeout.as_millis(),
                    "Request timed out"
                );
                metrics::record_request_timeout(self.key.0);
                None
            }
        }
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.dispatcher.cancel(&self.key, self.id);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use rust_decimal::Decimal;

    fn counting_handler(counter: &Arc<AtomicUsize>) -> Handler {
        let counter = Arc::clone(counter);
        Arc::new(move |_: &Delivery| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn failing_handler(_: &Delivery) {
        panic!("handler failure");
    }

    fn quote(symbol: &str) -> Envelope {
        Envelope::Quote {
            symbol: symbol.to_string(),
            data: crate::domain::streaming::Quote::default(),
        }
    }

    fn price(symbol: &str, value: i64) -> Envelope {
        Envelope::Price {
            symbol: symbol.to_string(),
            price: Some(Decimal::from(value)),
        }
    }

    #[test]
    fn fan_out_reaches_every_handler_once() {
        let dispatcher = Dispatcher::new();
        let counters: Vec<Arc<AtomicUsize>> =
            (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let ids: Vec<HandlerId> = counters
            .iter()
            .map(|c| dispatcher.on(MessageKind::Quote, counting_handler(c)))
            .collect();

        dispatcher.dispatch(quote("AAPL"));
        for counter in &counters {
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        }

        assert!(dispatcher.off(MessageKind::Quote, ids[1]));
        dispatcher.dispatch(quote("AAPL"));

        assert_eq!(counters[0].load(Ordering::SeqCst), 2);
        assert_eq!(counters[1].load(Ordering::SeqCst), 1);
        assert_eq!(counters[2].load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.handler_count(MessageKind::Quote), 2);
    }

    #[test]
    fn handlers_only_see_their_kind() {
        let dispatcher = Dispatcher::new();
        let trades = Arc::new(AtomicUsize::new(0));
        dispatcher.on(MessageKind::Trade, counting_handler(&trades));

        dispatcher.dispatch(quote("AAPL"));

        assert_eq!(trades.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn wildcard_runs_after_exact_handlers() {
        let dispatcher = Dispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        dispatcher.on(Topic::Any, Arc::new(move |_: &Delivery| o.lock().push("any")));
        let o = Arc::clone(&order);
        dispatcher.on(
            MessageKind::Quote,
            Arc::new(move |_: &Delivery| o.lock().push("quote")),
        );

        dispatcher.dispatch(quote("AAPL"));
        dispatcher.dispatch(Envelope::Pong);

        assert_eq!(*order.lock(), vec!["quote", "any", "any"]);
    }

    #[test]
    fn same_handler_removable_per_topic() {
        let dispatcher = Dispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(&counter);

        let quote_id = dispatcher.on(MessageKind::Quote, Arc::clone(&handler));
        dispatcher.on(MessageKind::Trade, handler);

        assert!(dispatcher.off(MessageKind::Quote, quote_id));
        assert!(!dispatcher.off(MessageKind::Quote, quote_id));

        dispatcher.dispatch(quote("AAPL"));
        dispatcher.dispatch(Envelope::Trade {
            symbol: "AAPL".to_string(),
            data: crate::domain::streaming::Trade::default(),
        });

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.handler_count(MessageKind::Quote), 0);
        assert_eq!(dispatcher.handler_count(MessageKind::Trade), 1);
    }

    #[test]
    fn panicking_handler_does_not_stop_fan_out() {
        let dispatcher = Dispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));

        dispatcher.on(MessageKind::Quote, Arc::new(failing_handler));
        dispatcher.on(MessageKind::Quote, counting_handler(&counter));
        dispatcher.on(Topic::Any, counting_handler(&counter));

        dispatcher.dispatch(quote("AAPL"));

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn handler_may_deregister_itself() {
        let dispatcher = Arc::new(Dispatcher::new());
        let slot: Arc<Mutex<Option<HandlerId>>> = Arc::new(Mutex::new(None));
        let counter = Arc::new(AtomicUsize::new(0));

        let d = Arc::clone(&dispatcher);
        let s = Arc::clone(&slot);
        let c = Arc::clone(&counter);
        let id = dispatcher.on(
            MessageKind::Quote,
            Arc::new(move |_: &Delivery| {
                c.fetch_add(1, Ordering::SeqCst);
                if let Some(id) = s.lock().take() {
                    d.off(MessageKind::Quote, id);
                }
            }),
        );
        *slot.lock() = Some(id);

        dispatcher.dispatch(quote("AAPL"));
        dispatcher.dispatch(quote("AAPL"));

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sequence_numbers_increase() {
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        dispatcher.on(Topic::Any, Arc::new(move |d: &Delivery| s.lock().push(d.seq)));

        let first = dispatcher.dispatch(Envelope::Pong);
        let second = dispatcher.dispatch(Envelope::Pong);

        assert!(second > first);
        assert_eq!(*seen.lock(), vec![first, second]);
    }

    #[tokio::test]
    async fn request_resolves_on_matching_envelope() {
        let dispatcher = Dispatcher::new();
        let pending = dispatcher.expect_response(MessageKind::Price, "aapl");
        assert_eq!(dispatcher.pending_requests(MessageKind::Price, "AAPL"), 1);

        dispatcher.dispatch(price("MSFT", 1));
        assert_eq!(dispatcher.pending_requests(MessageKind::Price, "AAPL"), 1);

        dispatcher.dispatch(price("AAPL", 190));
        let response = pending.wait(Duration::from_secs(1)).await;

        assert_eq!(response, Some(price("AAPL", 190)));
        assert_eq!(dispatcher.pending_requests(MessageKind::Price, "AAPL"), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_answer() {
        let dispatcher = Dispatcher::new();
        let first = dispatcher.expect_response(MessageKind::Price, "AAPL");
        let second = dispatcher.expect_response(MessageKind::Price, "AAPL");

        dispatcher.dispatch(price("AAPL", 5));

        assert!(first.wait(Duration::from_secs(1)).await.is_some());
        assert!(second.wait(Duration::from_secs(1)).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out_without_leaking() {
        let dispatcher = Dispatcher::new();
        let pending = dispatcher.expect_response(MessageKind::Price, "AAPL");

        let response = pending.wait(Duration::from_millis(5000)).await;

        assert!(response.is_none());
        assert_eq!(dispatcher.pending_requests(MessageKind::Price, "AAPL"), 0);
    }

    #[test]
    fn dropping_request_removes_it() {
        let dispatcher = Dispatcher::new();
        let first = dispatcher.expect_response(MessageKind::Snapshot, "AAPL");
        let second = dispatcher.expect_response(MessageKind::Snapshot, "AAPL");

        drop(first);
        assert_eq!(dispatcher.pending_requests(MessageKind::Snapshot, "AAPL"), 1);

        drop(second);
        assert_eq!(dispatcher.pending_requests(MessageKind::Snapshot, "AAPL"), 0);
    }
}
