//! Request/response broker
//!
//! Turns the gateway's callback event stream into request/response
//! futures. Events tagged with a request id route only to the pending
//! request registered under that id; untagged events fan out to the
//! global listeners (and to an order-keyed pending request, if one is
//! waiting on that order id). Global listeners are never unregistered by
//! request completion and survive reconnects.

use crate::errors::{CoreError, CoreResult};
use crate::gateway::wire::GatewayEvent;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// What a pending request is correlated by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingKey {
    Request(i64),
    Order(i64),
}

#[derive(Debug)]
enum BrokerMsg {
    Event(GatewayEvent),
    SessionDropped,
}

type GlobalHandler = Box<dyn Fn(&GatewayEvent) + Send + Sync>;
type EventFilter = Box<dyn Fn(&GatewayEvent) -> bool + Send + Sync>;

struct BrokerShared {
    pending: Mutex<HashMap<PendingKey, mpsc::UnboundedSender<BrokerMsg>>>,
    globals: RwLock<Vec<GlobalHandler>>,
    subscriptions: Mutex<HashMap<u64, (EventFilter, mpsc::UnboundedSender<BrokerMsg>)>>,
}

/// Demultiplexer between the session's event stream and waiting callers
pub struct RequestBroker {
    req_ids: AtomicI64,
    sub_ids: AtomicU64,
    shared: Arc<BrokerShared>,
}

impl RequestBroker {
    pub fn new() -> Self {
        Self {
            req_ids: AtomicI64::new(1),
            sub_ids: AtomicU64::new(1),
            shared: Arc::new(BrokerShared {
                pending: Mutex::new(HashMap::new()),
                globals: RwLock::new(Vec::new()),
                subscriptions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Monotonically increasing request ids from a shared allocator.
    pub fn next_req_id(&self) -> i64 {
        self.req_ids.fetch_add(1, Ordering::SeqCst)
    }

    /// Reset the allocator. Only valid on a hard reconnect, after every
    /// pending request has been notified of the drop.
    pub fn reset_req_ids(&self) {
        self.req_ids.store(1, Ordering::SeqCst);
    }

    /// Register a handler under a correlation key. The registration is
    /// removed when the returned handle drops.
    pub fn register(&self, key: PendingKey) -> PendingRequest {
        let (tx, rx) = mpsc::unbounded_channel();
        let replaced = self.shared.pending.lock().insert(key, tx);
        if replaced.is_some() {
            debug!(?key, "pending registration replaced an existing handler");
        }
        PendingRequest {
            key,
            rx,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Register a handler that is never removed by request completion.
    pub fn global_listener<F>(&self, handler: F)
    where
        F: Fn(&GatewayEvent) + Send + Sync + 'static,
    {
        self.shared.globals.write().push(Box::new(handler));
    }

    /// A stream of untagged events matching `filter`. Yields until the
    /// handle drops (explicit cancel) or the session drops.
    pub fn subscribe<F>(&self, filter: F) -> EventSubscription
    where
        F: Fn(&GatewayEvent) -> bool + Send + Sync + 'static,
    {
        let id = self.sub_ids.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .subscriptions
            .lock()
            .insert(id, (Box::new(filter), tx));
        EventSubscription {
            id,
            rx,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Route one inbound event.
    pub fn dispatch(&self, event: &GatewayEvent) {
        if let Some(req_id) = event.req_id() {
            // Tagged events go only to the request that asked for them.
            // Order-level gateway errors carry the order id in the same
            // slot, so fall back to an order-keyed waiter for those.
            let sender = {
                let pending = self.shared.pending.lock();
                pending
                    .get(&PendingKey::Request(req_id))
                    .or_else(|| {
                        if matches!(event, GatewayEvent::Error { .. }) {
                            pending.get(&PendingKey::Order(req_id))
                        } else {
                            None
                        }
                    })
                    .cloned()
            };
            match sender {
                Some(tx) => {
                    let _ = tx.send(BrokerMsg::Event(event.clone()));
                }
                None => trace!(req_id, "event for unknown request id dropped"),
            }
            return;
        }

        // Untagged events: an order-keyed waiter first, then every global.
        if let Some(order_id) = event.order_id() {
            let sender = self
                .shared
                .pending
                .lock()
                .get(&PendingKey::Order(order_id))
                .cloned();
            if let Some(tx) = sender {
                let _ = tx.send(BrokerMsg::Event(event.clone()));
            }
        }
        for handler in self.shared.globals.read().iter() {
            handler(event);
        }
        for (filter, tx) in self.shared.subscriptions.lock().values() {
            if filter(event) {
                let _ = tx.send(BrokerMsg::Event(event.clone()));
            }
        }
    }

    /// Notify every pending request exactly once that the session dropped.
    /// Global listeners are preserved; subscription streams end.
    pub fn notify_session_dropped(&self) {
        let drained: Vec<_> = self.shared.pending.lock().drain().collect();
        for (key, tx) in drained {
            trace!(?key, "notifying pending request of session drop");
            let _ = tx.send(BrokerMsg::SessionDropped);
        }
        for (_, (_, tx)) in self.shared.subscriptions.lock().drain() {
            let _ = tx.send(BrokerMsg::SessionDropped);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }
}

impl Default for RequestBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered in-flight request. Dropping it cleans up the registration.
pub struct PendingRequest {
    key: PendingKey,
    rx: mpsc::UnboundedReceiver<BrokerMsg>,
    shared: Arc<BrokerShared>,
}

impl PendingRequest {
    pub fn key(&self) -> PendingKey {
        self.key
    }

    /// Await the next correlated event. Events arrive in delivery order.
    pub async fn next_event(&mut self, timeout: Duration) -> CoreResult<GatewayEvent> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(BrokerMsg::Event(event))) => Ok(event),
            Ok(Some(BrokerMsg::SessionDropped)) | Ok(None) => Err(CoreError::SessionDropped),
            Err(_) => Err(CoreError::Timeout(timeout.as_millis() as u64)),
        }
    }

    /// Collect events until `is_end` matches. The end marker is not
    /// included in the result. The timeout bounds the whole collection.
    pub async fn collect_until<F>(
        &mut self,
        timeout: Duration,
        is_end: F,
    ) -> CoreResult<Vec<GatewayEvent>>
    where
        F: Fn(&GatewayEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut events = Vec::new();
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or(CoreError::Timeout(timeout.as_millis() as u64))?;
            let event = self.next_event(remaining).await?;
            if is_end(&event) {
                return Ok(events);
            }
            events.push(event);
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.key);
    }
}

/// A live untagged-event stream. Dropping it cancels the registration.
pub struct EventSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<BrokerMsg>,
    shared: Arc<BrokerShared>,
}

impl EventSubscription {
    /// Next matching event; `None` once the session drops.
    pub async fn next(&mut self) -> Option<GatewayEvent> {
        match self.rx.recv().await {
            Some(BrokerMsg::Event(event)) => Some(event),
            Some(BrokerMsg::SessionDropped) | None => None,
        }
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.shared.subscriptions.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn status_event(order_id: i64, status: &str) -> GatewayEvent {
        GatewayEvent::OrderStatus {
            order_id,
            status: status.to_string(),
            filled: 0.0,
            remaining: 100.0,
            avg_fill_price: 0.0,
        }
    }

    #[tokio::test]
    async fn routes_tagged_event_to_owning_request_only() {
        let broker = RequestBroker::new();
        let mut mine = broker.register(PendingKey::Request(5));
        let mut theirs = broker.register(PendingKey::Request(6));

        broker.dispatch(&GatewayEvent::OpenOrderEnd { req_id: 5 });

        let event = mine.next_event(Duration::from_millis(100)).await.unwrap();
        assert_eq!(event, GatewayEvent::OpenOrderEnd { req_id: 5 });
        assert!(theirs.next_event(Duration::from_millis(50)).await.is_err());
    }

    #[tokio::test]
    async fn untagged_events_reach_globals_and_order_waiter() {
        let broker = RequestBroker::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        broker.global_listener(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        let mut waiter = broker.register(PendingKey::Order(42));
        broker.dispatch(&status_event(42, "Submitted"));

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        let event = waiter.next_event(Duration::from_millis(100)).await.unwrap();
        assert_eq!(event.order_id(), Some(42));
    }

    #[tokio::test]
    async fn commission_reports_fan_out_to_globals_only() {
        let broker = RequestBroker::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        broker.global_listener(move |event| {
            if matches!(event, GatewayEvent::CommissionReport { .. }) {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            }
        });
        let _waiter = broker.register(PendingKey::Request(9));

        broker.dispatch(&GatewayEvent::CommissionReport {
            exec_id: "E1".to_string(),
            commission: 1.0,
            realized_pnl: None,
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn session_drop_notifies_each_pending_once_and_keeps_globals() {
        let broker = RequestBroker::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        broker.global_listener(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        let mut a = broker.register(PendingKey::Request(1));
        let mut b = broker.register(PendingKey::Order(2));
        broker.notify_session_dropped();

        assert!(matches!(
            a.next_event(Duration::from_millis(50)).await,
            Err(CoreError::SessionDropped)
        ));
        assert!(matches!(
            b.next_event(Duration::from_millis(50)).await,
            Err(CoreError::SessionDropped)
        ));
        assert_eq!(broker.pending_count(), 0);

        broker.dispatch(&status_event(7, "Filled"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn events_are_delivered_in_arrival_order() {
        let broker = RequestBroker::new();
        let mut pending = broker.register(PendingKey::Request(3));
        for i in 0..4 {
            broker.dispatch(&GatewayEvent::Position {
                req_id: 3,
                symbol: format!("SYM{i}"),
                quantity: i as f64,
                avg_cost: 0.0,
            });
        }
        broker.dispatch(&GatewayEvent::PositionEnd { req_id: 3 });

        let events = pending
            .collect_until(Duration::from_millis(200), |e| {
                matches!(e, GatewayEvent::PositionEnd { .. })
            })
            .await
            .unwrap();
        let symbols: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                GatewayEvent::Position { symbol, .. } => Some(symbol.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(symbols, ["SYM0", "SYM1", "SYM2", "SYM3"]);
    }

    #[tokio::test]
    async fn drop_cleans_registration() {
        let broker = RequestBroker::new();
        {
            let _pending = broker.register(PendingKey::Request(11));
            assert_eq!(broker.pending_count(), 1);
        }
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn subscriptions_stream_matching_events_until_session_drop() {
        let broker = RequestBroker::new();
        let mut news = broker.subscribe(|event| {
            matches!(event, GatewayEvent::NewsBulletin { .. })
        });

        broker.dispatch(&GatewayEvent::NewsBulletin {
            msg_id: 1,
            message: "halt".to_string(),
            origin_exchange: "NYSE".to_string(),
        });
        broker.dispatch(&status_event(5, "Filled"));

        let event = news.next().await.unwrap();
        assert!(matches!(event, GatewayEvent::NewsBulletin { msg_id: 1, .. }));

        broker.notify_session_dropped();
        assert!(news.next().await.is_none());
    }

    #[tokio::test]
    async fn dropping_a_subscription_cancels_it() {
        let broker = RequestBroker::new();
        {
            let _news = broker.subscribe(|_| true);
            assert_eq!(broker.shared.subscriptions.lock().len(), 1);
        }
        assert_eq!(broker.shared.subscriptions.lock().len(), 0);
    }

    #[test]
    fn request_ids_are_monotonic_until_reset() {
        let broker = RequestBroker::new();
        let a = broker.next_req_id();
        let b = broker.next_req_id();
        assert!(b > a);
        broker.reset_req_ids();
        assert_eq!(broker.next_req_id(), 1);
    }
}
