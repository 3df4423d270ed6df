//! Event broker: per-session publish/subscribe.
//!
//! Every subscriber owns a bounded queue (capacity 1000). Emission never
//! blocks the caller; when a subscriber's queue is full the event is
//! dropped for that subscriber only. Dropping a subscription deregisters
//! the queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Queue capacity per subscriber.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 1000;

/// Timestamped event envelope delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: String,
    pub ts: DateTime<Utc>,
    pub session_id: Option<String>,
    pub payload: Value,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<EventEnvelope>,
}

/// Multiplexes named events to per-session subscribers.
pub struct EventBroker {
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroker {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Emit an event. With a session id, only that session's subscribers
    /// receive it; without one, every subscriber of every session does.
    pub fn emit(&self, event: &str, payload: Value, session_id: Option<&str>) {
        let envelope = EventEnvelope {
            event: event.to_string(),
            ts: Utc::now(),
            session_id: session_id.map(str::to_string),
            payload,
        };

        let subscribers = match self.subscribers.read() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        match session_id {
            Some(sid) => {
                if let Some(queue) = subscribers.get(sid) {
                    for sub in queue {
                        Self::deliver(sub, envelope.clone());
                    }
                }
            }
            None => {
                for queue in subscribers.values() {
                    for sub in queue {
                        Self::deliver(sub, envelope.clone());
                    }
                }
            }
        }
    }

    fn deliver(sub: &Subscriber, envelope: EventEnvelope) {
        // Drop-newest back-pressure: a full or closed queue loses this
        // event for this subscriber only.
        if let Err(mpsc::error::TrySendError::Full(_)) = sub.tx.try_send(envelope) {
            tracing::trace!(subscriber_id = sub.id, "subscriber queue full, event dropped");
        }
    }

    /// Subscribe to a session's event stream. The returned subscription
    /// yields envelopes in emission order; dropping it deregisters the
    /// subscriber.
    pub fn subscribe(self: &Arc<Self>, session_id: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut subscribers) = self.subscribers.write() {
            subscribers
                .entry(session_id.to_string())
                .or_default()
                .push(Subscriber { id, tx });
        }
        Subscription {
            rx,
            broker: Arc::clone(self),
            session_id: session_id.to_string(),
            id,
        }
    }

    /// Number of live subscribers for a session.
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.subscribers
            .read()
            .map(|subs| subs.get(session_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    fn deregister(&self, session_id: &str, id: u64) {
        if let Ok(mut subscribers) = self.subscribers.write() {
            if let Some(queue) = subscribers.get_mut(session_id) {
                queue.retain(|sub| sub.id != id);
                if queue.is_empty() {
                    subscribers.remove(session_id);
                }
            }
        }
    }
}

/// A live subscription; an infinite sequence of envelopes.
pub struct Subscription {
    rx: mpsc::Receiver<EventEnvelope>,
    broker: Arc<EventBroker>,
    session_id: String,
    id: u64,
}

impl Subscription {
    /// Await the next envelope. Returns None only if the broker is gone.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        self.rx.recv().await
    }

    /// Non-blocking poll used by drain-style consumers.
    pub fn try_next(&mut self) -> Option<EventEnvelope> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broker.deregister(&self.session_id, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_emit_reaches_matching_session() {
        let broker = Arc::new(EventBroker::new());
        let mut sub = broker.subscribe("session_a");

        broker.emit("task.started", json!({"id": 1}), Some("session_a"));
        let envelope = sub.next().await.unwrap();
        assert_eq!(envelope.event, "task.started");
        assert_eq!(envelope.session_id.as_deref(), Some("session_a"));
    }

    #[tokio::test]
    async fn test_emit_does_not_cross_sessions() {
        let broker = Arc::new(EventBroker::new());
        let mut sub_a = broker.subscribe("session_a");
        let _sub_b = broker.subscribe("session_b");

        broker.emit("only.b", json!({}), Some("session_b"));
        broker.emit("for.a", json!({}), Some("session_a"));

        // session_a must see only its own event
        let envelope = sub_a.next().await.unwrap();
        assert_eq!(envelope.event, "for.a");
        assert!(sub_a.try_next().is_none());
    }

    #[tokio::test]
    async fn test_broadcast_without_session() {
        let broker = Arc::new(EventBroker::new());
        let mut sub_a = broker.subscribe("session_a");
        let mut sub_b = broker.subscribe("session_b");

        broker.emit("shutdown", json!({}), None);
        assert_eq!(sub_a.next().await.unwrap().event, "shutdown");
        assert_eq!(sub_b.next().await.unwrap().event, "shutdown");
    }

    #[tokio::test]
    async fn test_full_queue_drops_newest_for_that_subscriber_only() {
        let broker = Arc::new(EventBroker::new());
        let mut slow = broker.subscribe("s");
        let mut fast = broker.subscribe("s");

        for i in 0..=SUBSCRIBER_QUEUE_CAPACITY {
            broker.emit("tick", json!({"i": i}), Some("s"));
        }

        // Drain the fast subscriber fully: it got every event
        let mut fast_count = 0;
        while fast.try_next().is_some() {
            fast_count += 1;
        }
        assert_eq!(fast_count, SUBSCRIBER_QUEUE_CAPACITY + 1);

        // The slow subscriber lost exactly the overflow event
        let mut slow_count = 0;
        while slow.try_next().is_some() {
            slow_count += 1;
        }
        assert_eq!(slow_count, SUBSCRIBER_QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn test_drop_deregisters() {
        let broker = Arc::new(EventBroker::new());
        let sub = broker.subscribe("s");
        assert_eq!(broker.subscriber_count("s"), 1);
        drop(sub);
        assert_eq!(broker.subscriber_count("s"), 0);
    }

    #[tokio::test]
    async fn test_emission_order_per_subscriber() {
        let broker = Arc::new(EventBroker::new());
        let mut sub = broker.subscribe("s");
        for i in 0..10 {
            broker.emit("tick", json!({"i": i}), Some("s"));
        }
        for i in 0..10 {
            let envelope = sub.next().await.unwrap();
            assert_eq!(envelope.payload["i"], i);
        }
    }
}
