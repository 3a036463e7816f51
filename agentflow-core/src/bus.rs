//! In-process publish/subscribe event bus
//!
//! Topics are created lazily: `session:<id>` rooms carry the live events of
//! one session, `global` carries session summaries and administrative
//! broadcasts. Delivery is best-effort within the process: publishers never
//! block on subscribers, late subscribers see only future messages, and a
//! subscriber that falls behind its bounded queue loses the overwritten
//! messages (it learns about missed sessions by polling the query API).
//!
//! The interface is `publish` and `subscribe` only, so the gateway and the
//! schedulers consume the bus identically and no caller touches the
//! underlying channel type.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Bounded per-subscriber queue depth.
const TOPIC_CAPACITY: usize = 256;

/// The global broadcast topic.
pub const GLOBAL_TOPIC: &str = "global";

/// Topic name for a session room.
pub fn session_topic(session_id: &str) -> String {
    format!("session:{}", session_id)
}

/// A named message on a topic.
///
/// `name` is the wire event name the gateway forwards verbatim
/// (`event`, `session:update`, `insight:new`, ...).
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub name: String,
    pub data: Value,
}

impl BusMessage {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// Cheaply cloneable handle to the process-wide bus.
#[derive(Clone, Default)]
pub struct EventBus {
    topics: Arc<RwLock<HashMap<String, broadcast::Sender<BusMessage>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a message to a topic. Never blocks on subscribers; a topic
    /// with no subscribers drops the message.
    pub async fn publish(&self, topic: &str, msg: BusMessage) {
        let topics = self.topics.read().await;
        if let Some(tx) = topics.get(topic) {
            // Err means no active receivers, which is fine
            let _ = tx.send(msg);
        }
    }

    /// Subscribe to a topic, creating it if needed. Safe to call while
    /// publishes are in flight on other topics or this one.
    pub async fn subscribe(&self, topic: &str) -> Subscription {
        let mut topics = self.topics.write().await;
        let tx = topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0);
        Subscription {
            rx: tx.subscribe(),
        }
    }

    /// Drop a topic's channel; pending receivers will see end-of-stream.
    pub async fn remove_topic(&self, topic: &str) {
        self.topics.write().await.remove(topic);
    }
}

/// A live subscription to one topic.
pub struct Subscription {
    rx: broadcast::Receiver<BusMessage>,
}

impl Subscription {
    /// Receive the next message in publish order for this topic.
    ///
    /// Returns None when the topic is closed. A lagged subscriber skips the
    /// overwritten messages and keeps receiving from the current position.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "bus subscriber lagged, messages dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_order_per_topic() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("session:s1").await;

        for i in 0..5 {
            bus.publish("session:s1", BusMessage::new("event", json!({"n": i})))
                .await;
        }

        for i in 0..5 {
            let msg = sub.recv().await.unwrap();
            assert_eq!(msg.data["n"], i);
        }
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = EventBus::new();
        let mut s1 = bus.subscribe("session:s1").await;
        let _s2 = bus.subscribe("session:s2").await;

        bus.publish("session:s2", BusMessage::new("event", json!({})))
            .await;
        bus.publish("session:s1", BusMessage::new("event", json!({"mine": true})))
            .await;

        let msg = s1.recv().await.unwrap();
        assert_eq!(msg.data["mine"], true);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        // Must not block or error
        bus.publish("global", BusMessage::new("sessions:cleared", json!({})))
            .await;
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_only_future() {
        let bus = EventBus::new();
        let mut early = bus.subscribe("global").await;
        bus.publish("global", BusMessage::new("a", json!({}))).await;

        let mut late = bus.subscribe("global").await;
        bus.publish("global", BusMessage::new("b", json!({}))).await;

        assert_eq!(early.recv().await.unwrap().name, "a");
        assert_eq!(early.recv().await.unwrap().name, "b");
        assert_eq!(late.recv().await.unwrap().name, "b");
    }

    #[tokio::test]
    async fn test_lagged_subscriber_drops_and_continues() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("global").await;

        // Overflow the bounded queue
        for i in 0..(TOPIC_CAPACITY + 50) {
            bus.publish("global", BusMessage::new("event", json!({"n": i})))
                .await;
        }

        // The subscriber skips the overwritten prefix but still receives
        let first = sub.recv().await.unwrap();
        assert!(first.data["n"].as_u64().unwrap() >= 50);
    }

    #[tokio::test]
    async fn test_remove_topic_closes_subscribers() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("session:gone").await;
        bus.remove_topic("session:gone").await;
        assert!(sub.recv().await.is_none());
    }
}
