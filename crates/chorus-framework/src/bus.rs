//! Cross-plugin publish/subscribe.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

/// Buffered messages per topic before slow subscribers start lagging.
const TOPIC_CAPACITY: usize = 256;

/// A message published on the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    /// Topic it was published on.
    pub topic: Arc<str>,
    /// Name of the publishing plugin.
    pub from: Arc<str>,
    /// Free-form payload.
    pub payload: Value,
}

/// Per-topic broadcast channels, created on first use.
#[derive(Debug, Default)]
pub struct EventBus {
    topics: RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `payload` on `topic`; returns the number of subscribers
    /// that will see it.
    pub fn publish(&self, topic: &str, from: &str, payload: Value) -> usize {
        let sender = self.topics.read().get(topic).cloned();
        let Some(sender) = sender else {
            trace!(topic, from, "Published to a topic without subscribers");
            return 0;
        };
        let message = BusMessage {
            topic: Arc::from(topic),
            from: Arc::from(from),
            payload,
        };
        sender.send(message).unwrap_or(0)
    }

    /// Subscribes to `topic`.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.subscribe();
        }
        self.topics
            .write()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Topics that currently have a channel.
    pub fn topics(&self) -> Vec<String> {
        self.topics.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.publish("economy.level_up", "economy", json!({})), 0);

        let mut rx1 = bus.subscribe("economy.level_up");
        let mut rx2 = bus.subscribe("economy.level_up");
        let _other = bus.subscribe("other");

        let delivered = bus.publish("economy.level_up", "economy", json!({ "user": "u1" }));
        assert_eq!(delivered, 2);

        let msg = rx1.recv().await.unwrap();
        assert_eq!(&*msg.from, "economy");
        assert_eq!(msg.payload["user"], "u1");
        assert_eq!(rx2.recv().await.unwrap(), msg);
    }
}
