//! Topic-based event fan-out.
//!
//! Topics are paths (`/core/analysis/root/new`). Delivery is best-effort
//! over per-topic broadcast channels: a lagging subscriber loses events, it
//! never blocks the core. Events for a given root are emitted in the order
//! its mutations were committed; across roots there is no ordering.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

const CHANNEL_CAPACITY: usize = 256;

/// One emitted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub payload: serde_json::Value,
    pub emitted_at: DateTime<Utc>,
}

/// Per-topic broadcast fan-out.
#[derive(Debug, Default)]
pub struct EventBus {
    topics: DashMap<String, broadcast::Sender<Event>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
        }
    }

    /// Subscribe to a topic. Events emitted before subscription are not
    /// replayed.
    #[must_use]
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Event> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Emit an event on a topic. Best-effort: with no live subscribers the
    /// event is dropped.
    pub fn emit(&self, topic: &str, payload: serde_json::Value) {
        trace!(topic, "emitting event");
        if let Some(sender) = self.topics.get(topic) {
            let _ = sender.send(Event {
                topic: topic.to_string(),
                payload,
                emitted_at: Utc::now(),
            });
        }
    }

    /// Number of live subscribers on a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map_or(0, |sender| sender.receiver_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::EVENT_ROOT_NEW;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_in_emission_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(EVENT_ROOT_NEW);

        bus.emit(EVENT_ROOT_NEW, json!({"uuid": "a"}));
        bus.emit(EVENT_ROOT_NEW, json!({"uuid": "b"}));

        assert_eq!(rx.recv().await.unwrap().payload["uuid"], "a");
        assert_eq!(rx.recv().await.unwrap().payload["uuid"], "b");
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_harmless() {
        let bus = EventBus::new();
        bus.emit("/core/unwatched", json!({}));
        assert_eq!(bus.subscriber_count("/core/unwatched"), 0);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = EventBus::new();
        let mut alerts = bus.subscribe("/core/alert");
        bus.emit(EVENT_ROOT_NEW, json!({"uuid": "a"}));
        bus.emit("/core/alert", json!({"uuid": "b"}));

        assert_eq!(alerts.recv().await.unwrap().payload["uuid"], "b");
    }
}
