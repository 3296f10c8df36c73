//! In-process event bus
//! Mission: Stream fan-out between the outbox poller, the risk workers, and peers
//!
//! Stand-in for the external stream product. One broadcast channel per stream
//! name; streams are created lazily on first publish or subscribe. Delivery is
//! at-least-once end to end (the outbox retries failed publishes), so
//! consumers must be idempotent on `event_id`.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;

use crate::error::{EngineError, EngineResult};

/// Well-known stream names.
pub mod streams {
    /// Ingested events, partitioned by event-type family:
    /// `events:authentication`, `events:transaction`, ...
    pub const EVENTS_PREFIX: &str = "events";
    /// Risk decisions published after evaluation.
    pub const DECISIONS: &str = "risk_decisions";
    /// Rule reload notices for peer instances.
    pub const RULE_RELOAD: &str = "rule_reload";
}

/// Stream name for an event-type family (the part before the first dot).
pub fn event_stream_for(event_type: &str) -> String {
    let family = event_type
        .split_once('.')
        .map(|(family, _)| family)
        .unwrap_or(event_type);
    format!("{}:{}", streams::EVENTS_PREFIX, family)
}

/// A message on a stream. The key preserves per-event-type ordering semantics
/// for consumers that care.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub stream: String,
    pub key: String,
    pub payload: serde_json::Value,
}

const STREAM_CAPACITY: usize = 4096;

pub struct EventBus {
    streams: RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
        }
    }

    fn sender(&self, stream: &str) -> broadcast::Sender<BusMessage> {
        if let Some(tx) = self.streams.read().get(stream) {
            return tx.clone();
        }
        let mut streams = self.streams.write();
        streams
            .entry(stream.to_string())
            .or_insert_with(|| broadcast::channel(STREAM_CAPACITY).0)
            .clone()
    }

    /// Publish to a stream. Fails with `Transient` when no consumer is
    /// attached, because a broadcast with zero receivers drops the message;
    /// the outbox treats that as a failed publish and retries.
    pub fn publish(
        &self,
        stream: &str,
        key: &str,
        payload: serde_json::Value,
    ) -> EngineResult<usize> {
        let tx = self.sender(stream);
        let msg = BusMessage {
            stream: stream.to_string(),
            key: key.to_string(),
            payload,
        };
        tx.send(msg)
            .map_err(|_| EngineError::Transient(format!("no consumers on stream {stream}")))
    }

    pub fn subscribe(&self, stream: &str) -> broadcast::Receiver<BusMessage> {
        self.sender(stream).subscribe()
    }

    pub fn consumer_count(&self, stream: &str) -> usize {
        self.streams
            .read()
            .get(stream)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_naming() {
        assert_eq!(
            event_stream_for("authentication.login"),
            "events:authentication"
        );
        assert_eq!(event_stream_for("transaction.attempted"), "events:transaction");
        assert_eq!(event_stream_for("heartbeat"), "events:heartbeat");
    }

    #[tokio::test]
    async fn test_publish_without_consumer_is_transient() {
        let bus = EventBus::new();
        let err = bus
            .publish("events:authentication", "authentication.login", serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, EngineError::Transient(_)));
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("events:transaction");

        bus.publish(
            "events:transaction",
            "transaction.attempted",
            serde_json::json!({"event_id": "evt_1"}),
        )
        .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.key, "transaction.attempted");
        assert_eq!(msg.payload["event_id"], "evt_1");
    }
}
