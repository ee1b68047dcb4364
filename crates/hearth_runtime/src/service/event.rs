//! Bus Events
//!
//! Services talk to each other by publishing topic-addressed events.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use wildmatch::WildMatch;

use super::ServiceError;

/// An event travelling on the service bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    /// Slash separated topic, e.g. "home/rooms-changed"
    pub topic: String,

    /// Id of the publishing service (or "system")
    pub source: String,

    pub data: serde_json::Value,

    /// Unix milliseconds
    pub timestamp: u64,
}

impl BusEvent {
    pub fn new(topic: impl Into<String>, source: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            source: source.into(),
            data,
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }

    /// An event without payload
    pub fn signal(topic: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(topic, source, serde_json::Value::Null)
    }

    pub fn matches(&self, pattern: &str) -> bool {
        topic_matches(pattern, &self.topic)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.data.get(key).and_then(|v| v.as_bool())
    }

    pub fn parse_data<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

/// Glob match of a subscription pattern against a topic.
///
/// `*` alone accepts everything; otherwise `*` and `?` follow wildmatch rules.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    pattern == "*" || pattern == topic || WildMatch::new(pattern).matches(topic)
}

// ─────────────────────────────────────────────────────────────────────────────
// Event Publisher
// ─────────────────────────────────────────────────────────────────────────────

/// Cloneable handle for publishing onto the bus
#[derive(Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<BusEvent>,
}

impl EventPublisher {
    pub fn new(tx: broadcast::Sender<BusEvent>) -> Self {
        Self { tx }
    }

    /// Publish an event. Fails only when nobody is listening.
    pub fn publish(&self, event: BusEvent) -> Result<(), ServiceError> {
        self.tx
            .send(event)
            .map(|_| ())
            .map_err(|_| ServiceError::ChannelClosed)
    }

    pub fn emit(
        &self,
        topic: impl Into<String>,
        source: impl Into<String>,
        data: serde_json::Value,
    ) -> Result<(), ServiceError> {
        self.publish(BusEvent::new(topic, source, data))
    }
}
