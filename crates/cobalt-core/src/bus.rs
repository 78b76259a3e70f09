//! Message bus contract and in-process implementation.
//!
//! Delivery is at-least-once: a payload may be observed more than once and
//! handlers must be idempotent. Subjects are flat strings; the well-known
//! ones live in [`crate::events`].

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::{broadcast, Mutex};

use crate::error::{CobaltError, Result};

/// Per-subject channel capacity for the in-process bus.
const CHANNEL_CAPACITY: usize = 256;

/// Publish/subscribe transport for orchestration events.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes a payload on a subject.
    ///
    /// Publishing to a subject with no subscribers is not an error.
    ///
    /// # Errors
    /// Returns `CobaltError::Bus` if the transport rejected the publish.
    async fn publish(&self, subject: &str, payload: Value) -> Result<()>;

    /// Subscribes to a subject.
    ///
    /// # Returns
    /// A receiver yielding every payload published after this call.
    async fn subscribe(&self, subject: &str) -> Result<broadcast::Receiver<Value>>;
}

/// In-process [`MessageBus`] backed by per-subject broadcast channels.
#[derive(Default)]
pub struct MemoryBus {
    channels: Mutex<HashMap<String, broadcast::Sender<Value>>>,
}

impl MemoryBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn sender(&self, subject: &str) -> broadcast::Sender<Value> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(subject.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBus").finish_non_exhaustive()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Value) -> Result<()> {
        let sender = self.sender(subject).await;
        // send only fails with zero receivers, which is fine for pub/sub
        let receivers = sender.send(payload).unwrap_or(0);
        tracing::trace!(subject, receivers, "published event");
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<broadcast::Receiver<Value>> {
        let sender = self.sender(subject).await;
        Ok(sender.subscribe())
    }
}

/// Serializes a typed event for publishing.
///
/// # Errors
/// Returns `CobaltError::Json` if serialization fails.
pub fn encode<T: serde::Serialize>(event: &T) -> Result<Value> {
    serde_json::to_value(event).map_err(CobaltError::from)
}

/// Deserializes a received payload into a typed event.
///
/// # Errors
/// Returns `CobaltError::Json` if the payload does not match the type.
pub fn decode<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T> {
    serde_json::from_value(payload).map_err(CobaltError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CancellationSignal, SUBJECT_TASK_CANCEL};

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = MemoryBus::new();
        bus.publish("tasks.assign", serde_json::json!({"task_id": "t1"})).await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_subscribe_round_trip() {
        let bus = MemoryBus::new();
        let mut receiver = bus.subscribe(SUBJECT_TASK_CANCEL).await.unwrap();

        let signal = CancellationSignal { task_id: "task-1".to_string() };
        bus.publish(SUBJECT_TASK_CANCEL, encode(&signal).unwrap()).await.unwrap();

        let payload = receiver.recv().await.unwrap();
        let decoded: CancellationSignal = decode(payload).unwrap();
        assert_eq!(decoded, signal);
    }

    #[tokio::test]
    async fn test_subjects_are_isolated() {
        let bus = MemoryBus::new();
        let mut results = bus.subscribe("tasks.results").await.unwrap();

        bus.publish("tasks.assign", serde_json::json!({"task_id": "t1"})).await.unwrap();
        bus.publish("tasks.results", serde_json::json!({"task_id": "t2"})).await.unwrap();

        let payload = results.recv().await.unwrap();
        assert_eq!(payload["task_id"], "t2");
    }
}
