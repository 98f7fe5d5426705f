use crate::error::TollgateResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A message as delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Transport-assigned message id. Redeliveries get a new id.
    pub id: String,
    /// Topic the message was published on.
    pub topic: String,
    /// Message body.
    pub payload: serde_json::Value,
    /// String attributes carried alongside the body.
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    /// When the transport accepted the message.
    pub published_at: DateTime<Utc>,
}

/// Topic-based message queue with at-least-once delivery.
///
/// Ordering is not guaranteed across producers. Consumers must be idempotent.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Publish a message and return its id.
    async fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
        attributes: HashMap<String, String>,
    ) -> TollgateResult<String>;

    /// Take up to `max` messages from a topic. Returns immediately, possibly empty.
    ///
    /// Pulled messages are owned by the caller, who must publish them again to
    /// have them redelivered.
    async fn pull(&self, topic: &str, max: usize) -> TollgateResult<Vec<QueueMessage>>;
}
