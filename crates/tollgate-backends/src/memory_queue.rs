use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tollgate_core::{MessageQueue, QueueMessage, TollgateResult};
use tracing::debug;
use uuid::Uuid;

/// In-process message queue: one FIFO per topic.
pub struct MemoryQueue {
    topics: Mutex<HashMap<String, VecDeque<QueueMessage>>>,
}

impl MemoryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Number of undelivered messages on a topic.
    pub fn depth(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, VecDeque::len)
    }

    /// Copy of the undelivered messages on a topic, oldest first.
    pub fn peek(&self, topic: &str) -> Vec<QueueMessage> {
        self.topics
            .lock()
            .get(topic)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
        attributes: HashMap<String, String>,
    ) -> TollgateResult<String> {
        let message = QueueMessage {
            id: Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            payload,
            attributes,
            published_at: Utc::now(),
        };
        let id = message.id.clone();
        debug!(topic, message_id = %id, "published");
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push_back(message);
        Ok(id)
    }

    async fn pull(&self, topic: &str, max: usize) -> TollgateResult<Vec<QueueMessage>> {
        let mut topics = self.topics.lock();
        let Some(queue) = topics.get_mut(topic) else {
            return Ok(Vec::new());
        };
        let n = max.min(queue.len());
        Ok(queue.drain(..n).collect())
    }
}
