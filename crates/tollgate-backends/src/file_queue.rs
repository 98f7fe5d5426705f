use crate::file_store::validate_segment;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tollgate_core::{MessageQueue, QueueMessage, TollgateResult};
use tracing::{debug, error, warn};
use uuid::Uuid;

const CORRUPT_DIR: &str = ".corrupt";

/// Durable queue on local disk: `<dir>/<topic>/<sequence>-<tie>-<id>.json`.
///
/// File names sort in publish order, so each topic drains FIFO. Lets
/// one-shot commands and a long-running `serve` process share a queue.
pub struct FileQueue {
    dir: PathBuf,
    lock: Mutex<()>,
    counter: AtomicU64,
}

impl FileQueue {
    /// Open (and create if needed) a queue rooted at `dir`.
    pub async fn new(dir: PathBuf) -> TollgateResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
            counter: AtomicU64::new(0),
        })
    }

    /// Root directory of the queue.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn topic_dir(&self, topic: &str) -> TollgateResult<PathBuf> {
        validate_segment(topic)?;
        Ok(self.dir.join(topic))
    }

    /// Message files on a topic, oldest first.
    async fn pending(&self, topic: &str) -> TollgateResult<Vec<PathBuf>> {
        let dir = self.topic_dir(topic)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_message = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".json") && !n.starts_with('.'));
            if is_message {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Move an unreadable message file to `<topic>/.corrupt/` for inspection.
    async fn quarantine(&self, topic: &str, path: &Path, reason: &str) {
        let Some(name) = path.file_name() else {
            return;
        };
        let target_dir = self.dir.join(topic).join(CORRUPT_DIR);
        let moved = match tokio::fs::create_dir_all(&target_dir).await {
            Ok(()) => tokio::fs::rename(path, target_dir.join(name)).await,
            Err(e) => Err(e),
        };
        match moved {
            Ok(()) => warn!(topic, path = %path.display(), reason, "Quarantined unreadable queue file"),
            Err(e) => error!(
                topic,
                path = %path.display(),
                reason,
                error = %e,
                "Unreadable queue file could not be quarantined"
            ),
        }
    }

    /// Number of undelivered messages on a topic.
    pub async fn depth(&self, topic: &str) -> TollgateResult<usize> {
        Ok(self.pending(topic).await?.len())
    }
}

#[async_trait]
impl MessageQueue for FileQueue {
    async fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
        attributes: HashMap<String, String>,
    ) -> TollgateResult<String> {
        let dir = self.topic_dir(topic)?;
        let now = Utc::now();
        let message = QueueMessage {
            id: Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            payload,
            attributes,
            published_at: now,
        };
        let sequence = now.timestamp_nanos_opt().unwrap_or_default();
        // Breaks ties between publishes in the same nanosecond.
        let tie = self.counter.fetch_add(1, Ordering::Relaxed);
        let name = format!("{sequence:020}-{tie:010}-{}.json", message.id);

        let _guard = self.lock.lock().await;
        tokio::fs::create_dir_all(&dir).await?;
        let tmp = dir.join(format!(".{name}.tmp"));
        tokio::fs::write(&tmp, serde_json::to_vec(&message)?).await?;
        tokio::fs::rename(&tmp, dir.join(&name)).await?;
        debug!(topic, message_id = %message.id, "published");
        Ok(message.id)
    }

    async fn pull(&self, topic: &str, max: usize) -> TollgateResult<Vec<QueueMessage>> {
        let _guard = self.lock.lock().await;
        let mut batch = Vec::new();
        for path in self.pending(topic).await?.into_iter().take(max) {
            let parsed = match tokio::fs::read(&path).await {
                Ok(data) => serde_json::from_slice::<QueueMessage>(&data).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match parsed {
                Ok(message) => batch.push((path, message)),
                Err(reason) => self.quarantine(topic, &path, &reason).await,
            }
        }

        // Nothing is removed until the whole batch is in hand. A file that
        // cannot be removed is redelivered on a later pull.
        let mut messages = Vec::with_capacity(batch.len());
        for (path, message) in batch {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove delivered queue file");
            }
            messages.push(message);
        }
        Ok(messages)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fifo_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let q = FileQueue::new(dir.path().to_path_buf()).await.unwrap();
            for i in 0..3 {
                q.publish("jobs", json!(i), HashMap::new()).await.unwrap();
            }
        }
        let q = FileQueue::new(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(q.depth("jobs").await.unwrap(), 3);

        let first = q.pull("jobs", 2).await.unwrap();
        let values: Vec<_> = first.iter().map(|m| m.payload.clone()).collect();
        assert_eq!(values, vec![json!(0), json!(1)]);
        assert_eq!(q.depth("jobs").await.unwrap(), 1);
        assert!(q.pull("other", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_attributes_persist() {
        let dir = tempfile::tempdir().unwrap();
        let q = FileQueue::new(dir.path().to_path_buf()).await.unwrap();
        let attrs = HashMap::from([("failure_count".to_string(), "1".to_string())]);
        q.publish("jobs", json!({"a": 1}), attrs).await.unwrap();
        let msg = q.pull("jobs", 1).await.unwrap().remove(0);
        assert_eq!(msg.attributes["failure_count"], "1");
    }

    #[tokio::test]
    async fn test_rejects_path_topics() {
        let dir = tempfile::tempdir().unwrap();
        let q = FileQueue::new(dir.path().to_path_buf()).await.unwrap();
        assert!(q.publish("../x", json!(1), HashMap::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_unreadable_files_do_not_cost_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let q = FileQueue::new(dir.path().to_path_buf()).await.unwrap();
        q.publish("jobs", json!("a"), HashMap::new()).await.unwrap();
        q.publish("jobs", json!("b"), HashMap::new()).await.unwrap();

        let topic = dir.path().join("jobs");
        // Sorts after both messages; reading a directory fails.
        tokio::fs::create_dir(topic.join("99999999999999999999-zz.json"))
            .await
            .unwrap();
        tokio::fs::write(topic.join("99999999999999999999-zzz.json"), b"{not json")
            .await
            .unwrap();

        let pulled = q.pull("jobs", 4).await.unwrap();
        let values: Vec<_> = pulled.iter().map(|m| m.payload.clone()).collect();
        assert_eq!(values, vec![json!("a"), json!("b")]);
        assert_eq!(q.depth("jobs").await.unwrap(), 0);

        let corrupt = topic.join(".corrupt");
        assert!(corrupt.join("99999999999999999999-zz.json").is_dir());
        assert!(corrupt.join("99999999999999999999-zzz.json").is_file());
    }
}
