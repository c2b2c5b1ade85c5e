use super::{new_pop_receipt, MessageQueue, QueueMessage};
use crate::error::{FlowerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

/// On-disk message record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMessage {
    id: String,
    content: String,
    inserted_at: DateTime<Utc>,
    visible_at: DateTime<Utc>,
    pop_receipt: Option<String>,
    dequeue_count: u32,
}

/// Directory-backed queue: one JSON file per message.
///
/// Message ids start with the zero-padded enqueue time, so a sorted directory
/// listing is insertion order. Records are rewritten through a temp file and
/// rename. Mutations are serialized within a process only. A record that no
/// longer parses is renamed to `{id}.dead` and stops counting as a message.
pub struct FsQueue {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl FsQueue {
    /// Open (and create) a queue stored in `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn message_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn read_record(&self, id: &str) -> Result<Option<StoredMessage>> {
        match tokio::fs::read(self.record_path(id)).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Move an unreadable record out of the queue.
    async fn quarantine(&self, id: &str) {
        let dead = self.dir.join(format!("{}.dead", id));
        if let Err(e) = tokio::fs::rename(self.record_path(id), &dead).await {
            warn!(message_id = %id, error = %e, "Failed to move unreadable queue record aside");
        }
    }

    async fn write_record(&self, record: &StoredMessage) -> Result<()> {
        let data = serde_json::to_vec(record)?;
        write_atomically(&self.dir, &self.record_path(&record.id), &data).await
    }
}

async fn write_atomically(dir: &Path, path: &Path, data: &[u8]) -> Result<()> {
    let tmp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, data).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

#[async_trait]
impl MessageQueue for FsQueue {
    async fn approximate_message_count(&self) -> Result<usize> {
        Ok(self.message_ids().await?.len())
    }

    async fn send_message(&self, content: &str) -> Result<String> {
        let _guard = self.lock.lock().await;
        let now = Utc::now();
        let nanos = now.timestamp_nanos_opt().unwrap_or_default().max(0);
        let id = format!("{:020}-{}", nanos, uuid::Uuid::new_v4().simple());

        self.write_record(&StoredMessage {
            id: id.clone(),
            content: content.to_string(),
            inserted_at: now,
            visible_at: now,
            pop_receipt: None,
            dequeue_count: 0,
        })
        .await?;
        Ok(id)
    }

    async fn receive_messages(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>> {
        let _guard = self.lock.lock().await;
        let now = Utc::now();
        let hidden_for = chrono::Duration::from_std(visibility_timeout)
            .map_err(|e| FlowerError::InvalidInput(format!("visibility timeout: {}", e)))?;
        let mut received = Vec::new();

        for id in self.message_ids().await? {
            if received.len() >= max {
                break;
            }
            let mut record = match self.read_record(&id).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e @ FlowerError::Serialization(_)) => {
                    warn!(message_id = %id, error = %e, "Moving corrupt queue record aside");
                    self.quarantine(&id).await;
                    continue;
                }
                Err(e) => {
                    warn!(message_id = %id, error = %e, "Skipping unreadable queue record");
                    continue;
                }
            };
            if record.visible_at > now {
                continue;
            }

            let receipt = new_pop_receipt();
            record.visible_at = now + hidden_for;
            record.pop_receipt = Some(receipt.clone());
            record.dequeue_count += 1;
            self.write_record(&record).await?;

            received.push(QueueMessage {
                id: record.id,
                pop_receipt: receipt,
                content: record.content,
                dequeue_count: record.dequeue_count,
                inserted_at: record.inserted_at,
            });
        }

        Ok(received)
    }

    async fn delete_message(&self, message: &QueueMessage) -> Result<()> {
        let _guard = self.lock.lock().await;
        let record = self
            .read_record(&message.id)
            .await?
            .ok_or_else(|| FlowerError::MessageNotFound(message.id.clone()))?;

        if record.pop_receipt.as_deref() != Some(message.pop_receipt.as_str()) {
            return Err(FlowerError::PopReceiptMismatch(message.id.clone()));
        }

        match tokio::fs::remove_file(self.record_path(&message.id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(FlowerError::MessageNotFound(message.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LONG: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_fifo_and_visibility() {
        let dir = TempDir::new().unwrap();
        let queue = FsQueue::open(dir.path()).unwrap();

        for content in ["first", "second", "third"] {
            queue.send_message(content).await.unwrap();
        }
        assert_eq!(queue.approximate_message_count().await.unwrap(), 3);

        let batch = queue.receive_messages(2, LONG).await.unwrap();
        let contents: Vec<_> = batch.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["first", "second"]);

        let rest = queue.receive_messages(32, LONG).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].content, "third");
        assert!(queue.receive_messages(32, LONG).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_requires_current_receipt() {
        let dir = TempDir::new().unwrap();
        let queue = FsQueue::open(dir.path()).unwrap();
        queue.send_message("payload").await.unwrap();

        let stale = queue.receive_messages(1, Duration::ZERO).await.unwrap().remove(0);
        let fresh = queue.receive_messages(1, LONG).await.unwrap().remove(0);
        assert_eq!(fresh.dequeue_count, 2);

        assert!(matches!(
            queue.delete_message(&stale).await,
            Err(FlowerError::PopReceiptMismatch(_))
        ));
        queue.delete_message(&fresh).await.unwrap();
        assert_eq!(queue.approximate_message_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_moved_aside() {
        let dir = TempDir::new().unwrap();
        let queue = FsQueue::open(dir.path()).unwrap();
        queue.send_message("good").await.unwrap();
        std::fs::write(dir.path().join("00000000000000000001-corrupt.json"), b"{not json").unwrap();
        assert_eq!(queue.approximate_message_count().await.unwrap(), 2);

        let messages = queue.receive_messages(32, LONG).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "good");

        assert_eq!(queue.approximate_message_count().await.unwrap(), 1);
        assert!(dir.path().join("00000000000000000001-corrupt.dead").exists());
    }

    #[tokio::test]
    async fn test_queue_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let queue = FsQueue::open(dir.path()).unwrap();
            queue.send_message("durable").await.unwrap();
        }
        let queue = FsQueue::open(dir.path()).unwrap();
        let messages = queue.receive_messages(32, LONG).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "durable");
    }
}
