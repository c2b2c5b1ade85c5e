use super::{new_pop_receipt, MessageQueue, QueueMessage};
use crate::error::{FlowerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::time::{Duration, Instant};

struct Entry {
    id: String,
    content: String,
    inserted_at: DateTime<Utc>,
    visible_at: Instant,
    pop_receipt: Option<String>,
    dequeue_count: u32,
}

/// In-process queue.
#[derive(Default)]
pub struct MemoryQueue {
    entries: Mutex<Vec<Entry>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn approximate_message_count(&self) -> Result<usize> {
        Ok(self.entries.lock().len())
    }

    async fn send_message(&self, content: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.entries.lock().push(Entry {
            id: id.clone(),
            content: content.to_string(),
            inserted_at: Utc::now(),
            visible_at: Instant::now(),
            pop_receipt: None,
            dequeue_count: 0,
        });
        Ok(id)
    }

    async fn receive_messages(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let mut received = Vec::new();

        for entry in entries.iter_mut() {
            if received.len() >= max {
                break;
            }
            if entry.visible_at > now {
                continue;
            }
            let receipt = new_pop_receipt();
            entry.visible_at = now + visibility_timeout;
            entry.pop_receipt = Some(receipt.clone());
            entry.dequeue_count += 1;
            received.push(QueueMessage {
                id: entry.id.clone(),
                pop_receipt: receipt,
                content: entry.content.clone(),
                dequeue_count: entry.dequeue_count,
                inserted_at: entry.inserted_at,
            });
        }

        Ok(received)
    }

    async fn delete_message(&self, message: &QueueMessage) -> Result<()> {
        let mut entries = self.entries.lock();
        let position = entries
            .iter()
            .position(|e| e.id == message.id)
            .ok_or_else(|| FlowerError::MessageNotFound(message.id.clone()))?;

        if entries[position].pop_receipt.as_deref() != Some(message.pop_receipt.as_str()) {
            return Err(FlowerError::PopReceiptMismatch(message.id.clone()));
        }

        entries.remove(position);
        Ok(())
    }
}
