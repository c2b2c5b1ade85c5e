//! Work queue for user corrections.
//!
//! [`MessageQueue`] models a managed storage queue: receiving a message hides
//! it for a visibility timeout and hands out a pop receipt; only an explicit
//! delete carrying the latest receipt removes it. There is no batch
//! transaction, so a consumer that deletes as it goes gets at-most-once
//! delivery for everything it has deleted.

mod fs;
mod memory;

pub use fs::FsQueue;
pub use memory::MemoryQueue;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A message handed out by [`MessageQueue::receive_messages`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Stable message id.
    pub id: String,
    /// Receipt of the latest receive; required to delete.
    pub pop_receipt: String,
    /// Message body.
    pub content: String,
    /// How many times the message has been received.
    pub dequeue_count: u32,
    /// Enqueue time.
    pub inserted_at: DateTime<Utc>,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Number of undeleted messages, visible or not.
    async fn approximate_message_count(&self) -> Result<usize>;

    /// Enqueue a message, returning its id.
    async fn send_message(&self, content: &str) -> Result<String>;

    /// Receive up to `max` visible messages in insertion order and hide them
    /// for `visibility_timeout`.
    async fn receive_messages(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>>;

    /// Delete a received message. Fails if the pop receipt is stale.
    async fn delete_message(&self, message: &QueueMessage) -> Result<()>;
}

pub(crate) fn new_pop_receipt() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
