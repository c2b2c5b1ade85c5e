//! Queue draining.
//!
//! Each message is received, resolved to its image blob, decoded, and then
//! the blob and the message are deleted one by one. Nothing is transactional:
//! a message whose delete succeeded is gone even if the retrain that follows
//! fails.

use crate::corrections::UPLOAD_PREFIX;
use crate::dataset::Sample;
use crate::error::{FlowerError, Result};
use crate::imaging;
use crate::queue::{MessageQueue, QueueMessage};
use crate::storage::BlobStore;
use crate::types::CorrectionMessage;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Options for one drain.
#[derive(Debug, Clone, Copy)]
pub struct DrainOptions {
    /// Messages requested per receive.
    pub page_size: usize,
    /// How long received messages stay hidden.
    pub visibility_timeout: Duration,
    /// Side length images are decoded to.
    pub image_res: u32,
}

/// What a drain collected.
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Decoded training samples.
    pub samples: Vec<Sample>,
    /// Messages deleted from the queue, poison messages included.
    pub deleted: usize,
    /// Poison messages dropped without producing a sample.
    pub skipped: usize,
    /// Set when a storage error ended the drain early.
    pub interrupted: Option<String>,
}

/// How a single message was handled.
enum Handled {
    Sample(Sample),
    Poison(String),
}

/// Drain every currently visible message.
pub async fn drain_queue(
    blobs: &dyn BlobStore,
    queue: &dyn MessageQueue,
    options: DrainOptions,
) -> DrainReport {
    let mut report = DrainReport::default();

    'pages: loop {
        let page = match queue
            .receive_messages(options.page_size, options.visibility_timeout)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                warn!(error = %e, "Receiving from the queue failed, ending drain");
                report.interrupted = Some(e.to_string());
                break;
            }
        };
        if page.is_empty() {
            break;
        }

        for message in page {
            debug!(message_id = %message.id, dequeue_count = message.dequeue_count, "Processing message");

            let handled = match handle_message(blobs, &message, options.image_res).await {
                Ok(handled) => handled,
                Err(e) => {
                    warn!(
                        message_id = %message.id,
                        error = %e,
                        "Storage error while draining, keeping what was drained"
                    );
                    report.interrupted = Some(e.to_string());
                    break 'pages;
                }
            };

            match handled {
                Handled::Sample(sample) => report.samples.push(sample),
                Handled::Poison(reason) => {
                    warn!(message_id = %message.id, reason = %reason, "Dropping unusable correction");
                    report.skipped += 1;
                }
            }

            if let Err(e) = queue.delete_message(&message).await {
                warn!(message_id = %message.id, error = %e, "Deleting message failed, ending drain");
                report.interrupted = Some(e.to_string());
                break 'pages;
            }
            report.deleted += 1;
        }
    }

    info!(
        samples = report.samples.len(),
        deleted = report.deleted,
        skipped = report.skipped,
        interrupted = report.interrupted.is_some(),
        "Drained correction queue"
    );
    report
}

/// Resolve a message to a sample. `Err` is reserved for storage failures
/// that should stop the drain.
async fn handle_message(blobs: &dyn BlobStore, message: &QueueMessage, res: u32) -> Result<Handled> {
    let correction = match CorrectionMessage::from_json(&message.content) {
        Ok(correction) => correction,
        Err(e) => {
            if let Some(blob_name) = loose_blob_name(&message.content) {
                delete_blob(blobs, &blob_name).await?;
            }
            return Ok(Handled::Poison(format!("unparseable payload: {}", e)));
        }
    };
    if !correction.blob_name.starts_with(UPLOAD_PREFIX) {
        return Ok(Handled::Poison(format!(
            "blob {} is outside {}",
            correction.blob_name, UPLOAD_PREFIX
        )));
    }

    let label = match correction.label() {
        Ok(label) => label,
        Err(e) => {
            delete_blob(blobs, &correction.blob_name).await?;
            return Ok(Handled::Poison(e.to_string()));
        }
    };

    let bytes = match blobs.get(&correction.blob_name).await {
        Ok(bytes) => bytes,
        Err(e @ (FlowerError::BlobNotFound(_) | FlowerError::InvalidBlobName(_))) => {
            return Ok(Handled::Poison(e.to_string()))
        }
        Err(e) => return Err(e),
    };

    let decoded = tokio::task::spawn_blocking(move || imaging::decode(&bytes, res))
        .await
        .map_err(|e| FlowerError::Internal(format!("decode task failed: {}", e)))?;

    delete_blob(blobs, &correction.blob_name).await?;

    match decoded {
        Ok(image) => Ok(Handled::Sample(Sample::new(image, label))),
        Err(e) => Ok(Handled::Poison(e.to_string())),
    }
}

/// Upload named by a payload that failed strict decoding, e.g. one whose
/// label does not fit in a `u8`.
fn loose_blob_name(content: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(content).ok()?;
    let name = value.get("blob_name")?.as_str()?;
    name.starts_with(UPLOAD_PREFIX).then(|| name.to_string())
}

async fn delete_blob(blobs: &dyn BlobStore, name: &str) -> Result<()> {
    match blobs.delete(name).await {
        Ok(()) | Err(FlowerError::BlobNotFound(_)) | Err(FlowerError::InvalidBlobName(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use crate::storage::MemoryBlobStore;
    use crate::types::Label;
    use async_trait::async_trait;
    use bytes::Bytes;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const OPTIONS: DrainOptions = DrainOptions {
        page_size: 2,
        visibility_timeout: Duration::from_secs(30),
        image_res: 8,
    };

    fn jpeg() -> Bytes {
        let mut buf = Cursor::new(Vec::new());
        RgbImage::from_pixel(16, 16, Rgb([180, 40, 40]))
            .write_to(&mut buf, ImageFormat::Jpeg)
            .unwrap();
        Bytes::from(buf.into_inner())
    }

    async fn enqueue(blobs: &MemoryBlobStore, queue: &MemoryQueue, name: &str, label: Label) {
        blobs.put(name, jpeg(), false).await.unwrap();
        queue
            .send_message(&CorrectionMessage::new(name, label).to_json().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_drain_consumes_everything_across_pages() {
        let blobs = MemoryBlobStore::new();
        let queue = MemoryQueue::new();
        for i in 0..5 {
            enqueue(&blobs, &queue, &format!("uploads/{}.jpg", i), Label::Roses).await;
        }

        let report = drain_queue(&blobs, &queue, OPTIONS).await;
        assert_eq!(report.samples.len(), 5);
        assert_eq!(report.deleted, 5);
        assert_eq!(report.skipped, 0);
        assert!(report.interrupted.is_none());
        assert!(report.samples.iter().all(|s| s.label == Label::Roses && s.image.res() == 8));

        assert_eq!(queue.approximate_message_count().await.unwrap(), 0);
        assert!(blobs.is_empty());
    }

    #[tokio::test]
    async fn test_poison_messages_are_dropped() {
        let blobs = MemoryBlobStore::new();
        let queue = MemoryQueue::new();
        enqueue(&blobs, &queue, "uploads/good.jpg", Label::Daisy).await;

        queue.send_message("not json").await.unwrap();
        queue
            .send_message(r#"{"blob_name":"uploads/missing.jpg","label":1}"#)
            .await
            .unwrap();
        blobs.put("uploads/bad-label.jpg", jpeg(), false).await.unwrap();
        queue
            .send_message(r#"{"blob_name":"uploads/bad-label.jpg","label":7}"#)
            .await
            .unwrap();
        blobs
            .put("uploads/garbage.jpg", Bytes::from_static(b"garbage"), false)
            .await
            .unwrap();
        queue
            .send_message(r#"{"blob_name":"uploads/garbage.jpg","label":2}"#)
            .await
            .unwrap();
        blobs.put("models/model_1.bin", Bytes::from_static(b"m"), false).await.unwrap();
        queue
            .send_message(r#"{"blob_name":"models/model_1.bin","label":2}"#)
            .await
            .unwrap();

        let report = drain_queue(&blobs, &queue, OPTIONS).await;
        assert_eq!(report.samples.len(), 1);
        assert_eq!(report.samples[0].label, Label::Daisy);
        assert_eq!(report.skipped, 5);
        assert_eq!(report.deleted, 6);
        assert_eq!(queue.approximate_message_count().await.unwrap(), 0);

        // Only the blob outside uploads/ survives.
        let remaining: Vec<_> = blobs.list("").await.unwrap().into_iter().map(|b| b.name).collect();
        assert_eq!(remaining, ["models/model_1.bin"]);
    }

    #[tokio::test]
    async fn test_oversized_label_removes_upload() {
        let blobs = MemoryBlobStore::new();
        let queue = MemoryQueue::new();
        for (name, label) in [("uploads/big.jpg", "300"), ("uploads/negative.jpg", "-1"), ("uploads/seven.jpg", "7")] {
            blobs.put(name, jpeg(), false).await.unwrap();
            queue
                .send_message(&format!(r#"{{"blob_name":"{}","label":{}}}"#, name, label))
                .await
                .unwrap();
        }
        blobs.put("models/model_9.bin", Bytes::from_static(b"m"), false).await.unwrap();
        queue
            .send_message(r#"{"blob_name":"models/model_9.bin","label":300}"#)
            .await
            .unwrap();

        let report = drain_queue(&blobs, &queue, OPTIONS).await;
        assert!(report.samples.is_empty());
        assert_eq!(report.skipped, 4);
        assert_eq!(report.deleted, 4);
        assert!(blobs.list("uploads/").await.unwrap().is_empty());
        assert!(blobs.exists("models/model_9.bin").await.unwrap());
    }

    /// Blob store whose reads start failing after a number of successes.
    struct FlakyStore {
        inner: MemoryBlobStore,
        reads_left: AtomicUsize,
    }

    #[async_trait]
    impl BlobStore for FlakyStore {
        async fn list(&self, prefix: &str) -> Result<Vec<crate::storage::BlobInfo>> {
            self.inner.list(prefix).await
        }

        async fn get(&self, name: &str) -> Result<Bytes> {
            if self
                .reads_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
            {
                return Err(FlowerError::Storage("service unavailable".to_string()));
            }
            self.inner.get(name).await
        }

        async fn put(&self, name: &str, data: Bytes, overwrite: bool) -> Result<()> {
            self.inner.put(name, data, overwrite).await
        }

        async fn delete(&self, name: &str) -> Result<()> {
            self.inner.delete(name).await
        }
    }

    #[tokio::test]
    async fn test_storage_error_stops_drain_and_keeps_progress() {
        let store = FlakyStore {
            inner: MemoryBlobStore::new(),
            reads_left: AtomicUsize::new(2),
        };
        let queue = MemoryQueue::new();
        for i in 0..4 {
            enqueue(&store.inner, &queue, &format!("uploads/{}.jpg", i), Label::Tulips).await;
        }

        let report = drain_queue(&store, &queue, OPTIONS).await;
        assert_eq!(report.samples.len(), 2);
        assert_eq!(report.deleted, 2);
        assert!(report.interrupted.is_some());

        // The failed message and the unreceived one are still queued.
        assert_eq!(queue.approximate_message_count().await.unwrap(), 2);
        assert_eq!(store.inner.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let report = drain_queue(&MemoryBlobStore::new(), &MemoryQueue::new(), OPTIONS).await;
        assert!(report.samples.is_empty());
        assert_eq!(report.deleted, 0);
    }
}
