//! Pub/Sub sink
//!
//! Every row becomes one message: key = stringified asset id, value = the
//! row as a JSON object with all nine fields (nullable averages as explicit
//! `null`). Delivery is at-least-once: a batch retried after a partial
//! publish, or redelivered after a restart, may repeat messages.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use persistence::log::{FlushPolicy, FsyncPolicy, LogConfig, LogError, LogWriter};
use persistence::tail::{LogTailer, TailError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use types::batch::UpdateBatch;

use super::{Sink, SinkError};

#[derive(Error, Debug)]
pub enum TopicError {
    #[error("topic log error: {0}")]
    Log(#[from] LogError),

    #[error("topic read error: {0}")]
    Read(#[from] TailError),

    #[error("message encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("topic unavailable: {0}")]
    Unavailable(String),
}

/// One key/value message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicMessage {
    pub key: String,
    pub value: serde_json::Value,
}

/// A durable destination for messages.
#[async_trait]
pub trait Topic: Send + Sync {
    fn name(&self) -> &str;

    /// Publish all messages; `Ok` means every one is durable.
    async fn publish(&self, messages: &[TopicMessage]) -> Result<(), TopicError>;
}

// ── Log-backed topic ────────────────────────────────────────────────

/// Topic persisted with the record log segment format, one frame per
/// message holding its `{ "key", "value" }` JSON envelope.
pub struct LogTopic {
    name: String,
    dir: PathBuf,
    writer: Arc<Mutex<LogWriter>>,
}

impl LogTopic {
    /// Open (or create) `<root>/<name>`.
    pub fn open(root: &Path, name: &str) -> Result<Self, TopicError> {
        let dir = root.join(name);
        let config = LogConfig {
            flush_policy: FlushPolicy::EveryN(256),
            fsync_policy: FsyncPolicy::OnRotation,
            ..LogConfig::new(&dir)
        };
        let writer = LogWriter::open(config)?;
        Ok(Self {
            name: name.to_string(),
            dir,
            writer: Arc::new(Mutex::new(writer)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read every message currently in a topic directory.
    pub fn read_all(dir: &Path) -> Result<Vec<TopicMessage>, TopicError> {
        let mut tailer = LogTailer::open(dir, 0)?;
        let mut out = Vec::new();
        while let Some(frame) = tailer.poll()? {
            out.push(serde_json::from_slice(&frame.payload)?);
        }
        Ok(out)
    }
}

#[async_trait]
impl Topic for LogTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, messages: &[TopicMessage]) -> Result<(), TopicError> {
        let payloads = messages
            .iter()
            .map(serde_json::to_vec)
            .collect::<Result<Vec<_>, _>>()?;
        let writer = self.writer.clone();

        tokio::task::spawn_blocking(move || -> Result<(), TopicError> {
            let mut writer = writer
                .lock()
                .map_err(|_| TopicError::Unavailable("topic writer poisoned".to_string()))?;
            for payload in &payloads {
                writer.append(payload)?;
            }
            writer.sync()?;
            Ok(())
        })
        .await
        .map_err(|e| TopicError::Unavailable(format!("publish task failed: {}", e)))?
    }
}

// ── In-memory topic ─────────────────────────────────────────────────

/// In-process topic for tests and embedding. Can be told to fail the next
/// N publishes.
#[derive(Default)]
pub struct MemoryTopic {
    name: String,
    messages: Mutex<Vec<TopicMessage>>,
    fail_next: AtomicU32,
    publishes: AtomicU32,
}

impl MemoryTopic {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Make the next `n` publish calls fail.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<TopicMessage> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// Number of publish calls that reached the topic, failed or not.
    pub fn publish_calls(&self) -> u32 {
        self.publishes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Topic for MemoryTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, messages: &[TopicMessage]) -> Result<(), TopicError> {
        self.publishes.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TopicError::Unavailable("injected failure".to_string()));
        }

        let mut store = self
            .messages
            .lock()
            .map_err(|_| TopicError::Unavailable("topic poisoned".to_string()))?;
        store.extend_from_slice(messages);
        Ok(())
    }
}

// ── Sink ────────────────────────────────────────────────────────────

pub struct PubSubSink {
    topic: Arc<dyn Topic>,
}

impl PubSubSink {
    pub fn new(topic: Arc<dyn Topic>) -> Self {
        Self { topic }
    }

    /// Messages for a batch, in row order.
    pub fn messages(batch: &UpdateBatch) -> Result<Vec<TopicMessage>, SinkError> {
        batch
            .rows
            .iter()
            .map(|row| {
                Ok(TopicMessage {
                    key: row.message_key(),
                    value: serde_json::to_value(row)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl Sink for PubSubSink {
    fn name(&self) -> &str {
        "pubsub"
    }

    async fn deliver(&self, batch: &UpdateBatch) -> Result<(), SinkError> {
        if batch.is_empty() {
            debug!(cycle_id = batch.cycle_id, "Empty batch, nothing to publish");
            return Ok(());
        }

        let messages = Self::messages(batch)?;
        self.topic.publish(&messages).await?;

        info!(
            cycle_id = batch.cycle_id,
            batch_id = %batch.batch_id,
            topic = self.topic.name(),
            messages = messages.len(),
            "Published batch"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use types::aggregate::AggregateRow;
    use types::ids::AssetId;

    fn row(asset: i32, pct: Option<f64>) -> AggregateRow {
        AggregateRow {
            asset_id: AssetId::new(asset),
            avg_price: 150.0,
            avg_market_cap: 1500.0,
            avg_market_cap_rank: 1.0,
            avg_total_volume: 600.0,
            avg_high_24h: 160.0,
            avg_low_24h: 140.0,
            avg_price_change_pct: pct,
            avg_market_cap_change_pct: None,
        }
    }

    #[test]
    fn test_message_shape() {
        let batch = UpdateBatch::new(1, 2, vec![row(1, Some(2.0))]);
        let messages = PubSubSink::messages(&batch).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].key, "1");

        let value = messages[0].value.as_object().unwrap();
        assert_eq!(value.len(), 9);
        assert_eq!(value["cryptocurrency_id"], 1);
        assert_eq!(value["avg_price"], 150.0);
        assert_eq!(value["avg_price_change_pct"], 2.0);
        assert!(value["avg_market_cap_change_pct"].is_null());
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let topic = Arc::new(MemoryTopic::new("t"));
        let sink = PubSubSink::new(topic.clone());
        sink.deliver(&UpdateBatch::new(1, 0, Vec::new()))
            .await
            .unwrap();
        assert_eq!(topic.publish_calls(), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_surfaces() {
        let topic = Arc::new(MemoryTopic::new("t"));
        topic.fail_next(1);
        let sink = PubSubSink::new(topic.clone());
        let batch = UpdateBatch::new(1, 1, vec![row(1, None)]);

        assert!(matches!(
            sink.deliver(&batch).await,
            Err(SinkError::Topic(TopicError::Unavailable(_)))
        ));
        sink.deliver(&batch).await.unwrap();
        assert_eq!(topic.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_log_topic_is_durable() {
        let tmp = TempDir::new().unwrap();
        {
            let topic = Arc::new(LogTopic::open(tmp.path(), "avg").unwrap());
            let sink = PubSubSink::new(topic);
            sink.deliver(&UpdateBatch::new(1, 2, vec![row(1, None), row(2, Some(1.5))]))
                .await
                .unwrap();
        }

        let messages = LogTopic::read_all(&tmp.path().join("avg")).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].key, "2");
        assert_eq!(messages[1].value["avg_price_change_pct"], 1.5);

        // Reopening appends after existing messages.
        let topic = LogTopic::open(tmp.path(), "avg").unwrap();
        topic
            .publish(&[TopicMessage {
                key: "3".into(),
                value: serde_json::json!({}),
            }])
            .await
            .unwrap();
        assert_eq!(LogTopic::read_all(topic.dir()).unwrap().len(), 3);
    }
}
