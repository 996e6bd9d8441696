//! Delivery sinks
//!
//! A sink receives each pipeline's `UpdateBatch` and either confirms it or
//! fails. The pipeline owns retries and checkpointing; sinks only deliver.
//! Both sinks consume the same typed rows.

pub mod diagnostic;
pub mod pubsub;

use async_trait::async_trait;
use thiserror::Error;
use types::batch::UpdateBatch;

pub use diagnostic::DiagnosticLogSink;
pub use pubsub::{LogTopic, MemoryTopic, PubSubSink, Topic, TopicError, TopicMessage};

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("topic publish failed: {0}")]
    Topic(#[from] TopicError),

    #[error("row serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver one batch. An empty batch is valid and must succeed unless
    /// the sink itself is broken.
    async fn deliver(&self, batch: &UpdateBatch) -> Result<(), SinkError>;
}
