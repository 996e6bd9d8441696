//! Delivery pipeline
//!
//! One pipeline per sink. Each trigger tick runs a cycle:
//!
//! ```text
//! Idle → Triggered → Snapshotting → Delivering → CheckpointAdvanced → Idle
//!                                       │  ▲
//!                                       ▼  │ (retry after backoff)
//!                                     Failed ──(attempts exhausted)──→ Halted
//! ```
//!
//! The checkpoint is written only after the sink confirms the batch, so a
//! crash between delivery and commit redelivers that batch on restart and
//! nothing is skipped. A checkpoint write failure or an aggregate invariant
//! violation halts the pipeline immediately. Halting never touches any
//! other pipeline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use persistence::checkpoint::{CheckpointError, CheckpointStore, PipelineCheckpoint};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use types::batch::UpdateBatch;
use types::errors::StateError;

use crate::metrics::PipelineMetrics;
use crate::sink::{Sink, SinkError};
use crate::state::AggregationStore;
use crate::trigger::Trigger;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("delivery failed after {attempts} attempt(s): {source}")]
    DeliveryExhausted {
        attempts: u32,
        #[source]
        source: SinkError,
    },

    #[error("checkpoint write failed: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("aggregation state invalid: {0}")]
    State(#[from] StateError),

    #[error("background task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    Idle,
    Triggered,
    Snapshotting,
    Delivering,
    Failed,
    CheckpointAdvanced,
    /// Terminal: retries exhausted or a fatal error.
    Halted,
    /// Terminal: clean shutdown.
    Stopped,
}

// ── Retry ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Backoff after failed attempt number `attempt` (1-based): the base
    /// delay doubled per prior failure, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(10_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub trigger_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            trigger_interval: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

// ── Status ──────────────────────────────────────────────────────────

/// Externally observable pipeline state, shared with the health endpoint.
pub struct PipelineStatus {
    name: String,
    phase: RwLock<PipelinePhase>,
    last_error: Mutex<Option<String>>,
    committed_cycle: AtomicU64,
    committed_offset: AtomicU64,
    pub metrics: PipelineMetrics,
}

impl PipelineStatus {
    fn new(name: &str, checkpoint: &PipelineCheckpoint) -> Self {
        Self {
            name: name.to_string(),
            phase: RwLock::new(PipelinePhase::Idle),
            last_error: Mutex::new(None),
            committed_cycle: AtomicU64::new(checkpoint.cycle_id),
            committed_offset: AtomicU64::new(checkpoint.committed_offset),
            metrics: PipelineMetrics::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> PipelinePhase {
        self.phase.read().map(|p| *p).unwrap_or(PipelinePhase::Halted)
    }

    pub fn is_halted(&self) -> bool {
        self.phase() == PipelinePhase::Halted
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    pub fn committed_cycle(&self) -> u64 {
        self.committed_cycle.load(Ordering::Relaxed)
    }

    pub fn committed_offset(&self) -> u64 {
        self.committed_offset.load(Ordering::Relaxed)
    }

    fn set_phase(&self, phase: PipelinePhase) {
        if let Ok(mut p) = self.phase.write() {
            *p = phase;
        }
    }

    fn set_error(&self, err: String) {
        if let Ok(mut e) = self.last_error.lock() {
            *e = Some(err);
        }
    }

    fn set_committed(&self, checkpoint: &PipelineCheckpoint) {
        self.committed_cycle.store(checkpoint.cycle_id, Ordering::Relaxed);
        self.committed_offset
            .store(checkpoint.committed_offset, Ordering::Relaxed);
    }
}

// ── Pipeline ────────────────────────────────────────────────────────

pub struct Pipeline {
    name: String,
    store: Arc<AggregationStore>,
    sink: Arc<dyn Sink>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: PipelineConfig,
    checkpoint: PipelineCheckpoint,
    status: Arc<PipelineStatus>,
}

impl Pipeline {
    /// Build a pipeline, resuming from its stored checkpoint.
    pub fn new(
        name: &str,
        store: Arc<AggregationStore>,
        sink: Arc<dyn Sink>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let checkpoint = checkpoints.load(name)?;
        info!(
            pipeline = name,
            sink = sink.name(),
            cycle_id = checkpoint.cycle_id,
            committed_offset = checkpoint.committed_offset,
            "Pipeline resuming from checkpoint"
        );
        let status = Arc::new(PipelineStatus::new(name, &checkpoint));
        Ok(Self {
            name: name.to_string(),
            store,
            sink,
            checkpoints,
            config,
            checkpoint,
            status,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> Arc<PipelineStatus> {
        self.status.clone()
    }

    pub fn checkpoint(&self) -> &PipelineCheckpoint {
        &self.checkpoint
    }

    /// Run cycles on every tick until shutdown or a halt.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), PipelineError> {
        let mut trigger = Trigger::new(self.config.trigger_interval);
        debug!(
            pipeline = %self.name,
            interval_secs = trigger.period().as_secs(),
            "Pipeline trigger armed"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = trigger.tick() => {
                    // A started cycle always runs to completion, shutdown or not.
                    if let Err(e) = self.run_cycle().await {
                        self.halt(&e);
                        return Err(e);
                    }
                }
            }
        }

        self.status.set_phase(PipelinePhase::Stopped);
        info!(
            pipeline = %self.name,
            cycle_id = self.checkpoint.cycle_id,
            "Pipeline stopped"
        );
        Ok(())
    }

    /// One full cycle: snapshot, deliver (with retries), checkpoint.
    pub async fn run_cycle(&mut self) -> Result<UpdateBatch, PipelineError> {
        let cycle_id = self.checkpoint.cycle_id + 1;
        self.status.set_phase(PipelinePhase::Triggered);

        self.status.set_phase(PipelinePhase::Snapshotting);
        let (rows, through) = self
            .store
            .snapshot_since(self.checkpoint.committed_offset)?;
        let batch = UpdateBatch::new(cycle_id, through, rows);
        debug!(
            pipeline = %self.name,
            cycle_id,
            batch_id = %batch.batch_id,
            rows = batch.len(),
            through_offset = through,
            "Batch materialized"
        );

        let started = Instant::now();
        self.deliver_with_retry(&batch).await?;
        let latency_ms = started.elapsed().as_millis() as u64;

        let next = self
            .checkpoint
            .advance(cycle_id, batch.through_offset, batch.len() as u64);
        self.commit(next).await?;
        self.status.set_phase(PipelinePhase::CheckpointAdvanced);
        self.status.metrics.record_cycle(batch.len() as u64, latency_ms);

        info!(
            pipeline = %self.name,
            cycle_id,
            batch_id = %batch.batch_id,
            rows = batch.len(),
            committed_offset = self.checkpoint.committed_offset,
            latency_ms,
            "Cycle committed"
        );

        self.status.set_phase(PipelinePhase::Idle);
        Ok(batch)
    }

    async fn deliver_with_retry(&self, batch: &UpdateBatch) -> Result<(), PipelineError> {
        let retry = self.config.retry;
        let mut attempt = 1u32;
        loop {
            self.status.set_phase(PipelinePhase::Delivering);
            match self.sink.deliver(batch).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.status.set_phase(PipelinePhase::Failed);
                    self.status.set_error(e.to_string());
                    self.status.metrics.record_failure();

                    if attempt >= retry.max_attempts {
                        return Err(PipelineError::DeliveryExhausted {
                            attempts: attempt,
                            source: e,
                        });
                    }

                    let delay = retry.delay_for(attempt);
                    warn!(
                        pipeline = %self.name,
                        cycle_id = batch.cycle_id,
                        attempt,
                        max_attempts = retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Delivery failed, retrying"
                    );
                    self.status.metrics.record_retry();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn commit(&mut self, next: PipelineCheckpoint) -> Result<(), PipelineError> {
        let store = self.checkpoints.clone();
        let to_write = next.clone();
        tokio::task::spawn_blocking(move || store.commit(&to_write))
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))??;

        self.status.set_committed(&next);
        self.checkpoint = next;
        Ok(())
    }

    fn halt(&self, err: &PipelineError) {
        self.status.set_error(err.to_string());
        self.status.set_phase(PipelinePhase::Halted);
        self.status.metrics.record_halt();
        error!(
            pipeline = %self.name,
            cycle_id = self.checkpoint.cycle_id + 1,
            committed_offset = self.checkpoint.committed_offset,
            error = %err,
            "Pipeline halted"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{MemoryTopic, PubSubSink};
    use async_trait::async_trait;
    use persistence::checkpoint::FileCheckpointStore;
    use std::sync::atomic::AtomicU32;
    use tempfile::TempDir;
    use types::ids::AssetId;
    use types::record::RawRecord;

    fn record(asset: i32, price: f64) -> RawRecord {
        RawRecord {
            id: None,
            asset_id: AssetId::new(asset),
            price,
            market_cap: 1,
            market_cap_rank: 1,
            total_volume: 1,
            high_24h: price,
            low_24h: price,
            price_change_pct_24h: None,
            market_cap_change_pct_24h: None,
            timestamp: "t".to_string(),
        }
    }

    /// Checkpoint store that fails every commit.
    struct BrokenCheckpoints;

    impl CheckpointStore for BrokenCheckpoints {
        fn load(&self, pipeline: &str) -> Result<PipelineCheckpoint, CheckpointError> {
            Ok(PipelineCheckpoint::initial(pipeline))
        }

        fn commit(&self, _: &PipelineCheckpoint) -> Result<(), CheckpointError> {
            Err(CheckpointError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }
    }

    /// Sink that counts deliveries and always fails.
    #[derive(Default)]
    struct DeadSink {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Sink for DeadSink {
        fn name(&self) -> &str {
            "dead"
        }

        async fn deliver(&self, _: &UpdateBatch) -> Result<(), SinkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(SinkError::Unavailable("down".to_string()))
        }
    }

    fn pipeline(
        store: Arc<AggregationStore>,
        sink: Arc<dyn Sink>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Pipeline {
        Pipeline::new("test", store, sink, checkpoints, PipelineConfig::default()).unwrap()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.delay_for(1), Duration::from_millis(500));
        assert_eq!(retry.delay_for(2), Duration::from_millis(1000));
        assert_eq!(retry.delay_for(3), Duration::from_millis(2000));
        assert_eq!(retry.delay_for(6), Duration::from_millis(10_000));
        assert_eq!(retry.delay_for(40), Duration::from_millis(10_000));
    }

    #[tokio::test]
    async fn test_cycle_delivers_changed_rows_and_commits() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(AggregationStore::new());
        let topic = Arc::new(MemoryTopic::new("t"));
        let checkpoints = Arc::new(FileCheckpointStore::new(tmp.path()));
        let mut p = pipeline(
            store.clone(),
            Arc::new(PubSubSink::new(topic.clone())),
            checkpoints.clone(),
        );

        store.apply(1, &record(1, 10.0));
        store.apply(2, &record(2, 20.0));
        let batch = p.run_cycle().await.unwrap();
        assert_eq!(batch.cycle_id, 1);
        assert_eq!(batch.len(), 2);
        assert_eq!(topic.messages().len(), 2);

        let saved = checkpoints.load("test").unwrap();
        assert_eq!(saved.cycle_id, 1);
        assert_eq!(saved.committed_offset, 2);
        assert_eq!(p.status().phase(), PipelinePhase::Idle);

        store.apply(3, &record(2, 40.0));
        let batch = p.run_cycle().await.unwrap();
        assert_eq!(batch.cycle_id, 2);
        assert_eq!(batch.rows.len(), 1);
        assert_eq!(batch.rows[0].asset_id, AssetId::new(2));
        assert_eq!(batch.rows[0].avg_price, 30.0);
    }

    #[tokio::test]
    async fn test_empty_cycle_still_commits() {
        let tmp = TempDir::new().unwrap();
        let checkpoints = Arc::new(FileCheckpointStore::new(tmp.path()));
        let mut p = pipeline(
            Arc::new(AggregationStore::new()),
            Arc::new(PubSubSink::new(Arc::new(MemoryTopic::new("t")))),
            checkpoints.clone(),
        );

        let batch = p.run_cycle().await.unwrap();
        assert!(batch.is_empty());
        assert_eq!(checkpoints.load("test").unwrap().cycle_id, 1);
        assert_eq!(p.status().metrics.empty_cycles.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(AggregationStore::new());
        let topic = Arc::new(MemoryTopic::new("t"));
        topic.fail_next(2);
        let mut p = pipeline(
            store.clone(),
            Arc::new(PubSubSink::new(topic.clone())),
            Arc::new(FileCheckpointStore::new(tmp.path())),
        );

        store.apply(1, &record(1, 10.0));
        let started = Instant::now();
        p.run_cycle().await.unwrap();

        assert_eq!(topic.publish_calls(), 3);
        assert_eq!(topic.messages().len(), 1);
        // 500ms + 1000ms of backoff.
        assert!(started.elapsed() >= Duration::from_millis(1500));
        assert_eq!(p.status().metrics.retries.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_do_not_advance_checkpoint() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(AggregationStore::new());
        let sink = Arc::new(DeadSink::default());
        let checkpoints = Arc::new(FileCheckpointStore::new(tmp.path()));
        let mut p = pipeline(store.clone(), sink.clone(), checkpoints.clone());

        store.apply(1, &record(1, 10.0));
        let err = p.run_cycle().await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::DeliveryExhausted { attempts: 5, .. }
        ));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 5);
        assert_eq!(checkpoints.load("test").unwrap().cycle_id, 0);
    }

    #[tokio::test]
    async fn test_checkpoint_failure_is_fatal() {
        let store = Arc::new(AggregationStore::new());
        let mut p = pipeline(
            store,
            Arc::new(PubSubSink::new(Arc::new(MemoryTopic::new("t")))),
            Arc::new(BrokenCheckpoints),
        );
        assert!(matches!(
            p.run_cycle().await,
            Err(PipelineError::Checkpoint(_))
        ));
        assert_eq!(p.checkpoint().cycle_id, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_halts_and_reports() {
        let store = Arc::new(AggregationStore::new());
        let p = pipeline(store, Arc::new(DeadSink::default()), Arc::new(BrokenCheckpoints));
        let status = p.status();
        let (_tx, rx) = watch::channel(false);

        let result = p.run(rx).await;
        assert!(result.is_err());
        assert!(status.is_halted());
        assert!(status.last_error().unwrap().contains("down"));
        assert_eq!(status.metrics.halted.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(AggregationStore::new());
        let p = pipeline(
            store,
            Arc::new(PubSubSink::new(Arc::new(MemoryTopic::new("t")))),
            Arc::new(FileCheckpointStore::new(tmp.path())),
        );
        let status = p.status();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(p.run(rx));

        tokio::time::sleep(Duration::from_secs(25)).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(status.phase(), PipelinePhase::Stopped);
        assert_eq!(status.committed_cycle(), 2);
    }
}
