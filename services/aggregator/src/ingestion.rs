//! Ingestion loop
//!
//! Consumes record log frames in offset order, decodes each payload and
//! folds accepted records into the aggregation store. Duplicate offsets are
//! dropped, malformed records are counted and skipped, and none of these
//! stop the stream.
//!
//! The loop runs on a blocking thread: it sleeps between polls when caught
//! up and exits once the shutdown signal is raised, after finishing the
//! frame in hand. State snapshots are written every N applied records and
//! once more on shutdown. `IngestionStatus` exposes whether the loop is
//! still running, for the health endpoint.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use persistence::log::LogFrame;
use persistence::recovery::{ApplyOutcome, FrameApplier};
use persistence::snapshot::{
    SnapshotCleanupPolicy, SnapshotError, SnapshotIntervalPolicy, SnapshotWriter, StateSnapshot,
};
use persistence::tail::{LogTailer, TailError};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use types::errors::DecodeError;

use crate::decoder;
use crate::metrics::ServiceMetrics;
use crate::state::AggregationStore;

/// Errors that stop the ingestion loop.
#[derive(Debug, thiserror::Error)]
pub enum IngestionError {
    #[error("record log unreadable: {0}")]
    Tail(#[from] TailError),

    #[error("ingestion task failed: {0}")]
    Task(String),
}

/// Configuration for the ingestion loop.
#[derive(Debug, Clone)]
pub struct IngesterConfig {
    /// Sleep between polls once the log is drained.
    pub poll_interval: Duration,
    pub snapshot_dir: PathBuf,
    /// Snapshot every N applied records; 0 disables periodic snapshots.
    pub snapshot_every_records: u64,
    pub snapshots_retained: usize,
    pub compress_snapshots: bool,
}

impl Default for IngesterConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            snapshot_dir: PathBuf::from("data/snapshots"),
            snapshot_every_records: 100_000,
            snapshots_retained: 3,
            compress_snapshots: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionPhase {
    Running,
    /// Terminal: clean shutdown.
    Stopped,
    /// Terminal: the record log became unreadable.
    Failed,
}

/// Shared view of the ingestion loop, read by the health endpoint.
#[derive(Debug)]
pub struct IngestionStatus {
    phase: RwLock<IngestionPhase>,
    last_error: Mutex<Option<String>>,
    last_offset: AtomicU64,
}

impl IngestionStatus {
    fn new(last_offset: u64) -> Self {
        Self {
            phase: RwLock::new(IngestionPhase::Running),
            last_error: Mutex::new(None),
            last_offset: AtomicU64::new(last_offset),
        }
    }

    pub fn phase(&self) -> IngestionPhase {
        self.phase.read().map(|p| *p).unwrap_or(IngestionPhase::Failed)
    }

    pub fn is_failed(&self) -> bool {
        self.phase() == IngestionPhase::Failed
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    /// Last record log offset consumed.
    pub fn last_offset(&self) -> u64 {
        self.last_offset.load(Ordering::Relaxed)
    }

    fn set_phase(&self, phase: IngestionPhase) {
        if let Ok(mut p) = self.phase.write() {
            *p = phase;
        }
    }

    fn fail(&self, err: String) {
        if let Ok(mut e) = self.last_error.lock() {
            *e = Some(err);
        }
        self.set_phase(IngestionPhase::Failed);
    }
}

/// Decodes frames and applies them to the shared store.
///
/// Also serves as the recovery applier, so replay and live ingestion take
/// the same path.
pub struct Ingester {
    store: Arc<AggregationStore>,
    metrics: Arc<ServiceMetrics>,
    /// Last offset consumed (applied or rejected).
    last_offset: u64,
    status: Arc<IngestionStatus>,
}

impl Ingester {
    pub fn new(store: Arc<AggregationStore>, metrics: Arc<ServiceMetrics>) -> Self {
        let last_offset = store.watermark();
        Self {
            last_offset,
            store,
            metrics,
            status: Arc::new(IngestionStatus::new(last_offset)),
        }
    }

    pub fn status(&self) -> Arc<IngestionStatus> {
        self.status.clone()
    }

    pub fn last_offset(&self) -> u64 {
        self.last_offset
    }

    pub fn store(&self) -> &Arc<AggregationStore> {
        &self.store
    }

    fn reject(&self, offset: u64, err: &DecodeError) {
        match err {
            DecodeError::SchemaViolation { .. } => self.metrics.record_rejected_schema(),
            DecodeError::CoercionError { .. } => self.metrics.record_rejected_coercion(),
        }
        warn!(
            offset,
            kind = err.kind_label(),
            error = %err,
            "Dropping malformed record"
        );
    }
}

impl FrameApplier for Ingester {
    fn restore(&mut self, snapshot: &StateSnapshot) {
        self.store.restore(&snapshot.entries, snapshot.through_offset);
        self.last_offset = snapshot.through_offset;
        self.status
            .last_offset
            .store(snapshot.through_offset, Ordering::Relaxed);
    }

    fn apply(&mut self, frame: &LogFrame) -> ApplyOutcome {
        if frame.offset <= self.last_offset {
            self.metrics.record_duplicate();
            debug!(
                offset = frame.offset,
                last_offset = self.last_offset,
                "Dropping duplicate frame"
            );
            return ApplyOutcome::Duplicate;
        }
        self.last_offset = frame.offset;
        self.status.last_offset.store(frame.offset, Ordering::Relaxed);

        let started = Instant::now();
        match decoder::decode(&frame.payload) {
            Ok(record) => {
                self.store.apply(frame.offset, &record);
                self.metrics
                    .record_ingested(started.elapsed().as_nanos() as u64);
                ApplyOutcome::Applied
            }
            Err(err) => {
                self.store.advance_watermark(frame.offset);
                self.reject(frame.offset, &err);
                ApplyOutcome::Rejected
            }
        }
    }
}

/// Writes state snapshots on the configured cadence.
pub struct Snapshotter {
    writer: SnapshotWriter,
    cleanup: SnapshotCleanupPolicy,
    policy: SnapshotIntervalPolicy,
    dir: PathBuf,
}

impl Snapshotter {
    pub fn new(config: &IngesterConfig) -> Self {
        Self {
            writer: SnapshotWriter::new(&config.snapshot_dir, config.compress_snapshots),
            cleanup: SnapshotCleanupPolicy::new(config.snapshots_retained.max(1)),
            policy: SnapshotIntervalPolicy::with_interval(config.snapshot_every_records),
            dir: config.snapshot_dir.clone(),
        }
    }

    fn record_applied(&mut self) {
        self.policy.record_applied();
    }

    fn due(&self) -> bool {
        self.policy.should_snapshot()
    }

    /// Snapshot the store now. Failures are logged and counted; ingestion
    /// carries on since the log remains the source of truth.
    pub fn take(&mut self, store: &AggregationStore, metrics: &ServiceMetrics) {
        match self.write(store) {
            Ok(through) => {
                self.policy.record_snapshot();
                metrics.record_snapshot();
                info!(through_offset = through, assets = store.len(), "State snapshot taken");
            }
            Err(e) => {
                metrics.record_snapshot_failure();
                warn!(error = %e, "State snapshot failed");
            }
        }
    }

    fn write(&self, store: &AggregationStore) -> Result<u64, SnapshotError> {
        let (entries, through) = store.export();
        let taken_at = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0);
        let snapshot = StateSnapshot::new(through, taken_at, entries)?;
        self.writer.write(&snapshot)?;
        self.cleanup.cleanup(&self.dir)?;
        Ok(through)
    }
}

/// Tail the log until shutdown. Blocking: run it on `spawn_blocking`.
pub fn run_ingestion(
    mut ingester: Ingester,
    mut tailer: LogTailer,
    config: IngesterConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<u64, IngestionError> {
    let metrics = ingester.metrics.clone();
    let mut snapshotter = Snapshotter::new(&config);
    let mut applied_since_snapshot = 0u64;
    // Damage skipped during recovery replay is counted on the first poll.
    let mut corruption_counted = 0u64;

    info!(
        from_offset = ingester.last_offset(),
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        "Ingestion started"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        let polled = tailer.poll();
        let corruption = tailer.corruption_count();
        if corruption > corruption_counted {
            metrics.record_corrupt_frames(corruption - corruption_counted);
            corruption_counted = corruption;
        }

        match polled {
            Ok(Some(frame)) => {
                if ingester.apply(&frame) == ApplyOutcome::Applied {
                    applied_since_snapshot += 1;
                    snapshotter.record_applied();
                    if snapshotter.due() {
                        snapshotter.take(&ingester.store, &metrics);
                        applied_since_snapshot = 0;
                    }
                }
            }
            Ok(None) => std::thread::sleep(config.poll_interval),
            Err(TailError::ChecksumMismatch { offset, segment, .. }) => {
                warn!(offset, segment = %segment, "Skipping corrupt record log frame");
            }
            Err(e) => {
                error!(error = %e, "Record log read failed, stopping ingestion");
                ingester.status.fail(e.to_string());
                return Err(e.into());
            }
        }
    }

    if applied_since_snapshot > 0 && config.snapshot_every_records > 0 {
        snapshotter.take(&ingester.store, &metrics);
    }

    ingester.status.set_phase(IngestionPhase::Stopped);
    info!(last_offset = ingester.last_offset(), "Ingestion stopped");
    Ok(ingester.last_offset())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::WireRecord;
    use persistence::log::{LogConfig, LogWriter};
    use persistence::snapshot::SnapshotLoader;
    use tempfile::TempDir;
    use types::ids::AssetId;

    fn payload(asset: i32, price: &str) -> Vec<u8> {
        WireRecord {
            cryptocurrency_id: Some(asset),
            price: Some(price.to_string()),
            market_cap: Some(1000),
            market_cap_rank: Some(1),
            total_volume: Some(500),
            high_24h: Some(price.to_string()),
            low_24h: Some(price.to_string()),
            timestamp: Some("t".to_string()),
            ..WireRecord::default()
        }
        .to_payload()
        .unwrap()
    }

    fn ingester() -> Ingester {
        Ingester::new(
            Arc::new(AggregationStore::new()),
            Arc::new(ServiceMetrics::new()),
        )
    }

    #[test]
    fn test_apply_decodes_and_aggregates() {
        let mut ing = ingester();
        let outcome = ing.apply(&LogFrame::new(1, 0, payload(1, "100.0")));
        assert_eq!(outcome, ApplyOutcome::Applied);
        ing.apply(&LogFrame::new(2, 0, payload(1, "200.0")));

        let row = ing.store().row(AssetId::new(1)).unwrap().unwrap();
        assert_eq!(row.avg_price, 150.0);
        assert_eq!(ing.last_offset(), 2);
    }

    #[test]
    fn test_malformed_records_are_counted_not_fatal() {
        let mut ing = ingester();
        assert_eq!(
            ing.apply(&LogFrame::new(1, 0, b"{}".to_vec())),
            ApplyOutcome::Rejected
        );
        assert_eq!(
            ing.apply(&LogFrame::new(2, 0, payload(1, "n/a"))),
            ApplyOutcome::Rejected
        );
        assert_eq!(
            ing.apply(&LogFrame::new(3, 0, payload(1, "5"))),
            ApplyOutcome::Applied
        );

        let exported = ing.metrics.export();
        assert_eq!(exported["records_rejected_schema"], 1);
        assert_eq!(exported["records_rejected_coercion"], 1);
        assert_eq!(exported["records_ingested"], 1);
        assert_eq!(ing.store().watermark(), 3);
    }

    #[test]
    fn test_duplicate_offsets_are_dropped() {
        let mut ing = ingester();
        ing.apply(&LogFrame::new(5, 0, payload(1, "1")));
        assert_eq!(
            ing.apply(&LogFrame::new(5, 0, payload(1, "1"))),
            ApplyOutcome::Duplicate
        );
        assert_eq!(
            ing.apply(&LogFrame::new(3, 0, payload(1, "1"))),
            ApplyOutcome::Duplicate
        );
        assert_eq!(ing.metrics.export()["records_duplicate"], 2);
        assert_eq!(
            ing.store().row(AssetId::new(1)).unwrap().unwrap().avg_price,
            1.0
        );
    }

    #[test]
    fn test_run_ingestion_stops_on_shutdown_and_snapshots() {
        let tmp = TempDir::new().unwrap();
        let log_dir = tmp.path().join("log");
        let mut writer = LogWriter::open(LogConfig::new(&log_dir)).unwrap();
        for price in ["1", "2", "3"] {
            writer.append(&payload(1, price)).unwrap();
        }

        let store = Arc::new(AggregationStore::new());
        let ing = Ingester::new(store.clone(), Arc::new(ServiceMetrics::new()));
        let status = ing.status();
        let tailer = LogTailer::open(&log_dir, 0).unwrap();
        let config = IngesterConfig {
            poll_interval: Duration::from_millis(5),
            snapshot_dir: tmp.path().join("snap"),
            snapshot_every_records: 2,
            snapshots_retained: 3,
            compress_snapshots: false,
        };

        let (tx, rx) = watch::channel(false);
        let handle = std::thread::spawn(move || run_ingestion(ing, tailer, config, rx));

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.watermark() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        tx.send(true).unwrap();
        let last = handle.join().unwrap().unwrap();

        assert_eq!(last, 3);
        assert_eq!(status.phase(), IngestionPhase::Stopped);
        assert_eq!(status.last_offset(), 3);
        assert_eq!(
            store.row(AssetId::new(1)).unwrap().unwrap().avg_price,
            2.0
        );
        // One periodic snapshot at 2 records, one on shutdown at 3.
        let snapshots = SnapshotLoader::new(tmp.path().join("snap"))
            .list_snapshots()
            .unwrap();
        assert_eq!(
            snapshots.iter().map(|(o, _)| *o).collect::<Vec<_>>(),
            vec![2, 3]
        );
    }

    #[test]
    fn test_run_ingestion_counts_every_damaged_region() {
        let tmp = TempDir::new().unwrap();
        let log_dir = tmp.path().join("log");
        std::fs::create_dir_all(&log_dir).unwrap();

        let mut sealed = LogFrame::new(1, 0, payload(1, "1")).to_bytes();
        sealed.extend(std::iter::repeat(0xFF).take(4096));
        std::fs::write(log_dir.join("segment-000000.log"), sealed).unwrap();

        let mut bad = LogFrame::new(2, 0, payload(1, "100"));
        bad.checksum ^= 1;
        let mut live = bad.to_bytes();
        live.extend(LogFrame::new(3, 0, payload(1, "3")).to_bytes());
        std::fs::write(log_dir.join("segment-000001.log"), live).unwrap();

        let store = Arc::new(AggregationStore::new());
        let metrics = Arc::new(ServiceMetrics::new());
        let ing = Ingester::new(store.clone(), metrics.clone());
        let tailer = LogTailer::open(&log_dir, 0).unwrap();
        let config = IngesterConfig {
            poll_interval: Duration::from_millis(5),
            snapshot_dir: tmp.path().join("snap"),
            snapshot_every_records: 0,
            ..IngesterConfig::default()
        };

        let (tx, rx) = watch::channel(false);
        let handle = std::thread::spawn(move || run_ingestion(ing, tailer, config, rx));

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.watermark() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        tx.send(true).unwrap();
        assert_eq!(handle.join().unwrap().unwrap(), 3);

        let exported = metrics.export();
        assert_eq!(exported["frames_corrupt"], 2);
        assert_eq!(exported["records_ingested"], 2);
        assert_eq!(
            store.row(AssetId::new(1)).unwrap().unwrap().avg_price,
            2.0
        );
    }

    #[test]
    fn test_unreadable_log_marks_ingestion_failed() {
        let tmp = TempDir::new().unwrap();
        // A plain file where the log directory should be.
        let log_dir = tmp.path().join("log");
        std::fs::write(&log_dir, b"not a directory").unwrap();

        let ing = ingester();
        let status = ing.status();
        assert_eq!(status.phase(), IngestionPhase::Running);

        let tailer = LogTailer::open(&log_dir, 0).unwrap();
        let (_tx, rx) = watch::channel(false);
        let result = run_ingestion(ing, tailer, IngesterConfig::default(), rx);

        assert!(matches!(result, Err(IngestionError::Tail(TailError::Io(_)))));
        assert!(status.is_failed());
        assert!(status.last_error().is_some());
    }
}
