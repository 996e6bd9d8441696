//! Recovery Flow: rebuild aggregation state from snapshot + log replay
//!
//! Recovery process:
//! 1. Find the newest valid state snapshot (if any)
//! 2. Hand it to the applier to restore
//! 3. Tail the record log from the snapshot's offset
//! 4. Replay every frame up to the current end of the log
//! 5. Return the positioned tailer so live ingestion continues from there

use crate::log::LogFrame;
use crate::snapshot::{SnapshotError, SnapshotLoader, StateSnapshot};
use crate::tail::{LogTailer, TailError};
use std::path::PathBuf;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Log error: {0}")]
    Tail(#[from] TailError),
}

// ── Recovery Metrics ────────────────────────────────────────────────

/// Metrics collected during the recovery process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryMetrics {
    /// Offset the loaded snapshot is complete through (0 if none).
    pub snapshot_offset: u64,
    /// Assets restored from the snapshot.
    pub snapshot_entries: usize,
    /// Frames applied during replay.
    pub replayed: u64,
    /// Frames whose payload the applier refused.
    pub rejected: u64,
    /// Damaged log regions skipped, whether by checksum or structure.
    pub corrupt_frames: u64,
    /// Highest log offset consumed by the end of recovery.
    pub recovered_offset: u64,
    pub snapshot_load_time_ms: u64,
    pub replay_time_ms: u64,
    pub total_recovery_time_ms: u64,
}

// ── Frame Applier ───────────────────────────────────────────────────

/// What happened to one replayed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Payload could not be decoded; the frame is consumed but changes nothing.
    Rejected,
    /// Offset already reflected in state.
    Duplicate,
}

/// Consumer-defined state that recovery rebuilds.
pub trait FrameApplier {
    /// Replace current state with the snapshot's contents.
    fn restore(&mut self, snapshot: &StateSnapshot);

    /// Fold one log frame into state.
    fn apply(&mut self, frame: &LogFrame) -> ApplyOutcome;
}

// ── Recovery Engine ─────────────────────────────────────────────────

/// Orchestrates snapshot loading + log replay.
pub struct RecoveryEngine {
    snapshot_dir: PathBuf,
    log_dir: PathBuf,
}

impl RecoveryEngine {
    pub fn new(snapshot_dir: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_dir: snapshot_dir.into(),
            log_dir: log_dir.into(),
        }
    }

    /// Rebuild state into `applier` and return a tailer positioned after the
    /// last replayed frame.
    pub fn recover(
        &self,
        applier: &mut dyn FrameApplier,
    ) -> Result<(LogTailer, RecoveryMetrics), RecoveryError> {
        let total_start = Instant::now();
        let mut metrics = RecoveryMetrics::default();

        info!(
            snapshot_dir = %self.snapshot_dir.display(),
            log_dir = %self.log_dir.display(),
            "Recovery started"
        );

        // Step 1: Load snapshot (if available)
        let load_start = Instant::now();
        let snapshot = SnapshotLoader::new(&self.snapshot_dir).load_latest_valid()?;
        metrics.snapshot_load_time_ms = load_start.elapsed().as_millis() as u64;

        if let Some(snapshot) = &snapshot {
            applier.restore(snapshot);
            metrics.snapshot_offset = snapshot.through_offset;
            metrics.snapshot_entries = snapshot.entries.len();
            info!(
                through_offset = snapshot.through_offset,
                entries = snapshot.entries.len(),
                "Restored state snapshot"
            );
        } else {
            info!("No state snapshot found, replaying full log");
        }

        // Step 2: Replay the log suffix
        let replay_start = Instant::now();
        let mut tailer = LogTailer::open(&self.log_dir, metrics.snapshot_offset)?;
        loop {
            match tailer.poll() {
                Ok(Some(frame)) => match applier.apply(&frame) {
                    ApplyOutcome::Applied => metrics.replayed += 1,
                    ApplyOutcome::Rejected => metrics.rejected += 1,
                    ApplyOutcome::Duplicate => {}
                },
                Ok(None) => break,
                Err(TailError::ChecksumMismatch { offset, .. }) => {
                    warn!(offset, "Skipping corrupt frame during replay");
                }
                Err(e) => return Err(e.into()),
            }
        }
        metrics.corrupt_frames = tailer.corruption_count();
        metrics.replay_time_ms = replay_start.elapsed().as_millis() as u64;
        metrics.recovered_offset = tailer.last_offset();
        metrics.total_recovery_time_ms = total_start.elapsed().as_millis() as u64;

        info!(
            snapshot_offset = metrics.snapshot_offset,
            replayed = metrics.replayed,
            rejected = metrics.rejected,
            corrupt_frames = metrics.corrupt_frames,
            recovered_offset = metrics.recovered_offset,
            total_ms = metrics.total_recovery_time_ms,
            "Recovery complete"
        );

        Ok((tailer, metrics))
    }
}

// ── Tests ───────────────────────────────────────────────────────────
