//! State Snapshots: aggregation state with integrity and compression
//!
//! A snapshot captures every per-asset aggregate together with the log
//! offset it is complete through, so recovery can restore it and replay only
//! the log suffix.
//!
//! Features:
//! - BTreeMap-keyed entries for deterministic serialization
//! - SHA-256 integrity hash over the bincode encoding of the entries
//! - Optional zstd compression
//! - Snapshot versioning for forward compatibility
//! - Interval policy (every N applied records)
//! - Cleanup policy (keep last N snapshots)

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use types::aggregate::AggregateState;
use types::ids::AssetId;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Integrity check failed: expected {expected}, got {actual}")]
    IntegrityFailure { expected: String, actual: String },

    #[error("Unsupported snapshot version: {0}")]
    UnsupportedVersion(u32),

    #[error("Compression error: {0}")]
    Compression(String),
}

// ── Keyed Aggregate ─────────────────────────────────────────────────

/// One asset's aggregate plus the offset of the last record folded into it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyedAggregate {
    pub state: AggregateState,
    pub last_offset: u64,
}

// ── Snapshot ────────────────────────────────────────────────────────

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Aggregation state as of a log offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Snapshot format version for forward compatibility.
    pub version: u32,
    /// Every record at or below this offset is reflected in `entries`.
    pub through_offset: u64,
    /// Unix nanosecond timestamp when the snapshot was taken.
    pub taken_at: i64,
    pub entries: BTreeMap<AssetId, KeyedAggregate>,
    /// SHA-256 hash of the serialized entries.
    pub checksum: String,
}

impl StateSnapshot {
    /// Create a snapshot with computed integrity hash.
    pub fn new(
        through_offset: u64,
        taken_at: i64,
        entries: BTreeMap<AssetId, KeyedAggregate>,
    ) -> Result<Self, SnapshotError> {
        let checksum = compute_hash(&entries)?;
        Ok(Self {
            version: SNAPSHOT_VERSION,
            through_offset,
            taken_at,
            entries,
            checksum,
        })
    }

    /// Verify the snapshot's integrity hash.
    pub fn verify_integrity(&self) -> Result<(), SnapshotError> {
        let actual = compute_hash(&self.entries)?;
        if actual == self.checksum {
            Ok(())
        } else {
            Err(SnapshotError::IntegrityFailure {
                expected: self.checksum.clone(),
                actual,
            })
        }
    }
}

/// Deterministic SHA-256 over the bincode encoding of the entries.
pub fn compute_hash(entries: &BTreeMap<AssetId, KeyedAggregate>) -> Result<String, SnapshotError> {
    let bytes =
        bincode::serialize(entries).map_err(|e| SnapshotError::Serialization(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

// ── Snapshot Writer ─────────────────────────────────────────────────

/// Writes snapshots to disk with optional zstd compression.
pub struct SnapshotWriter {
    dir: PathBuf,
    compress: bool,
}

impl SnapshotWriter {
    /// Create a new writer. `compress` enables zstd compression.
    pub fn new(dir: impl Into<PathBuf>, compress: bool) -> Self {
        Self {
            dir: dir.into(),
            compress,
        }
    }

    /// Write a snapshot atomically: serialize → compress → write tmp → rename.
    pub fn write(&self, snapshot: &StateSnapshot) -> Result<PathBuf, SnapshotError> {
        fs::create_dir_all(&self.dir)?;

        let data = bincode::serialize(snapshot)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;

        let (final_data, ext) = if self.compress {
            let compressed = zstd::encode_all(data.as_slice(), 3)
                .map_err(|e| SnapshotError::Compression(e.to_string()))?;
            (compressed, "snap.zst")
        } else {
            (data, "snap")
        };

        let filename = format!("state-{:012}.{}", snapshot.through_offset, ext);
        let path = self.dir.join(&filename);
        let tmp_path = self.dir.join(format!("{}.tmp", filename));

        // Atomic write: write to tmp, fsync, rename
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&final_data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;

        debug!(
            path = %path.display(),
            through_offset = snapshot.through_offset,
            entries = snapshot.entries.len(),
            "State snapshot written"
        );

        Ok(path)
    }
}

// ── Snapshot Loader ─────────────────────────────────────────────────

/// Loads snapshots from disk, verifying integrity.
pub struct SnapshotLoader {
    dir: PathBuf,
}

impl SnapshotLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Load a specific snapshot file.
    pub fn load(&self, path: &Path) -> Result<StateSnapshot, SnapshotError> {
        let mut file = File::open(path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let is_compressed = path.extension().map(|e| e == "zst").unwrap_or(false);

        let decompressed = if is_compressed {
            zstd::decode_all(data.as_slice())
                .map_err(|e| SnapshotError::Compression(e.to_string()))?
        } else {
            data
        };

        let snapshot: StateSnapshot = bincode::deserialize(&decompressed)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;

        if snapshot.version > SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(snapshot.version));
        }
        snapshot.verify_integrity()?;

        Ok(snapshot)
    }

    /// Newest snapshot that loads and verifies. Damaged ones are skipped
    /// with a warning, falling back to older snapshots.
    pub fn load_latest_valid(&self) -> Result<Option<StateSnapshot>, SnapshotError> {
        for (offset, path) in self.list_snapshots()?.into_iter().rev() {
            match self.load(&path) {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(e) => warn!(
                    path = %path.display(),
                    through_offset = offset,
                    error = %e,
                    "Skipping unusable state snapshot"
                ),
            }
        }
        Ok(None)
    }

    /// List all snapshots as (through_offset, path) pairs, ascending.
    pub fn list_snapshots(&self) -> Result<Vec<(u64, PathBuf)>, SnapshotError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(offset) = Self::parse_offset(&name) {
                results.push((offset, entry.path()));
            }
        }
        results.sort_by_key(|(offset, _)| *offset);
        Ok(results)
    }

    fn parse_offset(filename: &str) -> Option<u64> {
        let rest = filename.strip_prefix("state-")?;
        let digits = rest
            .strip_suffix(".snap.zst")
            .or_else(|| rest.strip_suffix(".snap"))?;
        digits.parse::<u64>().ok()
    }
}

// ── Snapshot Interval Policy ────────────────────────────────────────

/// Decides when the ingestion loop should take a snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotIntervalPolicy {
    /// Snapshot every N applied records; 0 disables snapshots.
    pub record_interval: u64,
    applied_since: u64,
}

impl SnapshotIntervalPolicy {
    pub fn with_interval(record_interval: u64) -> Self {
        Self {
            record_interval,
            applied_since: 0,
        }
    }

    /// Count one applied record.
    pub fn record_applied(&mut self) {
        self.applied_since += 1;
    }

    pub fn should_snapshot(&self) -> bool {
        self.record_interval > 0 && self.applied_since >= self.record_interval
    }

    /// Reset after a snapshot was written.
    pub fn record_snapshot(&mut self) {
        self.applied_since = 0;
    }
}

// ── Snapshot Cleanup Policy ─────────────────────────────────────────

/// Policy for cleaning up old snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotCleanupPolicy {
    /// Maximum number of snapshots to retain.
    pub max_snapshots: usize,
}

impl SnapshotCleanupPolicy {
    pub fn new(max_snapshots: usize) -> Self {
        Self { max_snapshots }
    }

    /// Remove old snapshots, keeping only the most recent `max_snapshots`.
    pub fn cleanup(&self, dir: &Path) -> Result<Vec<PathBuf>, SnapshotError> {
        let snapshots = SnapshotLoader::new(dir).list_snapshots()?;

        let mut removed = Vec::new();
        if snapshots.len() > self.max_snapshots {
            let to_remove = snapshots.len() - self.max_snapshots;
            for (_, path) in snapshots.iter().take(to_remove) {
                fs::remove_file(path)?;
                removed.push(path.clone());
            }
        }
        Ok(removed)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
