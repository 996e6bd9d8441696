//! Pipeline Checkpoints: durable per-pipeline delivery cursors
//!
//! Each delivery pipeline owns one directory holding `checkpoint.json`. The
//! file records the last cycle whose batch the sink confirmed and the log
//! offset that batch covered. On restart the pipeline resumes after that
//! offset, so a batch is redelivered only if its checkpoint never landed.
//!
//! Writes are atomic (tmp file, fsync, rename) and carry a SHA-256 over the
//! checkpoint body so a damaged file is detected rather than trusted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CHECKPOINT_FILE: &str = "checkpoint.json";

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt checkpoint at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

// ── Checkpoint ──────────────────────────────────────────────────────

/// Last confirmed delivery for one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineCheckpoint {
    pub pipeline: String,
    /// Cycle whose batch was delivered. 0 before the first delivery.
    pub cycle_id: u64,
    /// Every record at or below this log offset is reflected downstream.
    pub committed_offset: u64,
    /// Rows in the delivered batch.
    pub rows_delivered: u64,
    pub committed_at: DateTime<Utc>,
}

impl PipelineCheckpoint {
    /// Starting point for a pipeline that has never delivered.
    pub fn initial(pipeline: &str) -> Self {
        Self {
            pipeline: pipeline.to_string(),
            cycle_id: 0,
            committed_offset: 0,
            rows_delivered: 0,
            committed_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    /// The checkpoint that follows a confirmed delivery.
    pub fn advance(&self, cycle_id: u64, committed_offset: u64, rows_delivered: u64) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
            cycle_id,
            committed_offset: committed_offset.max(self.committed_offset),
            rows_delivered,
            committed_at: Utc::now(),
        }
    }

    fn compute_hash(&self) -> Result<String, CheckpointError> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// On-disk form: the checkpoint plus its integrity hash.
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    #[serde(flatten)]
    checkpoint: PipelineCheckpoint,
    checksum: String,
}

// ── Store ───────────────────────────────────────────────────────────

/// Durable checkpoint storage keyed by pipeline name.
pub trait CheckpointStore: Send + Sync {
    /// Load the pipeline's checkpoint, or the initial one if none exists.
    fn load(&self, pipeline: &str) -> Result<PipelineCheckpoint, CheckpointError>;

    /// Durably replace the pipeline's checkpoint.
    fn commit(&self, checkpoint: &PipelineCheckpoint) -> Result<(), CheckpointError>;
}

/// Checkpoints stored as `<root>/<pipeline>/checkpoint.json`.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, pipeline: &str) -> PathBuf {
        self.root.join(pipeline).join(CHECKPOINT_FILE)
    }

    fn corrupt(path: &Path, reason: impl Into<String>) -> CheckpointError {
        CheckpointError::Corrupt {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, pipeline: &str) -> Result<PipelineCheckpoint, CheckpointError> {
        let path = self.path_for(pipeline);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(PipelineCheckpoint::initial(pipeline));
            }
            Err(e) => return Err(e.into()),
        };

        let file: CheckpointFile =
            serde_json::from_slice(&data).map_err(|e| Self::corrupt(&path, e.to_string()))?;

        let actual = file.checkpoint.compute_hash()?;
        if actual != file.checksum {
            return Err(Self::corrupt(
                &path,
                format!("checksum mismatch: expected {}, got {}", file.checksum, actual),
            ));
        }
        if file.checkpoint.pipeline != pipeline {
            return Err(Self::corrupt(
                &path,
                format!("belongs to pipeline '{}'", file.checkpoint.pipeline),
            ));
        }

        Ok(file.checkpoint)
    }

    fn commit(&self, checkpoint: &PipelineCheckpoint) -> Result<(), CheckpointError> {
        let path = self.path_for(&checkpoint.pipeline);
        let dir = self.root.join(&checkpoint.pipeline);
        fs::create_dir_all(&dir)?;

        let file = CheckpointFile {
            checkpoint: checkpoint.clone(),
            checksum: checkpoint.compute_hash()?,
        };
        let data = serde_json::to_vec_pretty(&file)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;

        // Atomic write: write to tmp, fsync, rename
        let tmp_path = dir.join(format!("{}.tmp", CHECKPOINT_FILE));
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&data)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;

        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────
