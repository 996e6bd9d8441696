//! Record Log: append-only segment log of ingested payloads
//!
//! The ordered source the aggregator consumes. Producers append encoded
//! records; every frame gets the next gapless offset starting at 1.
//!
//! # Binary Format (per frame)
//! ```text
//! [body_len:    u32]
//! [offset:      u64]
//! [ingested_at: i64]   // unix nanoseconds, writer clock
//! [payload_len: u32][payload: bytes]
//! [checksum:    u32]   // CRC32C over offset+ingested_at+payload
//! ```
//!
//! Segments are named `segment-NNNNNN.log` and rotate by size.

use crc32c::crc32c;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Smallest legal body: offset + ingested_at + payload_len + checksum.
const MIN_BODY_LEN: usize = 8 + 8 + 4 + 4;

/// Bodies larger than this are treated as corruption.
const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum LogError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Log size limit exceeded: {current} >= {limit}")]
    SizeLimitExceeded { current: u64, limit: u64 },
}

// ── Frame ───────────────────────────────────────────────────────────

/// One persisted record payload.
#[derive(Debug, Clone, PartialEq)]
pub struct LogFrame {
    /// Gapless monotonic position in the log
    pub offset: u64,
    /// Unix nanoseconds at append time
    pub ingested_at: i64,
    /// Encoded record
    pub payload: Vec<u8>,
    /// CRC32C over (offset ++ ingested_at ++ payload)
    pub checksum: u32,
}

impl LogFrame {
    /// Create a frame, computing its checksum.
    pub fn new(offset: u64, ingested_at: i64, payload: Vec<u8>) -> Self {
        let checksum = Self::compute_checksum(offset, ingested_at, &payload);
        Self {
            offset,
            ingested_at,
            payload,
            checksum,
        }
    }

    pub fn compute_checksum(offset: u64, ingested_at: i64, payload: &[u8]) -> u32 {
        let mut buf = Vec::with_capacity(16 + payload.len());
        buf.extend_from_slice(&offset.to_le_bytes());
        buf.extend_from_slice(&ingested_at.to_le_bytes());
        buf.extend_from_slice(payload);
        crc32c(&buf)
    }

    pub fn verify_checksum(&self) -> bool {
        self.checksum == Self::compute_checksum(self.offset, self.ingested_at, &self.payload)
    }

    /// Serialize to the wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload_len = self.payload.len() as u32;
        let body_len = (MIN_BODY_LEN + self.payload.len()) as u32;

        let mut buf = Vec::with_capacity(4 + body_len as usize);
        buf.extend_from_slice(&body_len.to_le_bytes());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.ingested_at.to_le_bytes());
        buf.extend_from_slice(&payload_len.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Parse one frame from the front of `data`.
    ///
    /// `Ok(None)` means `data` holds only a prefix of a frame (or nothing):
    /// more bytes are needed. Structural nonsense is `Malformed`. The
    /// checksum is NOT verified here.
    pub fn from_bytes(data: &[u8]) -> Result<Option<(Self, usize)>, LogError> {
        if data.len() < 4 {
            return Ok(None);
        }

        let body_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if body_len > MAX_BODY_LEN {
            return Err(LogError::Malformed(format!(
                "implausible body length {}",
                body_len
            )));
        }
        if body_len < MIN_BODY_LEN {
            return Err(LogError::Malformed(format!(
                "body too small: {} bytes, minimum is {}",
                body_len, MIN_BODY_LEN
            )));
        }

        let total = 4 + body_len;
        if data.len() < total {
            return Ok(None);
        }

        let body = &data[4..total];
        let offset = read_u64(body, 0);
        let ingested_at = read_u64(body, 8) as i64;
        let payload_len = read_u32(body, 16) as usize;

        if 20 + payload_len + 4 != body.len() {
            return Err(LogError::Malformed(format!(
                "payload_len {} inconsistent with body length {}",
                payload_len,
                body.len()
            )));
        }

        let payload = body[20..20 + payload_len].to_vec();
        let checksum = read_u32(body, 20 + payload_len);

        Ok(Some((
            Self {
                offset,
                ingested_at,
                payload,
                checksum,
            },
            total,
        )))
    }
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

// ── Segment helpers ─────────────────────────────────────────────────

pub(crate) fn segment_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("segment-{:06}.log", index))
}

/// All segment files in `dir`, sorted by index.
pub(crate) fn list_segments(dir: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut segments: Vec<(u64, PathBuf)> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            let index = name
                .strip_prefix("segment-")?
                .strip_suffix(".log")?
                .parse::<u64>()
                .ok()?;
            Some((index, e.path()))
        })
        .collect();

    segments.sort_by_key(|(idx, _)| *idx);
    Ok(segments)
}

// ── Flush / Fsync Policies ──────────────────────────────────────────

/// Controls when buffered data is flushed to the OS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlushPolicy {
    EveryWrite,
    EveryN(usize),
}

/// Controls when `fsync` is called.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FsyncPolicy {
    EveryWrite,
    EveryN(usize),
    OnRotation,
}

// ── Writer ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub dir: PathBuf,
    /// Rotate after a segment reaches this many bytes (default 64 MiB).
    pub max_segment_size: u64,
    /// Refuse appends past this total size (0 = unlimited).
    pub max_total_size: u64,
    pub flush_policy: FlushPolicy,
    pub fsync_policy: FsyncPolicy,
}

impl LogConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_segment_size: 64 * 1024 * 1024,
            max_total_size: 0,
            flush_policy: FlushPolicy::EveryWrite,
            fsync_policy: FsyncPolicy::EveryWrite,
        }
    }
}

/// Append-only writer with rotation and fsync control.
///
/// On open, the newest segment is scanned to find the next offset; a torn
/// frame left by a crash is truncated away before appending resumes.
pub struct LogWriter {
    config: LogConfig,
    writer: BufWriter<File>,
    current_segment: PathBuf,
    current_segment_size: u64,
    segment_index: u64,
    next_offset: u64,
    writes_since_flush: usize,
    writes_since_fsync: usize,
    total_size: u64,
}

impl LogWriter {
    pub fn open(config: LogConfig) -> Result<Self, LogError> {
        fs::create_dir_all(&config.dir)?;

        let segments = list_segments(&config.dir)?;
        let segment_index = segments.last().map(|(idx, _)| *idx).unwrap_or(0);
        let current_segment = segment_path(&config.dir, segment_index);

        let last_offset = Self::recover_tail(&current_segment)?;
        let last_offset = match last_offset {
            Some(offset) => offset,
            // Newest segment is empty: the previous one holds the last offset.
            None => match segments.iter().rev().nth(1) {
                Some((_, prev)) => Self::recover_tail(prev)?.unwrap_or(0),
                None => 0,
            },
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&current_segment)?;
        let current_segment_size = file.metadata()?.len();

        let mut total_size = 0u64;
        for (_, path) in &segments {
            total_size += fs::metadata(path)?.len();
        }

        info!(
            dir = %config.dir.display(),
            segment = segment_index,
            next_offset = last_offset + 1,
            "Record log opened"
        );

        Ok(Self {
            config,
            writer: BufWriter::new(file),
            current_segment,
            current_segment_size,
            segment_index,
            next_offset: last_offset + 1,
            writes_since_flush: 0,
            writes_since_fsync: 0,
            total_size,
        })
    }

    /// Offset the next append will receive.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    pub fn current_segment_path(&self) -> &Path {
        &self.current_segment
    }

    /// Append a payload stamped with the current wall clock.
    pub fn append(&mut self, payload: &[u8]) -> Result<u64, LogError> {
        let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0);
        self.append_at(now, payload)
    }

    /// Append a payload with an explicit ingestion timestamp.
    pub fn append_at(&mut self, ingested_at: i64, payload: &[u8]) -> Result<u64, LogError> {
        if self.config.max_total_size > 0 && self.total_size >= self.config.max_total_size {
            return Err(LogError::SizeLimitExceeded {
                current: self.total_size,
                limit: self.config.max_total_size,
            });
        }

        if self.current_segment_size >= self.config.max_segment_size {
            self.rotate()?;
        }

        let offset = self.next_offset;
        let bytes = LogFrame::new(offset, ingested_at, payload.to_vec()).to_bytes();
        self.writer.write_all(&bytes)?;

        let written = bytes.len() as u64;
        self.current_segment_size += written;
        self.total_size += written;
        self.next_offset += 1;
        self.writes_since_flush += 1;
        self.writes_since_fsync += 1;

        self.apply_flush_policy()?;
        self.apply_fsync_policy()?;

        Ok(offset)
    }

    /// Force flush + fsync.
    pub fn sync(&mut self) -> Result<(), LogError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.writes_since_flush = 0;
        self.writes_since_fsync = 0;
        Ok(())
    }

    // ── Internal Helpers ────────────────────────────────────────────

    fn apply_flush_policy(&mut self) -> Result<(), LogError> {
        let should_flush = match self.config.flush_policy {
            FlushPolicy::EveryWrite => true,
            FlushPolicy::EveryN(n) => self.writes_since_flush >= n,
        };
        if should_flush {
            self.writer.flush()?;
            self.writes_since_flush = 0;
        }
        Ok(())
    }

    fn apply_fsync_policy(&mut self) -> Result<(), LogError> {
        let should_fsync = match self.config.fsync_policy {
            FsyncPolicy::EveryWrite => true,
            FsyncPolicy::EveryN(n) => self.writes_since_fsync >= n,
            FsyncPolicy::OnRotation => false,
        };
        if should_fsync {
            self.writer.flush()?;
            self.writer.get_ref().sync_all()?;
            self.writes_since_fsync = 0;
        }
        Ok(())
    }

    fn rotate(&mut self) -> Result<(), LogError> {
        // The old segment must be complete on disk before the new one
        // appears: tailers treat a newer segment as proof the old one is final.
        self.sync()?;

        self.segment_index += 1;
        self.current_segment = segment_path(&self.config.dir, self.segment_index);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.current_segment)?;

        debug!(segment = self.segment_index, "Rotated record log segment");

        self.writer = BufWriter::new(file);
        self.current_segment_size = 0;
        Ok(())
    }

    /// Find the last complete frame's offset in a segment, truncating any
    /// torn bytes after it.
    fn recover_tail(path: &Path) -> Result<Option<u64>, LogError> {
        if !path.exists() {
            return Ok(None);
        }

        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;

        let mut pos = 0usize;
        let mut last = None;
        while pos < data.len() {
            match LogFrame::from_bytes(&data[pos..]) {
                Ok(Some((frame, used))) if frame.verify_checksum() => {
                    last = Some(frame.offset);
                    pos += used;
                }
                _ => break,
            }
        }

        if pos < data.len() {
            warn!(
                segment = %path.display(),
                valid_bytes = pos,
                torn_bytes = data.len() - pos,
                "Truncating torn tail of record log segment"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(pos as u64)?;
            file.sync_all()?;
        }

        Ok(last)
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    #[test]
    fn test_frame_checksum_detects_tamper() {
        let mut frame = LogFrame::new(1, 100, b"{\"a\":1}".to_vec());
        assert!(frame.verify_checksum());
        frame.payload = b"{\"a\":2}".to_vec();
        assert!(!frame.verify_checksum());
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = LogFrame::new(42, 1_708_123_456_789_000_000, vec![1, 2, 3]);
        let bytes = frame.to_bytes();
        let (decoded, used) = LogFrame::from_bytes(&bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_partial_frame_needs_more_bytes() {
        let bytes = LogFrame::new(1, 0, vec![9; 32]).to_bytes();
        for cut in [0, 3, 4, 10, bytes.len() - 1] {
            assert!(LogFrame::from_bytes(&bytes[..cut]).unwrap().is_none());
        }
    }

    #[test]
    fn test_implausible_length_is_malformed() {
        let bytes = u32::MAX.to_le_bytes();
        assert!(matches!(
            LogFrame::from_bytes(&bytes),
            Err(LogError::Malformed(_))
        ));
    }

    #[test]
    fn test_offsets_start_at_one_and_are_gapless() {
        let tmp = TempDir::new().unwrap();
        let mut writer = LogWriter::open(LogConfig::new(tmp.path())).unwrap();
        assert_eq!(writer.append(b"a").unwrap(), 1);
        assert_eq!(writer.append(b"b").unwrap(), 2);
        assert_eq!(writer.next_offset(), 3);
    }

    #[test]
    fn test_reopen_continues_offsets() {
        let tmp = TempDir::new().unwrap();
        {
            let mut writer = LogWriter::open(LogConfig::new(tmp.path())).unwrap();
            for _ in 0..5 {
                writer.append(b"x").unwrap();
            }
            writer.sync().unwrap();
        }
        let writer = LogWriter::open(LogConfig::new(tmp.path())).unwrap();
        assert_eq!(writer.next_offset(), 6);
    }

    #[test]
    fn test_reopen_truncates_torn_tail() {
        let tmp = TempDir::new().unwrap();
        let path = {
            let mut writer = LogWriter::open(LogConfig::new(tmp.path())).unwrap();
            writer.append(b"good").unwrap();
            writer.sync().unwrap();
            writer.current_segment_path().to_path_buf()
        };
        let good_len = fs::metadata(&path).unwrap().len();

        // Simulate a crash mid-frame.
        let torn = LogFrame::new(2, 0, b"torn".to_vec()).to_bytes();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&torn[..7]).unwrap();
        drop(file);

        let mut writer = LogWriter::open(LogConfig::new(tmp.path())).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
        assert_eq!(writer.append(b"next").unwrap(), 2);
    }

    #[test]
    fn test_rotation_creates_segments() {
        let tmp = TempDir::new().unwrap();
        let config = LogConfig {
            max_segment_size: 100,
            ..LogConfig::new(tmp.path())
        };
        let mut writer = LogWriter::open(config.clone()).unwrap();
        for _ in 0..20 {
            writer.append(&[7u8; 16]).unwrap();
        }
        assert!(list_segments(tmp.path()).unwrap().len() > 1);

        drop(writer);
        let writer = LogWriter::open(config).unwrap();
        assert_eq!(writer.next_offset(), 21);
    }

    #[test]
    fn test_total_size_limit() {
        let tmp = TempDir::new().unwrap();
        let config = LogConfig {
            max_total_size: 200,
            ..LogConfig::new(tmp.path())
        };
        let mut writer = LogWriter::open(config).unwrap();

        let mut hit_limit = false;
        for _ in 0..100 {
            match writer.append(&[1u8; 32]) {
                Ok(_) => {}
                Err(LogError::SizeLimitExceeded { .. }) => {
                    hit_limit = true;
                    break;
                }
                Err(e) => panic!("Unexpected error: {:?}", e),
            }
        }
        assert!(hit_limit);
    }

    #[test]
    fn test_segment_naming() {
        assert_eq!(
            segment_path(Path::new("/tmp"), 42),
            PathBuf::from("/tmp/segment-000042.log")
        );
    }

    proptest! {
        #[test]
        fn prop_from_bytes_never_panics(data in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = LogFrame::from_bytes(&data);
        }
    }
}
