//! Log Tailer: follows the record log as it grows
//!
//! Reads frames in offset order across segments and keeps waiting at the
//! live tail. Frames at or below the starting offset are skipped, which is
//! how recovery resumes after a snapshot.
//!
//! Damage handling:
//! - checksum mismatch: the frame is skipped and reported as an error so the
//!   caller can count it; the next poll continues after it
//! - malformed bytes: resync byte by byte until a frame parses; the whole
//!   damaged region is one corruption record
//! - trailing partial frame in a sealed segment: recorded and abandoned
//! - segment truncated under the tailer (a writer repairing a torn tail on
//!   restart): the unconsumed bytes are re-read from the new end
//!
//! Only the most recent corruption records are kept; `corruption_count`
//! keeps the running total.

use crate::log::{list_segments, LogError, LogFrame};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Compact the read buffer once this many consumed bytes accumulate.
const COMPACT_THRESHOLD: usize = 1024 * 1024;

/// Corruption records retained for inspection.
pub const MAX_CORRUPTION_RECORDS: usize = 256;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum TailError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Checksum mismatch in {segment} at byte {byte_offset}: frame offset={offset}")]
    ChecksumMismatch {
        segment: String,
        byte_offset: u64,
        offset: u64,
    },
}

// ── Corruption Log ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CorruptionRecord {
    pub segment: PathBuf,
    /// Byte position within the segment.
    pub byte_offset: u64,
    pub kind: CorruptionKind,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CorruptionKind {
    ChecksumMismatch,
    Malformed,
    TruncatedFrame,
}

#[derive(Default)]
struct CorruptionLog {
    records: Vec<CorruptionRecord>,
    total: u64,
    /// Start of the malformed region currently being skipped.
    open_region: Option<u64>,
}

impl CorruptionLog {
    fn push(&mut self, record: CorruptionRecord) {
        if self.records.len() >= MAX_CORRUPTION_RECORDS {
            self.records.remove(0);
        }
        self.records.push(record);
        self.total += 1;
    }

    /// Note one malformed byte at `at`; only the first byte of a region
    /// produces a record.
    fn malformed_byte(&mut self, segment: &Path, at: u64, detail: String) {
        if self.open_region.is_some() {
            return;
        }
        warn!(
            segment = %segment.display(),
            byte_offset = at,
            detail = %detail,
            "Malformed bytes in record log; resyncing"
        );
        self.open_region = Some(at);
        self.push(CorruptionRecord {
            segment: segment.to_path_buf(),
            byte_offset: at,
            kind: CorruptionKind::Malformed,
            detail,
        });
    }

    /// Close the open region, if any, now that parsing resumed at `at`.
    fn close_region(&mut self, at: u64) {
        let Some(start) = self.open_region.take() else {
            return;
        };
        let skipped = at.saturating_sub(start);
        if let Some(last) = self
            .records
            .last_mut()
            .filter(|r| r.byte_offset == start && r.kind == CorruptionKind::Malformed)
        {
            last.detail = format!("{} bytes skipped", skipped);
        }
    }
}

// ── Tailer ──────────────────────────────────────────────────────────

struct OpenSegment {
    index: u64,
    path: PathBuf,
    file: File,
    /// Bytes read from `file` and not yet compacted away.
    buf: Vec<u8>,
    /// Read position within `buf`.
    pos: usize,
    /// Segment byte position of `buf[0]`.
    base: u64,
}

impl OpenSegment {
    fn open(index: u64, path: PathBuf) -> io::Result<Self> {
        let file = File::open(&path)?;
        Ok(Self {
            index,
            path,
            file,
            buf: Vec::new(),
            pos: 0,
            base: 0,
        })
    }

    /// Re-read the segment from the first unconsumed byte and return how
    /// far the known end of the segment grew.
    ///
    /// Unconsumed bytes are never trusted across calls: a restarted writer
    /// may have truncated a torn frame and appended new frames in its place.
    fn fill(&mut self) -> io::Result<usize> {
        if self.pos >= COMPACT_THRESHOLD {
            self.buf.drain(..self.pos);
            self.base += self.pos as u64;
            self.pos = 0;
        }

        let prev_end = self.base + self.buf.len() as u64;
        let len = self.file.metadata()?.len();
        let mut resume = self.byte_offset();
        if len < resume {
            warn!(
                segment = %self.path.display(),
                consumed = resume,
                new_len = len,
                "Record log segment shrank below read position; resuming at new end"
            );
            resume = len;
        }

        if resume < self.base {
            self.buf.clear();
            self.base = resume;
        } else {
            self.buf.truncate((resume - self.base) as usize);
        }
        self.pos = self.buf.len();

        self.file.seek(SeekFrom::Start(resume))?;
        self.file.read_to_end(&mut self.buf)?;
        let end = self.base + self.buf.len() as u64;
        Ok(end.saturating_sub(prev_end) as usize)
    }

    fn remaining(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    fn byte_offset(&self) -> u64 {
        self.base + self.pos as u64
    }
}

enum Step {
    Frame(LogFrame),
    Corrupt(LogFrame, u64),
    NeedMore,
}

/// Incremental reader over a growing record log directory.
pub struct LogTailer {
    dir: PathBuf,
    after_offset: u64,
    segment: Option<OpenSegment>,
    last_offset: u64,
    corruption: CorruptionLog,
}

impl LogTailer {
    /// Start tailing `dir`, yielding only frames with offset > `after_offset`.
    ///
    /// The directory may not exist yet; polling waits for the first segment.
    pub fn open(dir: &Path, after_offset: u64) -> Result<Self, TailError> {
        Ok(Self {
            dir: dir.to_path_buf(),
            after_offset,
            segment: None,
            last_offset: after_offset,
            corruption: CorruptionLog::default(),
        })
    }

    /// Highest offset yielded so far (or the starting offset).
    pub fn last_offset(&self) -> u64 {
        self.last_offset
    }

    /// The most recent corruption records, oldest first.
    pub fn corruption_log(&self) -> &[CorruptionRecord] {
        &self.corruption.records
    }

    /// Damaged regions seen since open, including ones no longer retained.
    pub fn corruption_count(&self) -> u64 {
        self.corruption.total
    }

    /// Next frame, or `Ok(None)` if the log holds nothing new right now.
    pub fn poll(&mut self) -> Result<Option<LogFrame>, TailError> {
        loop {
            if self.segment.is_none() && !self.open_next_segment()? {
                return Ok(None);
            }

            match self.step()? {
                Step::Frame(frame) => {
                    if frame.offset <= self.after_offset || frame.offset <= self.last_offset {
                        continue;
                    }
                    self.last_offset = frame.offset;
                    return Ok(Some(frame));
                }
                Step::Corrupt(frame, byte_offset) => {
                    let segment = self.current_path_display();
                    if frame.offset > self.last_offset {
                        self.last_offset = frame.offset;
                    }
                    return Err(TailError::ChecksumMismatch {
                        segment,
                        byte_offset,
                        offset: frame.offset,
                    });
                }
                Step::NeedMore => {
                    if !self.advance_if_sealed()? {
                        return Ok(None);
                    }
                }
            }
        }
    }

    // ── Internal Helpers ────────────────────────────────────────────

    /// Parse the next frame from the current segment, reading more bytes
    /// from disk when the buffer runs dry.
    fn step(&mut self) -> Result<Step, TailError> {
        let mut refilled = false;
        loop {
            let Some(seg) = self.segment.as_mut() else {
                return Ok(Step::NeedMore);
            };

            match LogFrame::from_bytes(seg.remaining()) {
                Ok(Some((frame, used))) => {
                    let at = seg.byte_offset();
                    self.corruption.close_region(at);
                    seg.pos += used;
                    if frame.verify_checksum() {
                        return Ok(Step::Frame(frame));
                    }
                    if frame.offset <= self.after_offset {
                        continue;
                    }
                    let path = seg.path.clone();
                    warn!(
                        segment = %path.display(),
                        byte_offset = at,
                        offset = frame.offset,
                        "Record log frame failed checksum; skipping"
                    );
                    self.corruption.push(CorruptionRecord {
                        segment: path,
                        byte_offset: at,
                        kind: CorruptionKind::ChecksumMismatch,
                        detail: format!("frame offset {}", frame.offset),
                    });
                    return Ok(Step::Corrupt(frame, at));
                }
                Ok(None) => {
                    if refilled {
                        return Ok(Step::NeedMore);
                    }
                    seg.fill()?;
                    refilled = true;
                }
                Err(LogError::Io(e)) => return Err(TailError::Io(e)),
                Err(LogError::Malformed(detail)) => {
                    self.corruption
                        .malformed_byte(&seg.path, seg.byte_offset(), detail);
                    seg.pos += 1;
                }
                Err(other) => {
                    self.corruption
                        .malformed_byte(&seg.path, seg.byte_offset(), other.to_string());
                    seg.pos += 1;
                }
            }
        }
    }

    /// Move past the current segment once a newer one exists. The current
    /// file is drained one final time first, since the writer seals a
    /// segment before creating its successor.
    fn advance_if_sealed(&mut self) -> Result<bool, TailError> {
        let Some(current) = self.segment.as_ref().map(|s| s.index) else {
            return Ok(false);
        };

        let next = list_segments(&self.dir)?
            .into_iter()
            .find(|(idx, _)| *idx > current);
        let Some((next_index, next_path)) = next else {
            return Ok(false);
        };

        if let Some(seg) = self.segment.as_mut() {
            if seg.fill()? > 0 {
                return Ok(true);
            }
            if !seg.remaining().is_empty() {
                let at = seg.byte_offset();
                let leftover = seg.remaining().len();
                // Sealed: an unparseable prefix is damage, not a pending write.
                if let Some(skip) = next_valid_frame(seg.remaining()) {
                    if self.corruption.open_region.is_none() {
                        warn!(
                            segment = %seg.path.display(),
                            byte_offset = at,
                            skipped_bytes = skip,
                            "Skipping damaged bytes in sealed segment"
                        );
                        self.corruption.push(CorruptionRecord {
                            segment: seg.path.clone(),
                            byte_offset: at,
                            kind: CorruptionKind::Malformed,
                            detail: format!("{} bytes skipped", skip),
                        });
                    }
                    seg.pos += skip;
                    return Ok(true);
                }
                if self.corruption.open_region.is_some() {
                    // The trailing bytes belong to the region already reported.
                    self.corruption.close_region(at + leftover as u64);
                } else {
                    warn!(
                        segment = %seg.path.display(),
                        leftover_bytes = leftover,
                        "Abandoning partial frame at end of sealed segment"
                    );
                    self.corruption.push(CorruptionRecord {
                        segment: seg.path.clone(),
                        byte_offset: at,
                        kind: CorruptionKind::TruncatedFrame,
                        detail: format!("{} trailing bytes", leftover),
                    });
                }
            } else {
                self.corruption.close_region(seg.byte_offset());
            }
        }

        self.segment = Some(OpenSegment::open(next_index, next_path)?);
        Ok(true)
    }

    fn open_next_segment(&mut self) -> Result<bool, TailError> {
        match list_segments(&self.dir)?.into_iter().next() {
            Some((index, path)) => {
                self.segment = Some(OpenSegment::open(index, path)?);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn current_path_display(&self) -> String {
        self.segment
            .as_ref()
            .map(|s| s.path.display().to_string())
            .unwrap_or_default()
    }
}

/// Position of the first checksum-valid frame after byte 0 of `data`.
fn next_valid_frame(data: &[u8]) -> Option<usize> {
    (1..data.len()).find(|&at| {
        matches!(LogFrame::from_bytes(&data[at..]), Ok(Some((frame, _))) if frame.verify_checksum())
    })
}

// ── Tests ───────────────────────────────────────────────────────────
