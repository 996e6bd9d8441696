//! Persistence for the market-data averaging pipeline
//!
//! Provides the append-only ingestion record log and its tailing reader,
//! per-pipeline delivery checkpoints, aggregation-state snapshots, and
//! recovery (snapshot load + log replay) on restart.
//!
//! # Durability rules
//! - Log frames carry a gapless, monotonic offset and a CRC32C checksum
//! - Checkpoints and snapshots are written atomically (tmp, fsync, rename)
//! - Snapshots and checkpoints carry SHA-256 integrity hashes

pub mod log;
pub mod tail;
pub mod checkpoint;
pub mod snapshot;
pub mod recovery;
