//! Types library for the market-data averaging pipeline
//!
//! Shared definitions used by the persistence layer and the aggregation
//! service: ingested records, per-asset running aggregates, the update
//! batches handed to sinks, and the error taxonomy for decoding and
//! aggregation state.
//!
//! # Modules
//! - `ids`: Identifiers (AssetId, BatchId)
//! - `numeric`: Textual decimal coercion to `f64`
//! - `record`: The typed ingested observation (`RawRecord`)
//! - `aggregate`: Running sums/counts and the per-asset average row
//! - `batch`: The per-tick `UpdateBatch`
//! - `errors`: Error taxonomy

// Public modules
pub mod ids;
pub mod numeric;
pub mod record;
pub mod aggregate;
pub mod batch;
pub mod errors;

