//! Market-data averaging service
//!
//! Consumes cryptocurrency market records from the ingestion record log and
//! keeps a cumulative per-asset average of every numeric field. On a fixed
//! trigger, each delivery pipeline emits the assets that changed since its
//! own last checkpoint:
//! - `pubsub`: one JSON message per asset on the averages topic
//! - `log`: a human-readable batch report through `tracing`
//!
//! # Architecture
//!
//! ```text
//!   Record log (segments)
//!          │
//!     ┌────▼────┐
//!     │ Ingest  │  ← decode, dedupe by offset, count rejects
//!     └────┬────┘
//!          │
//!   ┌──────▼───────┐      ┌───────────┐
//!   │ Aggregation  │─────▶│ Snapshots │
//!   │    store     │      └───────────┘
//!   └──┬────────┬──┘
//!      │        │   snapshot_since(checkpoint)
//! ┌────▼───┐ ┌──▼─────┐
//! │ pubsub │ │  log   │  ← one pipeline per sink, own trigger + checkpoint
//! └────┬───┘ └──┬─────┘
//!      ▼        ▼
//!   Topic    tracing
//! ```

pub mod config;
pub mod decoder;
pub mod fanout;
pub mod http;
pub mod ingestion;
pub mod metrics;
pub mod pipeline;
pub mod service;
pub mod sink;
pub mod state;
pub mod trigger;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
