//! Typed ingested observation

use serde::{Deserialize, Serialize};

use crate::ids::AssetId;

/// One decoded market-data observation for a single asset.
///
/// Textual decimal fields have already been coerced to `f64`; nullable
/// percentages stay `None` when the source had no value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Source row id, if the producer supplied one
    pub id: Option<i32>,
    /// Aggregation key
    pub asset_id: AssetId,
    pub price: f64,
    pub market_cap: i64,
    pub market_cap_rank: i32,
    pub total_volume: i64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub price_change_pct_24h: Option<f64>,
    pub market_cap_change_pct_24h: Option<f64>,
    /// Observation time, opaque at this layer
    pub timestamp: String,
}
