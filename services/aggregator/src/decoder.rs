//! Record decoder
//!
//! Turns one log payload (a JSON object) into a typed `RawRecord`. Textual
//! decimals are coerced to `f64`; nullable percentages that are absent,
//! `null` or blank become `None`. Unknown fields are ignored.

use serde::{Deserialize, Serialize};
use types::errors::DecodeError;
use types::ids::AssetId;
use types::numeric::{parse_decimal, parse_optional_decimal};
use types::record::RawRecord;

/// The ingestion wire layout, exactly as producers write it.
///
/// Every field is optional at this level so that a missing or `null`
/// required field is reported as a schema violation naming the field,
/// rather than as an opaque parse error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireRecord {
    pub id: Option<i32>,
    pub cryptocurrency_id: Option<i32>,
    pub price: Option<String>,
    pub market_cap: Option<i64>,
    pub market_cap_rank: Option<i32>,
    pub total_volume: Option<i64>,
    pub high_24h: Option<String>,
    pub low_24h: Option<String>,
    pub price_change_percentage_24h: Option<String>,
    pub market_cap_change_percentage_24h: Option<String>,
    pub timestamp: Option<String>,
}

impl WireRecord {
    /// Encode as a log payload.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Decode one payload.
pub fn decode(payload: &[u8]) -> Result<RawRecord, DecodeError> {
    let wire: WireRecord =
        serde_json::from_slice(payload).map_err(|e| DecodeError::SchemaViolation {
            reason: e.to_string(),
        })?;
    from_wire(wire)
}

/// Validate and coerce an already-parsed wire record.
pub fn from_wire(wire: WireRecord) -> Result<RawRecord, DecodeError> {
    let asset_id = required("cryptocurrency_id", wire.cryptocurrency_id)?;
    let price = required("price", wire.price)?;
    let market_cap = required("market_cap", wire.market_cap)?;
    let market_cap_rank = required("market_cap_rank", wire.market_cap_rank)?;
    let total_volume = required("total_volume", wire.total_volume)?;
    let high_24h = required("high_24h", wire.high_24h)?;
    let low_24h = required("low_24h", wire.low_24h)?;
    let timestamp = required("timestamp", wire.timestamp)?;

    Ok(RawRecord {
        id: wire.id,
        asset_id: AssetId::new(asset_id),
        price: parse_decimal("price", &price)?,
        market_cap,
        market_cap_rank,
        total_volume,
        high_24h: parse_decimal("high_24h", &high_24h)?,
        low_24h: parse_decimal("low_24h", &low_24h)?,
        price_change_pct_24h: parse_optional_decimal(
            "price_change_percentage_24h",
            wire.price_change_percentage_24h.as_deref(),
        )?,
        market_cap_change_pct_24h: parse_optional_decimal(
            "market_cap_change_percentage_24h",
            wire.market_cap_change_percentage_24h.as_deref(),
        )?,
        timestamp,
    })
}

fn required<T>(field: &'static str, value: Option<T>) -> Result<T, DecodeError> {
    value.ok_or_else(|| DecodeError::SchemaViolation {
        reason: format!("required field '{}' is missing or null", field),
    })
}
