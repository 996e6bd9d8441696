//! Running aggregates per asset
//!
//! Each asset keeps a record count plus one `FieldAccumulator` per tracked
//! numeric field. Nullable fields count their own non-null contributions,
//! so an average over a field with gaps divides only by the values seen.
//!
//! Aggregation is cumulative over the whole stream: entries are created on
//! the first record for an asset and never evicted.

use serde::{Deserialize, Serialize};

use crate::errors::StateError;
use crate::ids::AssetId;
use crate::record::RawRecord;

/// Numeric fields averaged per asset, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackedField {
    Price,
    MarketCap,
    MarketCapRank,
    TotalVolume,
    High24h,
    Low24h,
    PriceChangePct24h,
    MarketCapChangePct24h,
}

impl TrackedField {
    pub const ALL: [TrackedField; 8] = [
        TrackedField::Price,
        TrackedField::MarketCap,
        TrackedField::MarketCapRank,
        TrackedField::TotalVolume,
        TrackedField::High24h,
        TrackedField::Low24h,
        TrackedField::PriceChangePct24h,
        TrackedField::MarketCapChangePct24h,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Name of the averaged output column.
    pub fn output_name(self) -> &'static str {
        match self {
            TrackedField::Price => "avg_price",
            TrackedField::MarketCap => "avg_market_cap",
            TrackedField::MarketCapRank => "avg_market_cap_rank",
            TrackedField::TotalVolume => "avg_total_volume",
            TrackedField::High24h => "avg_high_24h",
            TrackedField::Low24h => "avg_low_24h",
            TrackedField::PriceChangePct24h => "avg_price_change_pct",
            TrackedField::MarketCapChangePct24h => "avg_market_cap_change_pct",
        }
    }

    /// Whether records may omit this field.
    pub fn is_nullable(self) -> bool {
        matches!(
            self,
            TrackedField::PriceChangePct24h | TrackedField::MarketCapChangePct24h
        )
    }

    fn extract(self, record: &RawRecord) -> Option<f64> {
        match self {
            TrackedField::Price => Some(record.price),
            TrackedField::MarketCap => Some(record.market_cap as f64),
            TrackedField::MarketCapRank => Some(record.market_cap_rank as f64),
            TrackedField::TotalVolume => Some(record.total_volume as f64),
            TrackedField::High24h => Some(record.high_24h),
            TrackedField::Low24h => Some(record.low_24h),
            TrackedField::PriceChangePct24h => record.price_change_pct_24h,
            TrackedField::MarketCapChangePct24h => record.market_cap_change_pct_24h,
        }
    }
}

/// Running sum and contribution count for one field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldAccumulator {
    sum: f64,
    count: u64,
}

impl FieldAccumulator {
    pub fn from_parts(sum: f64, count: u64) -> Self {
        Self { sum, count }
    }

    pub fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub fn add_optional(&mut self, value: Option<f64>) {
        if let Some(v) = value {
            self.add(v);
        }
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Arithmetic mean, `None` when nothing has contributed.
    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }
}

/// Cumulative aggregate for a single asset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateState {
    records: u64,
    fields: [FieldAccumulator; 8],
}

impl AggregateState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one record into the running sums.
    pub fn apply(&mut self, record: &RawRecord) {
        self.records += 1;
        for field in TrackedField::ALL {
            self.fields[field.index()].add_optional(field.extract(record));
        }
    }

    /// Number of records folded in.
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn field(&self, field: TrackedField) -> &FieldAccumulator {
        &self.fields[field.index()]
    }

    /// Overwrite one accumulator. Used when restoring persisted state.
    pub fn set_field(&mut self, field: TrackedField, acc: FieldAccumulator) {
        self.fields[field.index()] = acc;
    }

    /// Overwrite the record count. Used when restoring persisted state.
    pub fn set_records(&mut self, records: u64) {
        self.records = records;
    }

    /// Check the accumulator invariants for this asset.
    ///
    /// - sums are finite
    /// - a field with no contributions carries a zero sum
    /// - required fields have exactly one contribution per record
    /// - no field has more contributions than there are records
    pub fn validate(&self, asset_id: AssetId) -> Result<(), StateError> {
        for field in TrackedField::ALL {
            let acc = self.field(field);
            let violation = |reason: String| StateError::InvariantViolation {
                asset_id,
                field: field.output_name(),
                reason,
            };

            if !acc.sum.is_finite() {
                return Err(violation(format!("non-finite sum {}", acc.sum)));
            }
            if acc.count == 0 && acc.sum != 0.0 {
                return Err(violation(format!(
                    "sum {} recorded against zero contributions",
                    acc.sum
                )));
            }
            if acc.count > self.records {
                return Err(violation(format!(
                    "{} contributions exceed {} records",
                    acc.count, self.records
                )));
            }
            if !field.is_nullable() && acc.count != self.records {
                return Err(violation(format!(
                    "required field has {} contributions for {} records",
                    acc.count, self.records
                )));
            }
        }
        Ok(())
    }

    /// Validate and compute the current averages for this asset.
    pub fn to_row(&self, asset_id: AssetId) -> Result<AggregateRow, StateError> {
        self.validate(asset_id)?;

        let required = |field: TrackedField| {
            self.field(field)
                .mean()
                .ok_or_else(|| StateError::InvariantViolation {
                    asset_id,
                    field: field.output_name(),
                    reason: "no contributions for a required field".to_string(),
                })
        };

        Ok(AggregateRow {
            asset_id,
            avg_price: required(TrackedField::Price)?,
            avg_market_cap: required(TrackedField::MarketCap)?,
            avg_market_cap_rank: required(TrackedField::MarketCapRank)?,
            avg_total_volume: required(TrackedField::TotalVolume)?,
            avg_high_24h: required(TrackedField::High24h)?,
            avg_low_24h: required(TrackedField::Low24h)?,
            avg_price_change_pct: self.field(TrackedField::PriceChangePct24h).mean(),
            avg_market_cap_change_pct: self
                .field(TrackedField::MarketCapChangePct24h)
                .mean(),
        })
    }
}

/// Current averages for one asset, as published downstream.
///
/// Serializes with the wire names consumers expect; nullable averages are
/// always present as explicit `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    #[serde(rename = "cryptocurrency_id")]
    pub asset_id: AssetId,
    pub avg_price: f64,
    pub avg_market_cap: f64,
    pub avg_market_cap_rank: f64,
    pub avg_total_volume: f64,
    pub avg_high_24h: f64,
    pub avg_low_24h: f64,
    pub avg_price_change_pct: Option<f64>,
    pub avg_market_cap_change_pct: Option<f64>,
}

impl AggregateRow {
    /// Message key used on the pub/sub topic.
    pub fn message_key(&self) -> String {
        self.asset_id.to_string()
    }
}
