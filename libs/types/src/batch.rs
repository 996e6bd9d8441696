//! Update batch produced on every trigger tick

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregate::AggregateRow;
use crate::ids::BatchId;

/// Rows for every asset whose aggregate changed since a pipeline's last
/// committed tick, ordered by asset id.
///
/// An empty batch is a normal outcome of a quiet interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateBatch {
    pub batch_id: BatchId,
    /// Pipeline-local cycle number, starting at 1
    pub cycle_id: u64,
    pub triggered_at: DateTime<Utc>,
    /// Every ingested record at or below this log offset is reflected
    pub through_offset: u64,
    pub rows: Vec<AggregateRow>,
}

impl UpdateBatch {
    pub fn new(cycle_id: u64, through_offset: u64, rows: Vec<AggregateRow>) -> Self {
        Self {
            batch_id: BatchId::new(),
            cycle_id,
            triggered_at: Utc::now(),
            through_offset,
            rows,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}
