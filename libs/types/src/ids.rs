//! Identifier types
//!
//! `AssetId` is the aggregation key carried on every ingested record.
//! `BatchId` tags each update batch with a UUID v7 so log lines from the
//! two delivery pipelines can be correlated chronologically.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Asset identifier (the `cryptocurrency_id` wire field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(i32);

impl AssetId {
    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    pub fn get(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for AssetId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

/// Unique identifier for one update batch
///
/// Uses UUID v7 so batch ids sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_id_display_is_plain_integer() {
        assert_eq!(AssetId::new(42).to_string(), "42");
        assert_eq!(AssetId::new(-7).to_string(), "-7");
    }

    #[test]
    fn test_asset_id_serializes_transparently() {
        let json = serde_json::to_string(&AssetId::new(1)).unwrap();
        assert_eq!(json, "1");
    }

    #[test]
    fn test_asset_id_ordering() {
        let mut ids = vec![AssetId::new(3), AssetId::new(1), AssetId::new(2)];
        ids.sort();
        assert_eq!(ids, vec![AssetId::new(1), AssetId::new(2), AssetId::new(3)]);
    }

    #[test]
    fn test_batch_ids_unique() {
        assert_ne!(BatchId::new(), BatchId::new());
    }
}
