//! Aggregation state store
//!
//! Per-asset running sums live in a sharded concurrent map, so records for
//! different assets can be applied in parallel while one asset's entry is
//! only ever mutated under its shard lock.
//!
//! Change tracking is offset based. Each entry remembers the log offset of
//! the last record applied to it, and the store keeps a watermark: every
//! record at or below it has been applied. A pipeline that has delivered
//! through offset `c` asks for the keys with `last_offset > c` and commits
//! the watermark it observed before scanning. A key mutated during the scan
//! lands in this batch and again in the next one, never in neither.

use dashmap::DashMap;
use persistence::snapshot::KeyedAggregate;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;
use types::aggregate::AggregateRow;
use types::errors::StateError;
use types::ids::AssetId;
use types::record::RawRecord;

#[derive(Debug, Default)]
pub struct AggregationStore {
    entries: DashMap<AssetId, KeyedAggregate>,
    watermark: AtomicU64,
}

impl AggregationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a record read at `offset` into its asset's aggregate.
    pub fn apply(&self, offset: u64, record: &RawRecord) {
        {
            let mut entry = self.entries.entry(record.asset_id).or_default();
            entry.state.apply(record);
            entry.last_offset = entry.last_offset.max(offset);
        }
        self.advance_watermark(offset);
    }

    /// Mark `offset` as consumed without changing any aggregate, e.g. for a
    /// rejected record.
    pub fn advance_watermark(&self, offset: u64) {
        self.watermark.fetch_max(offset, Ordering::AcqRel);
    }

    /// Highest offset such that every record at or below it is applied.
    pub fn watermark(&self) -> u64 {
        self.watermark.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current averages for one asset.
    pub fn row(&self, asset_id: AssetId) -> Result<Option<AggregateRow>, StateError> {
        match self.entries.get(&asset_id) {
            Some(entry) => entry.state.to_row(asset_id).map(Some),
            None => Ok(None),
        }
    }

    /// Rows for every asset changed after `committed`, sorted by asset id,
    /// plus the offset the rows are complete through.
    ///
    /// Each row is computed under its entry's lock, so a row never mixes a
    /// sum and a count from different updates.
    pub fn snapshot_since(
        &self,
        committed: u64,
    ) -> Result<(Vec<AggregateRow>, u64), StateError> {
        let through = self.watermark().max(committed);

        let mut rows = Vec::new();
        for entry in self.entries.iter() {
            if entry.last_offset <= committed {
                continue;
            }
            let row = entry.state.to_row(*entry.key()).map_err(|e| {
                error!(asset_id = %entry.key(), error = %e, "Aggregate invariant violated");
                e
            })?;
            rows.push(row);
        }
        rows.sort_by_key(|row| row.asset_id);

        Ok((rows, through))
    }

    /// Copy of every entry, for state snapshots.
    pub fn export(&self) -> (BTreeMap<AssetId, KeyedAggregate>, u64) {
        let through = self.watermark();
        let entries = self
            .entries
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        (entries, through)
    }

    /// Replace all state with snapshot contents.
    pub fn restore(&self, entries: &BTreeMap<AssetId, KeyedAggregate>, through_offset: u64) {
        self.entries.clear();
        for (asset_id, entry) in entries {
            self.entries.insert(*asset_id, entry.clone());
        }
        self.watermark.store(through_offset, Ordering::Release);
    }

    /// Direct write access to one entry's state. Test support for
    /// simulating damaged aggregates.
    #[cfg(test)]
    pub(crate) fn with_entry_mut(&self, asset_id: AssetId, f: impl FnOnce(&mut KeyedAggregate)) {
        if let Some(mut entry) = self.entries.get_mut(&asset_id) {
            f(&mut entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use types::aggregate::{FieldAccumulator, TrackedField};

    fn record(asset: i32, price: f64, pct: Option<f64>) -> RawRecord {
        RawRecord {
            id: None,
            asset_id: AssetId::new(asset),
            price,
            market_cap: 1000,
            market_cap_rank: 1,
            total_volume: 500,
            high_24h: price,
            low_24h: price,
            price_change_pct_24h: pct,
            market_cap_change_pct_24h: None,
            timestamp: "t".to_string(),
        }
    }

    #[test]
    fn test_apply_creates_and_updates_entries() {
        let store = AggregationStore::new();
        store.apply(1, &record(1, 100.0, Some(5.0)));
        store.apply(2, &record(1, 200.0, Some(-1.0)));
        store.apply(3, &record(2, 10.0, None));

        assert_eq!(store.len(), 2);
        assert_eq!(store.watermark(), 3);

        let row = store.row(AssetId::new(1)).unwrap().unwrap();
        assert_eq!(row.avg_price, 150.0);
        assert_eq!(row.avg_price_change_pct, Some(2.0));

        let row = store.row(AssetId::new(2)).unwrap().unwrap();
        assert_eq!(row.avg_price_change_pct, None);
        assert!(store.row(AssetId::new(3)).unwrap().is_none());
    }

    #[test]
    fn test_snapshot_since_returns_only_changed_keys_sorted() {
        let store = AggregationStore::new();
        store.apply(1, &record(3, 1.0, None));
        store.apply(2, &record(1, 1.0, None));

        let (rows, through) = store.snapshot_since(0).unwrap();
        assert_eq!(through, 2);
        assert_eq!(
            rows.iter().map(|r| r.asset_id.get()).collect::<Vec<_>>(),
            vec![1, 3]
        );

        store.apply(3, &record(3, 3.0, None));
        let (rows, through) = store.snapshot_since(2).unwrap();
        assert_eq!(through, 3);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].asset_id, AssetId::new(3));
        assert_eq!(rows[0].avg_price, 2.0);
    }

    #[test]
    fn test_quiet_interval_yields_empty_rows() {
        let store = AggregationStore::new();
        store.apply(1, &record(1, 1.0, None));
        let (rows, through) = store.snapshot_since(1).unwrap();
        assert!(rows.is_empty());
        assert_eq!(through, 1);
    }

    #[test]
    fn test_rejected_offsets_still_advance_watermark() {
        let store = AggregationStore::new();
        store.apply(1, &record(1, 1.0, None));
        store.advance_watermark(2);
        let (rows, through) = store.snapshot_since(1).unwrap();
        assert!(rows.is_empty());
        assert_eq!(through, 2);
    }

    #[test]
    fn test_boundary_never_moves_behind_commit() {
        let store = AggregationStore::new();
        let (_, through) = store.snapshot_since(40).unwrap();
        assert_eq!(through, 40);
    }

    #[test]
    fn test_invariant_violation_fails_loudly() {
        let store = AggregationStore::new();
        store.apply(1, &record(1, 1.0, None));
        store.with_entry_mut(AssetId::new(1), |entry| {
            entry.state.set_field(
                TrackedField::PriceChangePct24h,
                FieldAccumulator::from_parts(4.0, 0),
            );
        });

        assert!(matches!(
            store.snapshot_since(0),
            Err(StateError::InvariantViolation { .. })
        ));
    }

    #[test]
    fn test_export_restore() {
        let store = AggregationStore::new();
        store.apply(1, &record(1, 100.0, None));
        store.apply(2, &record(2, 50.0, Some(1.0)));
        let (entries, through) = store.export();
        assert_eq!(through, 2);

        let restored = AggregationStore::new();
        restored.apply(9, &record(7, 1.0, None));
        restored.restore(&entries, through);

        assert_eq!(restored.len(), 2);
        assert_eq!(restored.watermark(), 2);
        assert_eq!(
            restored.row(AssetId::new(2)).unwrap(),
            store.row(AssetId::new(2)).unwrap()
        );
        assert!(restored.row(AssetId::new(7)).unwrap().is_none());
    }

    #[test]
    fn test_concurrent_apply_loses_no_updates() {
        let store = Arc::new(AggregationStore::new());
        std::thread::scope(|scope| {
            for t in 0..4u64 {
                let store = store.clone();
                scope.spawn(move || {
                    for i in 0..250u64 {
                        // Half the writes contend on asset 0.
                        let asset = if i % 2 == 0 { 0 } else { t as i32 + 1 };
                        store.apply(t * 1000 + i + 1, &record(asset, 1.0, None));
                    }
                });
            }
        });

        let (entries, _) = store.export();
        let total: u64 = entries.values().map(|e| e.state.records()).sum();
        assert_eq!(total, 1000);
        assert_eq!(entries[&AssetId::new(0)].state.records(), 500);
    }

    proptest! {
        #[test]
        fn prop_keys_are_independent(
            a_prices in prop::collection::vec(1.0f64..1e6, 1..20),
            b_prices in prop::collection::vec(1.0f64..1e6, 1..20),
        ) {
            let store = AggregationStore::new();
            let mut offset = 0;
            for p in &a_prices {
                offset += 1;
                store.apply(offset, &record(1, *p, None));
            }
            let before = store.row(AssetId::new(1)).unwrap();

            for p in &b_prices {
                offset += 1;
                store.apply(offset, &record(2, *p, Some(*p)));
            }
            prop_assert_eq!(store.row(AssetId::new(1)).unwrap(), before);

            let (rows, _) = store.snapshot_since(a_prices.len() as u64).unwrap();
            prop_assert_eq!(rows.len(), 1);
            prop_assert_eq!(rows[0].asset_id, AssetId::new(2));
        }
    }
}
