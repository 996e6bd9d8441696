//! Observability and metrics for the aggregator
//!
//! Counters for ingestion health (accepted, duplicate, rejected, corrupt)
//! and per-pipeline delivery (cycles, rows, failures, retries), plus a
//! bounded latency window for delivery duration. Everything exports as a
//! sorted map for the `/metrics` endpoint and the shutdown summary.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Ingestion-side metrics shared by the whole service.
pub struct ServiceMetrics {
    // Ingestion
    pub records_ingested: AtomicU64,
    pub records_duplicate: AtomicU64,
    pub records_rejected_schema: AtomicU64,
    pub records_rejected_coercion: AtomicU64,
    pub frames_corrupt: AtomicU64,
    pub apply_latency_ns: Mutex<LatencyTracker>,

    // Snapshots
    pub snapshots_written: AtomicU64,
    pub snapshot_failures: AtomicU64,

    // Recovery
    pub recovery_replayed: AtomicU64,
    pub recovery_duration_ms: AtomicU64,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            records_ingested: AtomicU64::new(0),
            records_duplicate: AtomicU64::new(0),
            records_rejected_schema: AtomicU64::new(0),
            records_rejected_coercion: AtomicU64::new(0),
            frames_corrupt: AtomicU64::new(0),
            apply_latency_ns: Mutex::new(LatencyTracker::new(1000)),
            snapshots_written: AtomicU64::new(0),
            snapshot_failures: AtomicU64::new(0),
            recovery_replayed: AtomicU64::new(0),
            recovery_duration_ms: AtomicU64::new(0),
        }
    }

    /// Record a record applied to the store.
    pub fn record_ingested(&self, latency_ns: u64) {
        self.records_ingested.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut tracker) = self.apply_latency_ns.lock() {
            tracker.record(latency_ns);
        }
    }

    pub fn record_duplicate(&self) {
        self.records_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_schema(&self) {
        self.records_rejected_schema.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_coercion(&self) {
        self.records_rejected_coercion.fetch_add(1, Ordering::Relaxed);
    }

    /// Damaged record log regions skipped (checksum, malformed, truncated).
    pub fn record_corrupt_frames(&self, count: u64) {
        self.frames_corrupt.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_snapshot(&self) {
        self.snapshots_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot_failure(&self) {
        self.snapshot_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record recovery metrics.
    pub fn record_recovery(&self, replayed: u64, duration_ms: u64) {
        self.recovery_replayed.store(replayed, Ordering::Relaxed);
        self.recovery_duration_ms.store(duration_ms, Ordering::Relaxed);
    }

    /// Export metrics as a BTreeMap.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let mut m = BTreeMap::new();
        m.insert("records_ingested".to_string(), self.records_ingested.load(Ordering::Relaxed));
        m.insert("records_duplicate".to_string(), self.records_duplicate.load(Ordering::Relaxed));
        m.insert(
            "records_rejected_schema".to_string(),
            self.records_rejected_schema.load(Ordering::Relaxed),
        );
        m.insert(
            "records_rejected_coercion".to_string(),
            self.records_rejected_coercion.load(Ordering::Relaxed),
        );
        m.insert("frames_corrupt".to_string(), self.frames_corrupt.load(Ordering::Relaxed));
        m.insert("snapshots_written".to_string(), self.snapshots_written.load(Ordering::Relaxed));
        m.insert("snapshot_failures".to_string(), self.snapshot_failures.load(Ordering::Relaxed));
        m.insert("recovery_replayed".to_string(), self.recovery_replayed.load(Ordering::Relaxed));
        m.insert(
            "recovery_duration_ms".to_string(),
            self.recovery_duration_ms.load(Ordering::Relaxed),
        );
        if let Ok(tracker) = self.apply_latency_ns.lock() {
            if let Some(p99) = tracker.percentile(99) {
                m.insert("apply_latency_p99_ns".to_string(), p99);
            }
        }
        m
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Delivery metrics for one pipeline.
pub struct PipelineMetrics {
    pub cycles: AtomicU64,
    pub empty_cycles: AtomicU64,
    pub rows_delivered: AtomicU64,
    pub delivery_failures: AtomicU64,
    pub retries: AtomicU64,
    pub halted: AtomicU64,
    pub delivery_latency_ms: Mutex<LatencyTracker>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            cycles: AtomicU64::new(0),
            empty_cycles: AtomicU64::new(0),
            rows_delivered: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            halted: AtomicU64::new(0),
            delivery_latency_ms: Mutex::new(LatencyTracker::new(100)),
        }
    }

    /// Record a completed cycle (delivered and checkpointed).
    pub fn record_cycle(&self, rows: u64, latency_ms: u64) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        if rows == 0 {
            self.empty_cycles.fetch_add(1, Ordering::Relaxed);
        }
        self.rows_delivered.fetch_add(rows, Ordering::Relaxed);
        if let Ok(mut tracker) = self.delivery_latency_ms.lock() {
            tracker.record(latency_ms);
        }
    }

    pub fn record_failure(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_halt(&self) {
        self.halted.store(1, Ordering::Relaxed);
    }

    /// Export under `pipeline.<name>.` keys.
    pub fn export_into(&self, name: &str, m: &mut BTreeMap<String, u64>) {
        let key = |metric: &str| format!("pipeline.{}.{}", name, metric);
        m.insert(key("cycles"), self.cycles.load(Ordering::Relaxed));
        m.insert(key("empty_cycles"), self.empty_cycles.load(Ordering::Relaxed));
        m.insert(key("rows_delivered"), self.rows_delivered.load(Ordering::Relaxed));
        m.insert(key("delivery_failures"), self.delivery_failures.load(Ordering::Relaxed));
        m.insert(key("retries"), self.retries.load(Ordering::Relaxed));
        m.insert(key("halted"), self.halted.load(Ordering::Relaxed));
        if let Ok(tracker) = self.delivery_latency_ms.lock() {
            if let Some(avg) = tracker.average() {
                m.insert(key("delivery_latency_avg_ms"), avg);
            }
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks latency samples for percentile calculation.
pub struct LatencyTracker {
    samples: Vec<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: Vec::with_capacity(max_samples),
            max_samples,
        }
    }

    /// Record a latency sample.
    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.remove(0);
        }
        self.samples.push(value);
    }

    /// Get a percentile value (0-100).
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted = self.samples.clone();
        sorted.sort_unstable();

        let idx = (p as f64 / 100.0 * (sorted.len() - 1) as f64) as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    pub fn average(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: u64 = self.samples.iter().sum();
        Some(sum / self.samples.len() as u64)
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }
}
