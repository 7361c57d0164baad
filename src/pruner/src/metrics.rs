//! Pruning Metrics
//!
//! Thread-safe counters accumulated across pruning passes of one job.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Thread-safe metrics for tracking pruning passes
#[derive(Debug, Clone)]
pub struct PruneMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    /// Number of completed passes
    passes: AtomicUsize,
    /// Total number of datasets evaluated
    datasets_evaluated: AtomicUsize,
    /// Snapshots the policies chose to remove (including dry runs)
    snapshots_selected: AtomicUsize,
    /// Snapshots actually destroyed
    snapshots_destroyed: AtomicUsize,
    /// Per-dataset failures
    errors: AtomicUsize,
    /// Total duration in milliseconds
    total_duration_ms: AtomicU64,
}

impl Default for PruneMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PruneMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                passes: AtomicUsize::new(0),
                datasets_evaluated: AtomicUsize::new(0),
                snapshots_selected: AtomicUsize::new(0),
                snapshots_destroyed: AtomicUsize::new(0),
                errors: AtomicUsize::new(0),
                total_duration_ms: AtomicU64::new(0),
            }),
        }
    }

    pub fn record_pass(&self) {
        self.inner.passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_datasets_evaluated(&self, count: usize) {
        self.inner
            .datasets_evaluated
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_snapshots_selected(&self, count: usize) {
        self.inner
            .snapshots_selected
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_snapshots_destroyed(&self, count: usize) {
        self.inner
            .snapshots_destroyed
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_errors(&self, count: usize) {
        self.inner.errors.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_duration_ms(&self, duration_ms: u64) {
        self.inner
            .total_duration_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
    }

    pub fn passes(&self) -> usize {
        self.inner.passes.load(Ordering::Relaxed)
    }

    pub fn datasets_evaluated(&self) -> usize {
        self.inner.datasets_evaluated.load(Ordering::Relaxed)
    }

    pub fn snapshots_selected(&self) -> usize {
        self.inner.snapshots_selected.load(Ordering::Relaxed)
    }

    pub fn snapshots_destroyed(&self) -> usize {
        self.inner.snapshots_destroyed.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> usize {
        self.inner.errors.load(Ordering::Relaxed)
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.inner.total_duration_ms.load(Ordering::Relaxed)
    }

    /// One-line summary for logging.
    pub fn summary(&self) -> String {
        format!(
            "passes={}, datasets={}, selected={}, destroyed={}, errors={}, duration_ms={}",
            self.passes(),
            self.datasets_evaluated(),
            self.snapshots_selected(),
            self.snapshots_destroyed(),
            self.errors(),
            self.total_duration_ms()
        )
    }
}
