//! Service counters for the tally pipeline
//!
//! Plain atomic counters readable by operators and by the concurrency
//! tests. `peak_concurrent_recomputes` records the highest number of
//! recomputations observed inside the lock-protected section at once; the
//! mutual-exclusion tests assert it never exceeds one per station setup.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct TallyMetrics {
    // Ingestion
    pub entries_accepted: AtomicU64,
    pub entries_rejected: AtomicU64,
    pub entries_replayed: AtomicU64,

    // Aggregation
    pub recompute_runs: AtomicU64,
    pub recompute_contentions: AtomicU64,
    pub recompute_failures: AtomicU64,

    // Fan-out
    pub events_published: AtomicU64,
    pub snapshots_refreshed: AtomicU64,

    // Work queue
    pub tasks_retried: AtomicU64,
    pub tasks_failed_permanently: AtomicU64,

    // Instrumentation for the mutual-exclusion property
    in_flight_recomputes: AtomicU64,
    peak_concurrent_recomputes: AtomicU64,
}

impl TallyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark entry into the lock-protected recompute section.
    pub fn recompute_entered(&self) {
        let current = self.in_flight_recomputes.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_concurrent_recomputes
            .fetch_max(current, Ordering::SeqCst);
    }

    /// Mark exit from the lock-protected recompute section.
    pub fn recompute_exited(&self) {
        self.in_flight_recomputes.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak_concurrent_recomputes(&self) -> u64 {
        self.peak_concurrent_recomputes.load(Ordering::SeqCst)
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = TallyMetrics::new();
        TallyMetrics::incr(&metrics.entries_accepted);
        TallyMetrics::incr(&metrics.entries_accepted);
        assert_eq!(TallyMetrics::get(&metrics.entries_accepted), 2);
    }

    #[test]
    fn test_peak_tracking() {
        let metrics = TallyMetrics::new();
        metrics.recompute_entered();
        metrics.recompute_entered();
        metrics.recompute_exited();
        metrics.recompute_entered();
        metrics.recompute_exited();
        metrics.recompute_exited();
        assert_eq!(metrics.peak_concurrent_recomputes(), 2);
    }
}
