use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use common::db::TimeTracker;

/// Aggregates per-record insert latency.
#[derive(Debug, Default)]
pub struct LatencyTracker {
    count: AtomicU64,
    total_micros: AtomicU64,
    max_micros: AtomicU64,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> Duration {
        let count = self.count();
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_micros.load(Ordering::Relaxed) / count)
    }

    pub fn max(&self) -> Duration {
        Duration::from_micros(self.max_micros.load(Ordering::Relaxed))
    }

    pub fn log(&self) {
        tracing::info!(
            records = self.count(),
            mean = ?self.mean(),
            max = ?self.max(),
            "insert latency"
        );
    }
}

impl TimeTracker for LatencyTracker {
    fn track_time(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);
    }
}
