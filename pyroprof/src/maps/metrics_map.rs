use std::sync::atomic::{AtomicU64, Ordering};

use pyroprof_common::Metrics;

/// Outcome counters, one per `Metrics` variant
pub struct MetricsMap {
    counters: [AtomicU64; Metrics::COUNT],
}

impl Default for MetricsMap {
    fn default() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl MetricsMap {
    pub fn incr(&self, m: Metrics) {
        self.counters[m as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, m: Metrics) -> u64 {
        self.counters[m as usize].load(Ordering::Relaxed)
    }

    /// Non-zero counters
    pub fn snapshot(&self) -> Vec<(Metrics, u64)> {
        Metrics::iter()
            .into_iter()
            .map(|m| (m, self.get(m)))
            .filter(|(_, v)| *v > 0)
            .collect()
    }
}
