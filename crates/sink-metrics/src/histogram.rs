//! Histogram implementation for latency tracking

use std::sync::atomic::{AtomicU64, Ordering};

/// Histogram for tracking value distributions
pub struct Histogram {
    /// Upper bucket boundaries (milliseconds)
    buckets: Vec<f64>,
    /// Counts per bucket, plus one overflow bucket
    counts: Vec<AtomicU64>,
    /// Sum of all values, in thousandths
    sum_milli: AtomicU64,
    /// Total count
    count: AtomicU64,
}

impl Histogram {
    /// Create histogram with default latency buckets
    pub fn new() -> Self {
        Self::with_buckets(vec![
            1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
        ])
    }

    /// Create histogram with custom buckets (sorted ascending)
    pub fn with_buckets(buckets: Vec<f64>) -> Self {
        let counts = (0..=buckets.len()).map(|_| AtomicU64::new(0)).collect();
        Histogram {
            buckets,
            counts,
            sum_milli: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value
    pub fn observe(&self, value: f64) {
        let value = value.max(0.0);
        self.sum_milli
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        let idx = self
            .buckets
            .iter()
            .position(|boundary| value <= *boundary)
            .unwrap_or(self.buckets.len());
        self.counts[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Get mean value
    pub fn mean(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.sum_milli.load(Ordering::Relaxed) as f64 / 1000.0 / count as f64
    }

    /// Upper bound of the bucket holding quantile `q` (0.0..=1.0).
    /// Values past the last bucket report `f64::INFINITY`.
    pub fn quantile(&self, q: f64) -> f64 {
        let total = self.total_count();
        if total == 0 {
            return 0.0;
        }
        let rank = ((q.clamp(0.0, 1.0) * total as f64).ceil() as u64).max(1);
        let mut seen = 0;
        for (i, count) in self.counts.iter().enumerate() {
            seen += count.load(Ordering::Relaxed);
            if seen >= rank {
                return self.buckets.get(i).copied().unwrap_or(f64::INFINITY);
            }
        }
        f64::INFINITY
    }

    /// Get total count
    pub fn total_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}
