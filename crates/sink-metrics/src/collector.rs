//! Named metric storage shared across the sink's components

use crate::Histogram;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Build a metric name scoped to one chain, e.g. `ingest_blocks{chain="1"}`
pub fn labeled(name: &str, chain_id: u64) -> String {
    format!("{name}{{chain=\"{chain_id}\"}}")
}

/// Thread-safe metrics storage
pub struct Metrics {
    histograms: RwLock<HashMap<String, Arc<Histogram>>>,
    counters: RwLock<HashMap<String, Arc<AtomicU64>>>,
    gauges: RwLock<HashMap<String, Arc<AtomicI64>>>,
}

/// Look up `name`, inserting a fresh entry under the write lock on a miss
fn entry<T>(map: &RwLock<HashMap<String, Arc<T>>>, name: &str, init: fn() -> T) -> Arc<T> {
    if let Some(existing) = map.read().get(name) {
        return Arc::clone(existing);
    }
    let mut map = map.write();
    Arc::clone(
        map.entry(name.to_string())
            .or_insert_with(|| Arc::new(init())),
    )
}

impl Metrics {
    /// Create a new metrics store
    pub fn new() -> Self {
        Self {
            histograms: RwLock::new(HashMap::new()),
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
        }
    }

    /// Create a shareable metrics store
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Record a histogram observation
    pub fn histogram(&self, name: &str, value: f64) {
        entry(&self.histograms, name, Histogram::new).observe(value);
    }

    /// Increment a counter
    pub fn counter(&self, name: &str, delta: u64) {
        entry(&self.counters, name, || AtomicU64::new(0)).fetch_add(delta, Ordering::Relaxed);
    }

    /// Set a gauge value
    pub fn gauge(&self, name: &str, value: i64) {
        entry(&self.gauges, name, || AtomicI64::new(0)).store(value, Ordering::Relaxed);
    }

    /// Add `delta` to a gauge (may be negative)
    pub fn gauge_add(&self, name: &str, delta: i64) {
        entry(&self.gauges, name, || AtomicI64::new(0)).fetch_add(delta, Ordering::Relaxed);
    }

    /// Get histogram mean for a metric
    pub fn get_histogram_mean(&self, name: &str) -> Option<f64> {
        self.histograms.read().get(name).map(|h| h.mean())
    }

    /// Get counter value
    pub fn get_counter(&self, name: &str) -> Option<u64> {
        self.counters
            .read()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
    }

    /// Get gauge value
    pub fn get_gauge(&self, name: &str) -> Option<i64> {
        self.gauges
            .read()
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
    }

    pub(crate) fn all_counters(&self) -> Vec<(String, u64)> {
        self.counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }

    pub(crate) fn all_gauges(&self) -> Vec<(String, i64)> {
        self.gauges
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }

    pub(crate) fn all_histograms(&self) -> Vec<(String, Arc<Histogram>)> {
        self.histograms
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let metrics = Metrics::new();
        metrics.counter("blocks", 1);
        metrics.counter("blocks", 2);
        assert_eq!(metrics.get_counter("blocks"), Some(3));
        assert_eq!(metrics.get_counter("missing"), None);
    }

    #[test]
    fn test_gauge_set_and_add() {
        let metrics = Metrics::new();
        metrics.gauge("sessions", 4);
        metrics.gauge_add("sessions", -1);
        assert_eq!(metrics.get_gauge("sessions"), Some(3));
        metrics.gauge("sessions", -10);
        assert_eq!(metrics.get_gauge("sessions"), Some(-10));
    }

    #[test]
    fn test_histogram() {
        let metrics = Metrics::new();
        metrics.histogram("rpc_ms", 100.0);
        metrics.histogram("rpc_ms", 200.0);
        assert_eq!(metrics.get_histogram_mean("rpc_ms"), Some(150.0));
    }

    #[test]
    fn test_labeled_names_are_distinct() {
        let metrics = Metrics::new();
        metrics.counter(&labeled("ingest_blocks", 1), 5);
        metrics.counter(&labeled("ingest_blocks", 10), 7);
        assert_eq!(metrics.get_counter("ingest_blocks{chain=\"1\"}"), Some(5));
        assert_eq!(metrics.get_counter("ingest_blocks{chain=\"10\"}"), Some(7));
    }

    #[test]
    fn test_timed_macro_records() {
        let metrics = Metrics::new();
        let value = crate::timed!(metrics, "work_ms", { 41 + 1 });
        assert_eq!(value, 42);
        assert!(metrics.get_histogram_mean("work_ms").is_some());
    }
}
