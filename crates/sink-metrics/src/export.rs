//! Point-in-time metric snapshots for the HTTP `/metrics` endpoint

use crate::Metrics;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Snapshot of all metrics, keyed in sorted order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Counter values
    pub counters: BTreeMap<String, u64>,
    /// Gauge values
    pub gauges: BTreeMap<String, i64>,
    /// Histogram summaries
    pub histograms: BTreeMap<String, HistogramSummary>,
}

/// Summary of a histogram
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramSummary {
    /// Mean value
    pub mean: f64,
    /// Bucket estimate of the 95th percentile (null when unbounded)
    pub p95: Option<f64>,
    /// Total observation count
    pub count: u64,
}

impl MetricsSnapshot {
    /// Create a snapshot from a Metrics instance
    pub fn from_metrics(metrics: &Metrics) -> Self {
        let histograms = metrics
            .all_histograms()
            .into_iter()
            .map(|(name, h)| {
                let p95 = h.quantile(0.95);
                let summary = HistogramSummary {
                    mean: h.mean(),
                    p95: p95.is_finite().then_some(p95),
                    count: h.total_count(),
                };
                (name, summary)
            })
            .collect();

        Self {
            counters: metrics.all_counters().into_iter().collect(),
            gauges: metrics.all_gauges().into_iter().collect(),
            histograms,
        }
    }

    /// Export snapshot as JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
