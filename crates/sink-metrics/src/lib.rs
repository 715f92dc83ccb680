//! # sink-metrics
//!
//! Observability primitives for the EVM sink.
//!
//! Features:
//! - Bucketed histograms with quantile estimates
//! - Counters and gauges keyed by name and chain
//! - Time-windowed latency samples with exact p95
//! - JSON snapshot export

#![warn(missing_docs)]
#![warn(clippy::all)]

mod collector;
mod export;
mod histogram;
mod window;

pub use collector::{labeled, Metrics};
pub use export::{HistogramSummary, MetricsSnapshot};
pub use histogram::Histogram;
pub use window::{LatencyWindow, WindowStats};

/// Time a block and record its duration in milliseconds under `$name`
#[macro_export]
macro_rules! timed {
    ($metrics:expr, $name:expr, $block:block) => {{
        let start = std::time::Instant::now();
        let result = $block;
        $metrics.histogram($name, start.elapsed().as_secs_f64() * 1000.0);
        result
    }};
}
