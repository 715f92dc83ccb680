//! Sliding time window of request samples.
//!
//! The window keeps every sample from the last `span` of wall time and
//! answers exact percentile queries over them. It backs the adaptive
//! RPC limiter, which needs a precise p95 rather than a bucket bound.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    latency: Duration,
    success: bool,
}

/// Aggregate view of the samples currently inside the window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowStats {
    /// Number of samples
    pub samples: usize,
    /// Number of failed samples
    pub errors: usize,
    /// 95th percentile latency over all samples
    pub p95: Duration,
}

/// Time-bounded sample store
pub struct LatencyWindow {
    span: Duration,
    samples: Mutex<VecDeque<Sample>>,
}

impl LatencyWindow {
    /// Create a window that retains samples for `span`
    pub fn new(span: Duration) -> Self {
        Self {
            span,
            samples: Mutex::new(VecDeque::new()),
        }
    }

    /// Record a completed request
    pub fn record(&self, latency: Duration, success: bool) {
        self.record_at(Instant::now(), latency, success);
    }

    fn record_at(&self, at: Instant, latency: Duration, success: bool) {
        let mut samples = self.samples.lock();
        samples.push_back(Sample {
            at,
            latency,
            success,
        });
        Self::prune(&mut samples, self.span, at);
    }

    fn prune(samples: &mut VecDeque<Sample>, span: Duration, now: Instant) {
        while let Some(front) = samples.front() {
            if now.saturating_duration_since(front.at) > span {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Stats over samples younger than the window span
    pub fn stats(&self) -> WindowStats {
        self.stats_at(Instant::now())
    }

    fn stats_at(&self, now: Instant) -> WindowStats {
        let mut samples = self.samples.lock();
        Self::prune(&mut samples, self.span, now);
        if samples.is_empty() {
            return WindowStats::default();
        }

        let errors = samples.iter().filter(|s| !s.success).count();
        let mut latencies: Vec<Duration> = samples.iter().map(|s| s.latency).collect();
        latencies.sort_unstable();
        // nearest-rank
        let rank = (latencies.len() * 95).div_ceil(100).max(1);
        WindowStats {
            samples: latencies.len(),
            errors,
            p95: latencies[rank - 1],
        }
    }

    /// Drop every sample
    pub fn clear(&self) {
        self.samples.lock().clear();
    }
}
