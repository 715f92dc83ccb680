//! Admission control for requests against a chain node.
//!
//! [`AdaptiveLimiter`] bounds in-flight requests with a semaphore whose
//! size follows [`adjust`], a pure function of the current limit and the
//! latency/error statistics of a sliding window. Growing adds permits
//! immediately; shrinking forgets idle permits and retires busy ones as
//! they are released.

use crate::{RpcError, RpcResult};
use parking_lot::Mutex;
use sink_metrics::{LatencyWindow, WindowStats};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Tunables for [`adjust`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerPolicy {
    /// Upper bound on in-flight requests
    pub max_parallelism: usize,
    /// Lower bound, also the starting limit
    pub min_parallelism: usize,
    /// Grow while p95 stays at or under this
    pub target_latency: Duration,
    /// Shrink by `severe_decrease` above this
    pub max_latency: Duration,
    /// Halve when the window holds more failures than this
    pub max_errors: usize,
    /// Sample retention
    pub window: Duration,
    /// Adjustment period
    pub tick: Duration,
    /// Hold steady until the window holds this many samples
    pub min_samples: usize,
    /// Additive increase
    pub increase_step: usize,
    /// Decrease when p95 is between target and max
    pub decrease_step: usize,
    /// Decrease when p95 exceeds max
    pub severe_decrease: usize,
}

impl ControllerPolicy {
    /// Defaults with the minimum derived as `max(2, max / 10)`
    pub fn with_max_parallelism(max_parallelism: usize) -> Self {
        let max_parallelism = max_parallelism.max(1);
        Self {
            max_parallelism,
            min_parallelism: (max_parallelism / 10).max(2).min(max_parallelism),
            target_latency: Duration::from_millis(500),
            max_latency: Duration::from_millis(1000),
            max_errors: 10,
            window: Duration::from_secs(60),
            tick: Duration::from_secs(1),
            min_samples: 10,
            increase_step: 1,
            decrease_step: 1,
            severe_decrease: 2,
        }
    }
}

impl Default for ControllerPolicy {
    fn default() -> Self {
        Self::with_max_parallelism(200)
    }
}

/// Next limit given the current one and the window statistics
pub fn adjust(current: usize, stats: &WindowStats, policy: &ControllerPolicy) -> usize {
    let min = policy.min_parallelism.max(1);
    let max = policy.max_parallelism.max(min);
    if stats.samples < policy.min_samples {
        return current.clamp(min, max);
    }

    let next = if stats.errors > policy.max_errors {
        current / 2
    } else if stats.p95 > policy.max_latency {
        current.saturating_sub(policy.severe_decrease)
    } else if stats.p95 > policy.target_latency {
        current.saturating_sub(policy.decrease_step)
    } else {
        current.saturating_add(policy.increase_step)
    };
    next.clamp(min, max)
}

struct LimiterInner {
    semaphore: Arc<Semaphore>,
    limit: AtomicUsize,
    /// Permits in circulation, held or available
    issued: Mutex<usize>,
    window: LatencyWindow,
    policy: ControllerPolicy,
}

/// Resizable concurrency limit fed by request latencies
#[derive(Clone)]
pub struct AdaptiveLimiter {
    inner: Arc<LimiterInner>,
}

/// Slot held for the duration of one request
pub struct LimiterPermit {
    permit: Option<OwnedSemaphorePermit>,
    inner: Arc<LimiterInner>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        let mut issued = self.inner.issued.lock();
        if *issued > self.inner.limit.load(Ordering::Acquire) {
            permit.forget();
            *issued -= 1;
        }
    }
}

impl AdaptiveLimiter {
    /// Start at the policy minimum
    pub fn new(policy: ControllerPolicy) -> Self {
        let start = policy.min_parallelism.max(1);
        Self {
            inner: Arc::new(LimiterInner {
                semaphore: Arc::new(Semaphore::new(start)),
                limit: AtomicUsize::new(start),
                issued: Mutex::new(start),
                window: LatencyWindow::new(policy.window),
                policy,
            }),
        }
    }

    /// Current limit
    pub fn current(&self) -> usize {
        self.inner.limit.load(Ordering::Acquire)
    }

    /// Policy in effect
    pub fn policy(&self) -> &ControllerPolicy {
        &self.inner.policy
    }

    /// Window statistics right now
    pub fn stats(&self) -> WindowStats {
        self.inner.window.stats()
    }

    /// p95 latency of the window
    pub fn p95_latency(&self) -> Duration {
        self.stats().p95
    }

    /// Wait for a slot
    pub async fn acquire(&self) -> RpcResult<LimiterPermit> {
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| RpcError::Cancelled)?;
        Ok(LimiterPermit {
            permit: Some(permit),
            inner: Arc::clone(&self.inner),
        })
    }

    /// Record a finished request
    pub fn record(&self, latency: Duration, success: bool) {
        self.inner.window.record(latency, success);
    }

    /// Run `op` under a slot and record its latency and outcome
    pub async fn run<F, Fut, T>(&self, op: F) -> RpcResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RpcResult<T>>,
    {
        let _permit = self.acquire().await?;
        let started = Instant::now();
        let result = op().await;
        self.record(started.elapsed(), result.is_ok());
        result
    }

    /// Move the limit to `target`, clamped to the policy bounds
    pub fn set_limit(&self, target: usize) {
        let policy = &self.inner.policy;
        let target = target.clamp(policy.min_parallelism.max(1), policy.max_parallelism.max(1));

        let mut issued = self.inner.issued.lock();
        self.inner.limit.store(target, Ordering::Release);
        if target > *issued {
            self.inner.semaphore.add_permits(target - *issued);
            *issued = target;
            return;
        }
        while *issued > target {
            match Arc::clone(&self.inner.semaphore).try_acquire_owned() {
                Ok(idle) => {
                    idle.forget();
                    *issued -= 1;
                }
                // the rest retire on release
                Err(_) => break,
            }
        }
    }

    /// Apply one adjustment step; returns the new limit
    pub fn tick(&self) -> usize {
        let current = self.current();
        let stats = self.stats();
        let next = adjust(current, &stats, &self.inner.policy);
        if next != current {
            debug!(
                from = current,
                to = next,
                p95_ms = stats.p95.as_millis() as u64,
                errors = stats.errors,
                samples = stats.samples,
                "Parallelism adjusted"
            );
            self.set_limit(next);
        }
        next
    }

    #[cfg(test)]
    fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }
}
