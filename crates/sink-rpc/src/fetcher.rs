//! Ordered, concurrent block fetching with retries

use crate::controller::{AdaptiveLimiter, ControllerPolicy};
use crate::source::BlockSource;
use crate::{RpcError, RpcResult};
use backon::{ExponentialBuilder, Retryable};
use futures::stream::{self, StreamExt, TryStreamExt};
use sink_metrics::{labeled, Metrics};
use sink_types::NormalizedBlock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry schedule for a single request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first
    pub max_attempts: usize,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts.saturating_sub(1))
    }
}

/// Fetches blocks from a [`BlockSource`] under an [`AdaptiveLimiter`].
///
/// Results always come back in ascending block order regardless of the
/// order in which concurrent requests complete.
pub struct FetchController<S> {
    chain_id: u64,
    source: Arc<S>,
    limiter: AdaptiveLimiter,
    retry: RetryPolicy,
    head_poll: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl<S: BlockSource> FetchController<S> {
    /// Create a controller for one chain
    pub fn new(chain_id: u64, source: S, policy: ControllerPolicy, retry: RetryPolicy) -> Self {
        Self {
            chain_id,
            source: Arc::new(source),
            limiter: AdaptiveLimiter::new(policy),
            retry,
            head_poll: Duration::from_secs(1),
            metrics: None,
        }
    }

    /// How long to wait before re-reading the node head at the tip
    pub fn with_head_poll(mut self, interval: Duration) -> Self {
        self.head_poll = interval;
        self
    }

    /// Record latency, errors and parallelism into `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Chain served by this controller
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Block source
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Concurrency limiter
    pub fn limiter(&self) -> &AdaptiveLimiter {
        &self.limiter
    }

    /// Current in-flight request limit
    pub fn current_parallelism(&self) -> usize {
        self.limiter.current()
    }

    /// p95 request latency over the limiter window
    pub fn p95_latency(&self) -> Duration {
        self.limiter.p95_latency()
    }

    /// Keep the limiter adjusting until cancelled
    pub fn spawn_adjuster(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let limiter = self.limiter.clone();
        let metrics = self.metrics.clone();
        let chain_id = self.chain_id;
        let tick = limiter.policy().tick;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let current = limiter.tick();
                        if let Some(metrics) = &metrics {
                            metrics.gauge(&labeled("rpc_parallelism", chain_id), current as i64);
                        }
                    }
                }
            }
        })
    }

    fn observe(&self, started: Instant, ok: bool) {
        if let Some(metrics) = &self.metrics {
            let ms = started.elapsed().as_secs_f64() * 1000.0;
            metrics.histogram(&labeled("rpc_latency_ms", self.chain_id), ms);
            if !ok {
                metrics.counter(&labeled("rpc_errors", self.chain_id), 1);
            }
        }
    }

    /// Fetch one block, retrying transient failures
    pub async fn fetch_block(&self, number: u64) -> RpcResult<NormalizedBlock> {
        let attempt = move || async move {
            let started = Instant::now();
            let result = self
                .limiter
                .run(|| self.source.fetch_block(number))
                .await;
            self.observe(started, result.is_ok());
            result
        };
        attempt
            .retry(self.retry.backoff())
            .when(RpcError::is_transient)
            .notify(|err: &RpcError, delay: Duration| {
                warn!(chain_id = self.chain_id, number, error = %err, ?delay, "Block fetch failed, retrying");
            })
            .await
    }

    /// Node head, retrying transient failures
    pub async fn latest_block_number(&self) -> RpcResult<u64> {
        let attempt = move || async move {
            self.limiter
                .run(|| self.source.latest_block_number())
                .await
        };
        attempt
            .retry(self.retry.backoff())
            .when(RpcError::is_transient)
            .notify(|err: &RpcError, delay: Duration| {
                warn!(chain_id = self.chain_id, error = %err, ?delay, "Head query failed, retrying");
            })
            .await
    }

    /// Blocks `from..=to` in order. Any block that exhausts its retries
    /// fails the whole range.
    pub async fn fetch_range(&self, from: u64, to: u64) -> RpcResult<Vec<NormalizedBlock>> {
        if to < from {
            return Ok(Vec::new());
        }
        let width = self.limiter.policy().max_parallelism.max(1);
        stream::iter(from..=to)
            .map(|number| self.fetch_block(number))
            .buffered(width)
            .try_collect()
            .await
    }
}

impl<S: BlockSource> FetchController<S> {
    /// Stream blocks from `start` upward, following the node head.
    ///
    /// Up to `lookahead` blocks are in flight at once; the limiter caps how
    /// many of them hit the node concurrently. The first error is delivered
    /// and ends the stream, as does cancellation or dropping the receiver.
    pub fn stream_from(
        self: &Arc<Self>,
        start: u64,
        lookahead: usize,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<RpcResult<NormalizedBlock>> {
        let lookahead = lookahead.max(1);
        let (tx, rx) = mpsc::channel(lookahead);
        let this = Arc::clone(self);

        tokio::spawn(async move {
            let numbers = this.block_numbers(start, cancel.clone());
            let fetcher = Arc::clone(&this);
            let mut blocks = std::pin::pin!(numbers
                .map(move |item| {
                    let fetcher = Arc::clone(&fetcher);
                    async move {
                        match item {
                            Ok(number) => fetcher.fetch_block(number).await,
                            Err(e) => Err(e),
                        }
                    }
                })
                .buffered(lookahead));

            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = blocks.next() => item,
                };
                let Some(item) = item else { break };
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
            debug!(chain_id = this.chain_id, "Block stream ended");
        });
        rx
    }

    /// Ascending block numbers, each yielded only once the node head has
    /// reached it
    fn block_numbers(
        self: &Arc<Self>,
        start: u64,
        cancel: CancellationToken,
    ) -> impl futures::Stream<Item = RpcResult<u64>> + Send + 'static {
        let this = Arc::clone(self);
        stream::unfold(Some((start, 0u64)), move |state| {
            let this = Arc::clone(&this);
            let cancel = cancel.clone();
            async move {
                let (next, mut head) = state?;
                while head < next {
                    match this.latest_block_number().await {
                        Ok(latest) => head = latest,
                        Err(e) => return Some((Err(e), None)),
                    }
                    if head >= next {
                        break;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(this.head_poll) => {}
                    }
                }
                Some((Ok(next), Some((next + 1, head))))
            }
        })
    }
}
