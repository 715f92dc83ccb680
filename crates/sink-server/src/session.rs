//! One consumer's streaming session

use crate::error::{ServerError, ServerResult};
use crate::prefetch::PrefetchCache;
use crate::registry::{ChainRegistry, ChainState};
use crate::service::ServerConfig;
use bytes::Bytes;
use sink_metrics::{labeled, Metrics};
use sink_storage::{ColdArchive, HotStore};
use sink_types::codec::FRAME_LEVEL;
use sink_types::{
    compress_records, read_frame, write_frame, Frame, FrameType, Hello, StatusMessage,
    FIRST_BLOCK,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Most hot blocks packed into one frame
const HOT_FRAME_BLOCKS: u64 = 64;

/// Shared handles every session reads from
pub(crate) struct SessionContext {
    pub(crate) registry: Arc<ChainRegistry>,
    pub(crate) hot: HotStore,
    pub(crate) archive: ColdArchive,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) config: ServerConfig,
}

/// Tier a frame was served from
#[derive(Debug, Clone, Copy)]
enum Tier {
    Hot,
    Cold,
}

/// What a single loop step produced
enum Step {
    /// Frame ready; cursor moves to the given block
    Send(Tier, Frame, u64),
    /// Nothing past the cursor yet
    Idle,
}

/// Serve one connection until the peer leaves or `cancel` fires
pub(crate) async fn run_session(
    ctx: Arc<SessionContext>,
    stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) -> ServerResult<()> {
    let (mut reader, mut writer) = stream.into_split();

    let hello = loop {
        let frame = match tokio::time::timeout(ctx.config.handshake_timeout, read_frame(&mut reader)).await {
            Ok(frame) => frame?,
            Err(_) => {
                let _ = write_frame(&mut writer, &Frame::error("handshake timed out")).await;
                return Err(ServerError::HandshakeTimeout);
            }
        };
        match frame.frame_type {
            FrameType::ListChains => {
                let reply = Frame::json(FrameType::Chains, &ctx.registry.list())?;
                write_frame(&mut writer, &reply).await?;
            }
            FrameType::Hello => match frame.parse_json::<Hello>() {
                Ok(hello) => break hello,
                Err(e) => {
                    let _ = write_frame(&mut writer, &Frame::error(format!("malformed hello: {e}"))).await;
                    return Err(ServerError::Protocol(format!("malformed hello: {e}")));
                }
            },
            other => {
                let message = format!("unexpected {:?} frame before hello", other);
                let _ = write_frame(&mut writer, &Frame::error(message.clone())).await;
                return Err(ServerError::Protocol(message));
            }
        }
    };

    let Some(chain) = ctx.registry.get(hello.chain_id) else {
        let _ = write_frame(&mut writer, &Frame::error(format!("unknown chain {}", hello.chain_id))).await;
        return Err(ServerError::UnknownChain(hello.chain_id));
    };

    // Anything the client sends after the handshake is ignored; EOF ends the session.
    let session_cancel = cancel.child_token();
    let watcher = {
        let session_cancel = session_cancel.clone();
        tokio::spawn(async move {
            while read_frame(&mut reader).await.is_ok() {}
            session_cancel.cancel();
        })
    };

    let start = hello.from_block.max(FIRST_BLOCK);
    info!(%peer, chain_id = chain.chain_id(), from_block = start, "Session started");

    let result = stream_blocks(&ctx, &chain, start, &mut writer, &session_cancel).await;
    watcher.abort();

    match &result {
        Ok(cursor) => info!(%peer, chain_id = chain.chain_id(), cursor, "Session closed"),
        Err(e) => {
            warn!(%peer, chain_id = chain.chain_id(), error = %e, "Session failed");
            let report = match e {
                ServerError::Corrupt { .. } => true,
                ServerError::Storage(inner) => !inner.is_transient(),
                _ => false,
            };
            if report {
                let _ = write_frame(&mut writer, &Frame::error(e.to_string())).await;
            }
        }
    }
    result.map(|_| ())
}

/// Main delivery loop; returns the cursor reached when cancelled
async fn stream_blocks<W: AsyncWrite + Unpin>(
    ctx: &SessionContext,
    chain: &ChainState,
    start: u64,
    writer: &mut W,
    cancel: &CancellationToken,
) -> ServerResult<u64> {
    let chain_id = chain.chain_id();
    let mut cursor = start;
    let mut sent_live = false;
    let mut prefetch = PrefetchCache::new(chain_id, ctx.archive.clone(), ctx.config.cold_lookahead);

    let hot_frames = labeled("stream_frames_hot", chain_id);
    let cold_frames = labeled("stream_frames_cold", chain_id);

    while !cancel.is_cancelled() {
        // registered before the tier lookups so a head bump in between still wakes us
        let changed = chain.changed();

        let step = match next_step(ctx, chain, cursor, &mut prefetch).await {
            Ok(step) => step,
            // archive retries are spent; treat as not yet available
            Err(ServerError::Storage(e)) if e.is_transient() => {
                warn!(chain_id, cursor, error = %e, "Tier read failed, will retry");
                ctx.metrics.counter(&labeled("stream_read_errors", chain_id), 1);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ctx.config.tip_poll) => {}
                }
                continue;
            }
            Err(e) => return Err(e),
        };

        match step {
            Step::Send(tier, frame, next) => {
                let metric = match tier {
                    Tier::Hot => &hot_frames,
                    Tier::Cold => &cold_frames,
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    written = write_frame(writer, &frame) => written?,
                }
                ctx.metrics.counter(metric, 1);
                ctx.metrics.counter(&labeled("stream_bytes", chain_id), frame.payload.len() as u64);
                cursor = next;
                sent_live = false;
            }
            Step::Idle => {
                if !sent_live {
                    let status = StatusMessage {
                        status: "live".to_string(),
                        head_block: cursor - 1,
                    };
                    let frame = Frame::json(FrameType::Status, &status)?;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        written = write_frame(writer, &frame) => written?,
                    }
                    debug!(chain_id, head_block = cursor - 1, "Session reached tip");
                    sent_live = true;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = changed => {}
                    _ = tokio::time::sleep(ctx.config.tip_poll) => {}
                }
            }
        }
    }
    Ok(cursor)
}

/// Hot tier first, then the archive, for the block at `cursor`
async fn next_step(
    ctx: &SessionContext,
    chain: &ChainState,
    cursor: u64,
    prefetch: &mut PrefetchCache,
) -> ServerResult<Step> {
    let chain_id = chain.chain_id();

    let records = ctx
        .hot
        .range_scan(chain_id, cursor, cursor.saturating_add(HOT_FRAME_BLOCKS - 1))?;
    let contiguous: Vec<Bytes> = records
        .into_iter()
        .zip(cursor..)
        .take_while(|((number, _), expected)| number == expected)
        .map(|((_, record), _)| record)
        .collect();
    if !contiguous.is_empty() {
        let next = cursor + contiguous.len() as u64;
        let compressed = compress_records(&contiguous, FRAME_LEVEL)?;
        return Ok(Step::Send(Tier::Hot, Frame::blocks(compressed), next));
    }

    let head = chain.latest();
    if cursor > head {
        return Ok(Step::Idle);
    }

    let batch = ctx.archive.batch_for(cursor);
    prefetch.prefetch(batch, head);
    let fetched = sink_metrics::timed!(ctx.metrics, &labeled("stream_cold_fetch_ms", chain_id), {
        prefetch.take(batch).await
    });
    match fetched? {
        Some(raw) if raw.is_empty() => Err(ServerError::Corrupt {
            chain_id,
            reason: format!("empty archive object for batch {}", batch),
        }),
        Some(raw) => Ok(Step::Send(Tier::Cold, Frame::blocks(raw), batch.end + 1)),
        None => Ok(Step::Idle),
    }
}
