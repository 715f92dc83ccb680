//! Connection handling, reconnects and cursor tracking

use crate::block::StreamedBlock;
use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use sink_types::{
    decompress_records, read_frame, record_block_number, write_frame, ChainInfo, ErrorMessage,
    Frame, FrameType, Hello, StatusMessage, TypesError, FIRST_BLOCK,
};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address, `host:port`
    pub addr: String,
    /// Reconnect after transport failures
    pub reconnect: bool,
    /// Pause before reconnecting
    pub reconnect_delay: Duration,
    /// Limit for connecting and for one-shot replies
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:9090".to_string(),
            reconnect: true,
            reconnect_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Consumer of a sink stream.
///
/// Blocks are delivered strictly in order starting at the requested block.
/// After a dropped connection the client resumes at the block after the
/// last one delivered.
#[derive(Debug, Clone)]
pub struct SinkClient {
    config: ClientConfig,
    cancel: CancellationToken,
}

/// How a session ended, when it did not end in cancellation
enum Interrupt {
    /// Worth a fresh connection
    Transport(ClientError),
    /// Returned to the caller as is
    Fatal(ClientError),
}

impl From<ClientError> for Interrupt {
    fn from(err: ClientError) -> Self {
        Interrupt::Transport(err)
    }
}

impl From<TypesError> for Interrupt {
    fn from(err: TypesError) -> Self {
        Interrupt::Transport(err.into())
    }
}

#[async_trait]
trait Deliver: Send {
    async fn deliver(&mut self, block: StreamedBlock) -> ClientResult<()>;
}

struct Callback<F>(F);

#[async_trait]
impl<F> Deliver for Callback<F>
where
    F: FnMut(StreamedBlock) -> ClientResult<()> + Send,
{
    async fn deliver(&mut self, block: StreamedBlock) -> ClientResult<()> {
        (self.0)(block)
    }
}

struct Channel(mpsc::Sender<StreamedBlock>);

#[async_trait]
impl Deliver for Channel {
    async fn deliver(&mut self, block: StreamedBlock) -> ClientResult<()> {
        self.0.send(block).await.map_err(|_| ClientError::ChannelClosed)
    }
}

impl SinkClient {
    /// Client for the given server with default settings
    pub fn new(addr: impl Into<String>) -> Self {
        Self::with_config(ClientConfig {
            addr: addr.into(),
            ..Default::default()
        })
    }

    /// Client with explicit settings
    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Enable or disable reconnects
    pub fn with_reconnect(mut self, enabled: bool) -> Self {
        self.config.reconnect = enabled;
        self
    }

    /// Pause before reconnecting
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    /// Connect and reply timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Stop streaming when `cancel` fires
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Settings in use
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn connect(&self) -> ClientResult<TcpStream> {
        let addr = self.config.addr.as_str();
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout(format!("connect to {addr}")))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Chains the server knows, with their latest blocks
    pub async fn list_chains(&self) -> ClientResult<Vec<ChainInfo>> {
        let mut stream = self.connect().await?;
        write_frame(&mut stream, &Frame::new(FrameType::ListChains, Vec::new())).await?;

        let frame = tokio::time::timeout(self.config.connect_timeout, read_frame(&mut stream))
            .await
            .map_err(|_| ClientError::Timeout("chain list".into()))??;
        match frame.frame_type {
            FrameType::Chains => Ok(frame.parse_json()?),
            FrameType::ServerError => Err(ClientError::Server(error_text(&frame))),
            other => Err(ClientError::Protocol(format!("expected chain list, got {:?}", other))),
        }
    }

    /// Stream `chain_id` from `from_block` (0 means 1), calling `on_block`
    /// for every block in order. Returns `Ok` once cancelled; a handler
    /// error or a server error frame ends the stream with that error.
    pub async fn stream<F>(&self, chain_id: u64, from_block: u64, on_block: F) -> ClientResult<()>
    where
        F: FnMut(StreamedBlock) -> ClientResult<()> + Send,
    {
        self.run(chain_id, from_block, &mut Callback(on_block)).await
    }

    /// Stream into a bounded channel. The task finishes when the receiver is
    /// dropped, the client is cancelled, or the stream fails.
    pub fn stream_blocks(
        &self,
        chain_id: u64,
        from_block: u64,
        buffer: usize,
    ) -> (mpsc::Receiver<StreamedBlock>, JoinHandle<ClientResult<()>>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let client = self.clone();
        let handle = tokio::spawn(async move {
            match client.run(chain_id, from_block, &mut Channel(tx)).await {
                Err(ClientError::ChannelClosed) => Ok(()),
                other => other,
            }
        });
        (rx, handle)
    }

    async fn run<H: Deliver>(&self, chain_id: u64, from_block: u64, handler: &mut H) -> ClientResult<()> {
        let mut cursor = from_block.max(FIRST_BLOCK);

        loop {
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                outcome = self.session(chain_id, &mut cursor, handler) => outcome,
            };
            let err = match outcome {
                Interrupt::Fatal(err) => return Err(err),
                Interrupt::Transport(err) => err,
            };
            if !self.config.reconnect || !err.is_retryable() {
                return Err(err);
            }

            warn!(
                chain_id,
                cursor,
                error = %err,
                "Stream interrupted, reconnecting in {:?}",
                self.config.reconnect_delay
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
    }

    /// One connection. Only ever returns by interruption.
    async fn session<H: Deliver>(&self, chain_id: u64, cursor: &mut u64, handler: &mut H) -> Interrupt {
        match self.session_inner(chain_id, cursor, handler).await {
            Ok(never) => match never {},
            Err(interrupt) => interrupt,
        }
    }

    async fn session_inner<H: Deliver>(
        &self,
        chain_id: u64,
        cursor: &mut u64,
        handler: &mut H,
    ) -> Result<std::convert::Infallible, Interrupt> {
        let mut stream = self.connect().await?;
        let hello = Hello {
            chain_id,
            from_block: *cursor,
        };
        write_frame(&mut stream, &Frame::json(FrameType::Hello, &hello)?).await?;
        debug!(chain_id, from_block = *cursor, addr = %self.config.addr, "Connected");

        loop {
            let frame = read_frame(&mut stream).await?;
            match frame.frame_type {
                FrameType::Blocks => {
                    for record in decompress_records(&frame.payload)? {
                        let number = record_block_number(&record)?;
                        if number < *cursor {
                            continue;
                        }
                        if number > *cursor {
                            return Err(ClientError::OutOfOrder {
                                expected: *cursor,
                                got: number,
                            }
                            .into());
                        }
                        let block = StreamedBlock {
                            chain_id,
                            number,
                            data: record,
                        };
                        handler.deliver(block).await.map_err(Interrupt::Fatal)?;
                        *cursor += 1;
                    }
                }
                FrameType::Status => match frame.parse_json::<StatusMessage>() {
                    Ok(status) if status.status == "live" => {
                        info!(chain_id, head_block = status.head_block, "Caught up with the sink");
                    }
                    Ok(status) => debug!(chain_id, status = %status.status, "Server status"),
                    Err(e) => debug!(chain_id, error = %e, "Unreadable status frame"),
                },
                FrameType::ServerError => {
                    return Err(Interrupt::Fatal(ClientError::Server(error_text(&frame))));
                }
                other => {
                    return Err(ClientError::Protocol(format!("unexpected {:?} frame", other)).into());
                }
            }
        }
    }
}

fn error_text(frame: &Frame) -> String {
    frame
        .parse_json::<ErrorMessage>()
        .map(|msg| msg.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(&frame.payload).into_owned())
}
