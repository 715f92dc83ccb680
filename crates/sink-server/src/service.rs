//! TCP streaming service

use crate::error::{ServerError, ServerResult};
use crate::registry::ChainRegistry;
use crate::session::{run_session, SessionContext};
use parking_lot::RwLock;
use sink_metrics::Metrics;
use sink_storage::{ColdArchive, HotStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Streaming server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address
    pub listen_addr: SocketAddr,
    /// Sleep between head checks while a session waits at the tip
    pub tip_poll: Duration,
    /// Time allowed for the client's Hello
    pub handshake_timeout: Duration,
    /// Archive batches read ahead per session
    pub cold_lookahead: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            tip_poll: Duration::from_millis(50),
            handshake_timeout: Duration::from_secs(30),
            cold_lookahead: 10,
        }
    }
}

impl ServerConfig {
    /// Config with the given address and default timings
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }
}

/// Accepts consumers and runs one session task per connection
pub struct StreamServer {
    ctx: Arc<SessionContext>,
    cancel: CancellationToken,
    running: Arc<RwLock<bool>>,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl StreamServer {
    /// Create a server over the shared stores
    pub fn new(
        config: ServerConfig,
        registry: Arc<ChainRegistry>,
        hot: HotStore,
        archive: ColdArchive,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            ctx: Arc::new(SessionContext {
                registry,
                hot,
                archive,
                metrics,
                config,
            }),
            cancel: CancellationToken::new(),
            running: Arc::new(RwLock::new(false)),
            local_addr: RwLock::new(None),
        }
    }

    /// Tie the server's lifetime to an outer token
    pub fn with_cancel(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    /// Check if running
    pub fn is_running(&self) -> bool {
        *self.running.read()
    }

    /// Bound address once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Chain registry
    pub fn registry(&self) -> &Arc<ChainRegistry> {
        &self.ctx.registry
    }

    /// Bind and start accepting; returns the bound address
    pub async fn start(&self) -> ServerResult<SocketAddr> {
        if *self.running.read() {
            return Err(ServerError::AlreadyRunning);
        }

        let listener = TcpListener::bind(self.ctx.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.write() = Some(addr);
        *self.running.write() = true;
        info!("Stream server listening on {}", addr);

        let ctx = Arc::clone(&self.ctx);
        let cancel = self.cancel.clone();
        let running = Arc::clone(&self.running);
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("Incoming connection from {}", peer);
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set nodelay for {}: {}", peer, e);
                        }
                        let ctx = Arc::clone(&ctx);
                        let session_cancel = cancel.child_token();
                        tokio::spawn(async move {
                            ctx.metrics.gauge_add("stream_sessions", 1);
                            if let Err(e) = run_session(Arc::clone(&ctx), stream, peer, session_cancel).await {
                                debug!("Session with {} ended: {}", peer, e);
                            }
                            ctx.metrics.gauge_add("stream_sessions", -1);
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            *running.write() = false;
            info!("Stream server stopped");
        });

        Ok(addr)
    }

    /// Stop accepting and end every session
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
