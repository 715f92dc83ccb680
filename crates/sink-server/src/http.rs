//! HTTP status API: chain list, metrics snapshot, health

use crate::error::ServerResult;
use crate::registry::ChainRegistry;
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use sink_metrics::{Metrics, MetricsSnapshot};
use sink_types::ChainInfo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// State shared by the handlers
pub struct ApiState {
    registry: Arc<ChainRegistry>,
    metrics: Arc<Metrics>,
}

/// `/health` body
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `ok` while serving
    pub status: &'static str,
    /// Registered chains
    pub chains: usize,
}

/// Status API server
pub struct StatusApi {
    listen_addr: SocketAddr,
    state: Arc<ApiState>,
}

impl StatusApi {
    /// Create the API
    pub fn new(listen_addr: SocketAddr, registry: Arc<ChainRegistry>, metrics: Arc<Metrics>) -> Self {
        Self {
            listen_addr,
            state: Arc::new(ApiState { registry, metrics }),
        }
    }

    /// Build the router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/chains", get(chains))
            .route("/metrics", get(metrics))
            .route("/health", get(health))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
            .with_state(Arc::clone(&self.state))
    }

    /// Serve until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> ServerResult<()> {
        let app = self.router();
        let listener = TcpListener::bind(self.listen_addr).await?;
        tracing::info!("Status API listening on {}", listener.local_addr()?);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        Ok(())
    }
}

async fn chains(State(state): State<Arc<ApiState>>) -> Json<Vec<ChainInfo>> {
    Json(state.registry.list())
}

async fn metrics(State(state): State<Arc<ApiState>>) -> Json<MetricsSnapshot> {
    Json(MetricsSnapshot::from_metrics(&state.metrics))
}

async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        chains: state.registry.len(),
    })
}
