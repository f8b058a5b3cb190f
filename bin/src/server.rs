//! `/healthz`, `/metrics` and the conductor's raft RPCs over axum.

use std::{net::SocketAddr, sync::Arc};

use axum::{extract::State, routing::get, Json, Router};
use opcore_batcher::BatcherMetrics;
use opcore_conductor::{raft_router, Conductor, HttpNetwork, RaftNode};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

pub type ConductorNode = Conductor<Arc<RaftNode<HttpNetwork>>>;

/// What a service reports about itself.
#[derive(Clone)]
pub enum Status {
    Service(&'static str),
    Batcher(Arc<BatcherMetrics>),
    Conductor(Arc<ConductorNode>),
}

impl Status {
    pub const fn service(name: &'static str) -> Self {
        Self::Service(name)
    }

    pub const fn batcher(metrics: Arc<BatcherMetrics>) -> Self {
        Self::Batcher(metrics)
    }

    pub const fn conductor(conductor: Arc<ConductorNode>) -> Self {
        Self::Conductor(conductor)
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Service(name) => *name,
            Self::Batcher(_) => "batcher",
            Self::Conductor(_) => "conductor",
        }
    }
}

async fn healthz(State(status): State<Status>) -> Json<Value> {
    let mut body = json!({
        "service": status.name(),
        "version": env!("CARGO_PKG_VERSION"),
    });
    if let Status::Conductor(conductor) = &status {
        body["leader"] = json!(conductor.leader().await);
        body["active"] = json!(conductor.active());
        body["healthy"] = json!(conductor.sequencer_healthy());
    }
    Json(body)
}

async fn metrics(State(status): State<Status>) -> Json<Value> {
    match &status {
        Status::Batcher(metrics) => Json(json!(metrics.snapshot())),
        Status::Conductor(conductor) => Json(json!({
            "leader": conductor.leader().await,
            "health_failures": conductor.failures(),
            "paused": conductor.paused(),
        })),
        Status::Service(_) => Json(json!({})),
    }
}

async fn serve(addr: SocketAddr, app: Router, what: &'static str, cancel: CancellationToken) {
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%addr, %err, "failed to bind {what} server");
            return;
        }
    };
    info!(%addr, "{what} server listening");
    let shutdown = async move { cancel.cancelled().await };
    if let Err(err) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        error!(%err, "{what} server failed");
    }
}

pub async fn serve_rpc(addr: SocketAddr, status: Status, cancel: CancellationToken) {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .layer(CorsLayer::permissive())
        .with_state(status);
    serve(addr, app, "rpc", cancel).await;
}

/// Raft traffic from the other conductors.
pub async fn serve_raft(addr: SocketAddr, node: Arc<RaftNode<HttpNetwork>>, cancel: CancellationToken) {
    serve(addr, raft_router(node), "raft", cancel).await;
}

pub async fn serve_metrics(addr: SocketAddr, status: Status, cancel: CancellationToken) {
    let app = Router::new().route("/metrics", get(metrics)).with_state(status);
    serve(addr, app, "metrics", cancel).await;
}
