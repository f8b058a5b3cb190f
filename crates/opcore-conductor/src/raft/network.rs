//! Raft RPCs and how they travel between servers.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{node::RaftNode, ConsensusError, RaftSnapshot, ServerInfo};
use crate::fsm::LogEntry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
    /// The current leader asked for this election, so voters should not hold on to it.
    #[serde(default)]
    pub transfer: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub granted: bool,
}

/// Entries to store after `prev_log_index`; a heartbeat when `entries` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendRequest {
    pub term: u64,
    pub leader: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResponse {
    pub term: u64,
    pub success: bool,
    /// On success the last index now matching the leader. Otherwise the last index the leader
    /// should try to match next.
    pub last_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub term: u64,
    pub leader: String,
    pub snapshot: RaftSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub term: u64,
}

/// Tells a caught-up follower to start an election right away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutNowRequest {
    pub term: u64,
    pub leader: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutNowResponse {
    pub term: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("server {0} is unreachable")]
    Unreachable(String),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
}

/// Carries RPCs to other servers.
#[async_trait]
pub trait RaftNetwork: Send + Sync + 'static {
    async fn vote(&self, target: &ServerInfo, req: VoteRequest) -> Result<VoteResponse, NetworkError>;

    async fn append(
        &self,
        target: &ServerInfo,
        req: AppendRequest,
    ) -> Result<AppendResponse, NetworkError>;

    async fn install_snapshot(
        &self,
        target: &ServerInfo,
        req: SnapshotRequest,
    ) -> Result<SnapshotResponse, NetworkError>;

    async fn timeout_now(
        &self,
        target: &ServerInfo,
        req: TimeoutNowRequest,
    ) -> Result<TimeoutNowResponse, NetworkError>;
}

/// JSON over HTTP to `http://<addr>/raft/<rpc>`.
#[derive(Debug, Clone)]
pub struct HttpNetwork {
    client: Client,
}

impl HttpNetwork {
    pub fn new(timeout: Duration) -> Result<Self, NetworkError> {
        Ok(Self { client: Client::builder().timeout(timeout).build()? })
    }

    async fn call<Req, Resp>(&self, target: &ServerInfo, rpc: &str, req: &Req) -> Result<Resp, NetworkError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("http://{}/raft/{rpc}", target.addr);
        let response = self.client.post(url).json(req).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl RaftNetwork for HttpNetwork {
    async fn vote(&self, target: &ServerInfo, req: VoteRequest) -> Result<VoteResponse, NetworkError> {
        self.call(target, "vote", &req).await
    }

    async fn append(
        &self,
        target: &ServerInfo,
        req: AppendRequest,
    ) -> Result<AppendResponse, NetworkError> {
        self.call(target, "append", &req).await
    }

    async fn install_snapshot(
        &self,
        target: &ServerInfo,
        req: SnapshotRequest,
    ) -> Result<SnapshotResponse, NetworkError> {
        self.call(target, "snapshot", &req).await
    }

    async fn timeout_now(
        &self,
        target: &ServerInfo,
        req: TimeoutNowRequest,
    ) -> Result<TimeoutNowResponse, NetworkError> {
        self.call(target, "timeout-now", &req).await
    }
}

type Reply<T> = Result<Json<T>, (StatusCode, String)>;

fn reply<T>(result: Result<T, ConsensusError>) -> Reply<T> {
    result.map(Json).map_err(|err| match err {
        ConsensusError::Shutdown => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
        err => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    })
}

/// The receiving side of [`HttpNetwork`].
pub fn raft_router<N: RaftNetwork>(node: Arc<RaftNode<N>>) -> Router {
    Router::new()
        .route("/raft/vote", post(vote::<N>))
        .route("/raft/append", post(append::<N>))
        .route("/raft/snapshot", post(install_snapshot::<N>))
        .route("/raft/timeout-now", post(timeout_now::<N>))
        .with_state(node)
}

async fn vote<N: RaftNetwork>(
    State(node): State<Arc<RaftNode<N>>>,
    Json(req): Json<VoteRequest>,
) -> Reply<VoteResponse> {
    reply(node.handle_vote(req).await)
}

async fn append<N: RaftNetwork>(
    State(node): State<Arc<RaftNode<N>>>,
    Json(req): Json<AppendRequest>,
) -> Reply<AppendResponse> {
    reply(node.handle_append(req).await)
}

async fn install_snapshot<N: RaftNetwork>(
    State(node): State<Arc<RaftNode<N>>>,
    Json(req): Json<SnapshotRequest>,
) -> Reply<SnapshotResponse> {
    reply(node.handle_install_snapshot(req).await)
}

async fn timeout_now<N: RaftNetwork>(
    State(node): State<Arc<RaftNode<N>>>,
    Json(req): Json<TimeoutNowRequest>,
) -> Reply<TimeoutNowResponse> {
    reply(node.handle_timeout_now(req).await)
}
