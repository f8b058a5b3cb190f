//! Consensus over the unsafe head.
//!
//! [`Consensus`] is what the conductor needs from a Raft cluster. [`RaftNode`] implements it:
//! leader election with randomized timeouts, log replication over a [`RaftNetwork`], a durable
//! log and term under `<storage_dir>/raft/`, state-machine snapshots every `snapshot_interval`
//! applied entries, and leadership transfer through `TimeoutNow`.
//!
//! [`HttpNetwork`] carries the RPCs as JSON over HTTP; [`raft_router`] serves the receiving side.

mod network;
mod node;
pub(crate) mod storage;

use std::{io, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use bon::Builder;
use opcore_types::{ExecutionPayloadEnvelope, PayloadCodecError};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::fsm::FsmError;

pub use network::{
    raft_router, AppendRequest, AppendResponse, HttpNetwork, NetworkError, RaftNetwork,
    SnapshotRequest, SnapshotResponse, TimeoutNowRequest, TimeoutNowResponse, VoteRequest,
    VoteResponse,
};
pub use node::RaftNode;
pub use storage::RaftSnapshot;

/// Applied entries between two snapshots.
pub const SNAPSHOT_INTERVAL: u64 = 8192;

/// Entries kept in the log after a snapshot.
pub const TRAILING_LOGS: u64 = 10240;

const RAFT_DIR: &str = "raft";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Suffrage {
    Voter,
    Nonvoter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: String,
    pub addr: String,
    pub suffrage: Suffrage,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMembership {
    pub servers: Vec<ServerInfo>,
    /// Bumped on every membership change.
    pub version: u64,
}

impl ClusterMembership {
    pub fn get(&self, id: &str) -> Option<&ServerInfo> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn voters(&self) -> impl Iterator<Item = &ServerInfo> {
        self.servers.iter().filter(|s| s.suffrage == Suffrage::Voter)
    }

    pub fn is_voter(&self, id: &str) -> bool {
        self.get(id).is_some_and(|s| s.suffrage == Suffrage::Voter)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("not the leader")]
    NotLeader,
    #[error("unknown server {0}")]
    UnknownServer(String),
    #[error("server {0} is not a voter")]
    NotVoter(String),
    #[error("server {0} is already a voter")]
    AlreadyVoter(String),
    #[error("no voter to transfer leadership to")]
    NoTransferTarget,
    #[error("leadership transfer to {0} timed out")]
    TransferTimeout(String),
    #[error("a membership change is still being committed")]
    ConfigChangeInProgress,
    #[error("entry {0} was not committed in time")]
    CommitTimeout(u64),
    #[error("consensus is shut down")]
    Shutdown,
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("payload encoding: {0}")]
    Codec(#[from] PayloadCodecError),
    #[error(transparent)]
    Fsm(#[from] FsmError),
    #[error("raft storage: {0}")]
    Io(String),
    #[error("raft encoding: {0}")]
    Encoding(String),
}

impl From<io::Error> for ConsensusError {
    fn from(err: io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ConsensusError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encoding(err.to_string())
    }
}

/// A Raft cluster replicating the latest unsafe payload.
#[async_trait]
pub trait Consensus: Send + Sync {
    fn server_id(&self) -> &str;

    async fn leader(&self) -> bool;

    async fn leader_with_id(&self) -> Option<ServerInfo>;

    /// Flips to `true` when this node gains leadership and to `false` when it loses it.
    fn leader_ch(&self) -> watch::Receiver<bool>;

    /// Leader only. Returns once a quorum stored the entry and it was applied here.
    async fn commit_unsafe_payload(
        &self,
        payload: &ExecutionPayloadEnvelope,
    ) -> Result<(), ConsensusError>;

    async fn latest_unsafe_payload(&self) -> Option<ExecutionPayloadEnvelope>;

    async fn transfer_leader(&self) -> Result<(), ConsensusError>;

    async fn transfer_leader_to(&self, id: &str) -> Result<(), ConsensusError>;

    async fn add_voter(&self, id: &str, addr: &str) -> Result<(), ConsensusError>;

    async fn add_nonvoter(&self, id: &str, addr: &str) -> Result<(), ConsensusError>;

    async fn remove_server(&self, id: &str) -> Result<(), ConsensusError>;

    async fn cluster_membership(&self) -> ClusterMembership;

    async fn shutdown(&self) -> Result<(), ConsensusError>;
}

#[async_trait]
impl<C: Consensus + ?Sized> Consensus for Arc<C> {
    fn server_id(&self) -> &str {
        (**self).server_id()
    }

    async fn leader(&self) -> bool {
        (**self).leader().await
    }

    async fn leader_with_id(&self) -> Option<ServerInfo> {
        (**self).leader_with_id().await
    }

    fn leader_ch(&self) -> watch::Receiver<bool> {
        (**self).leader_ch()
    }

    async fn commit_unsafe_payload(
        &self,
        payload: &ExecutionPayloadEnvelope,
    ) -> Result<(), ConsensusError> {
        (**self).commit_unsafe_payload(payload).await
    }

    async fn latest_unsafe_payload(&self) -> Option<ExecutionPayloadEnvelope> {
        (**self).latest_unsafe_payload().await
    }

    async fn transfer_leader(&self) -> Result<(), ConsensusError> {
        (**self).transfer_leader().await
    }

    async fn transfer_leader_to(&self, id: &str) -> Result<(), ConsensusError> {
        (**self).transfer_leader_to(id).await
    }

    async fn add_voter(&self, id: &str, addr: &str) -> Result<(), ConsensusError> {
        (**self).add_voter(id, addr).await
    }

    async fn add_nonvoter(&self, id: &str, addr: &str) -> Result<(), ConsensusError> {
        (**self).add_nonvoter(id, addr).await
    }

    async fn remove_server(&self, id: &str) -> Result<(), ConsensusError> {
        (**self).remove_server(id).await
    }

    async fn cluster_membership(&self) -> ClusterMembership {
        (**self).cluster_membership().await
    }

    async fn shutdown(&self) -> Result<(), ConsensusError> {
        (**self).shutdown().await
    }
}

#[derive(Debug, Clone, Builder)]
pub struct RaftConfig {
    #[builder(into)]
    pub server_id: String,
    /// Where the other servers reach this one.
    #[builder(into, default = "127.0.0.1:50050".to_string())]
    pub server_addr: String,
    /// Log, term and snapshots go to `<storage_dir>/raft/`.
    #[builder(into)]
    pub storage_dir: PathBuf,
    /// Start a single-voter cluster led by this node when nothing is stored yet.
    #[builder(default)]
    pub bootstrap: bool,
    #[builder(default = SNAPSHOT_INTERVAL)]
    pub snapshot_interval: u64,
    #[builder(default = TRAILING_LOGS)]
    pub trailing_logs: u64,
    /// Snapshot files kept on disk.
    #[builder(default = 2)]
    pub snapshot_retain: usize,
    #[builder(default = Duration::from_millis(100))]
    pub heartbeat_interval: Duration,
    /// Followers wait between one and two of these without hearing from a leader before they
    /// campaign.
    #[builder(default = Duration::from_secs(1))]
    pub election_timeout: Duration,
    /// Bound on waiting for a quorum, for commits, membership changes and transfers alike.
    #[builder(default = Duration::from_secs(5))]
    pub commit_timeout: Duration,
    #[builder(default = 64)]
    pub max_append_entries: usize,
}
