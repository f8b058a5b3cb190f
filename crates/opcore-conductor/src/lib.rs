//! High-availability control for a sequencer.
//!
//! A Raft cluster replicates the latest unsafe payload; the leader's sequencer is watched by a
//! health monitor, and a leader that stays unhealthy hands leadership to another voter.
//!
//! ```text
//! rollup node --> HealthMonitor --(broadcast)--> Conductor --> Consensus (RaftNode)
//!                                                    ^               |  ^
//! sequencer ---- commit_unsafe_payload --------------+   UnsafeHeadFsm  |  /raft/* over HTTP
//!                                                                       v
//!                                                                 other conductors
//! ```

mod conductor;
mod fsm;
mod health;
mod raft;


pub use conductor::{Conductor, ConductorConfig, ConductorError, HealthAction};
pub use fsm::{Applied, Command, FsmError, FsmSnapshot, LogEntry, UnsafeHeadFsm};
pub use health::{Health, HealthConfig, HealthMonitor, Unhealthy};
pub use raft::{
    raft_router, AppendRequest, AppendResponse, ClusterMembership, Consensus, ConsensusError,
    HttpNetwork, NetworkError, RaftConfig, RaftNetwork, RaftNode, RaftSnapshot, ServerInfo,
    SnapshotRequest, SnapshotResponse, Suffrage, TimeoutNowRequest, TimeoutNowResponse,
    VoteRequest, VoteResponse, SNAPSHOT_INTERVAL, TRAILING_LOGS,
};
