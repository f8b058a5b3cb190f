//! RPC-facing sources and sinks for the opcore services.
//!
//! - [`L1Provider`] over `eth_` JSON-RPC, with LRU caches and `backon` retry
//! - [`ConfDepth`] confirmation-depth filter
//! - [`BeaconClient`] blob sidecar fetcher with KZG verification
//! - [`L2Provider`] raw L2 block access
//! - [`EngineClient`] JWT-authenticated engine API
//! - [`RollupNodeClient`] for sync status, peers and output roots
//! - [`ReorgDetector`] and [`HeadTracker`] for the node service

mod beacon;
mod conf_depth;
mod engine;
mod error;
mod heads;
mod l1;
mod l2;
mod reorg;
mod retry;
mod rollup;
mod rpc;
mod types;


pub use beacon::{verify_sidecar, BeaconClient, BlobProvider};
pub use conf_depth::{ConfDepth, L1Head};
pub use engine::{EngineApi, EngineClient, EngineVersion};
pub use error::L1SourceError;
pub use heads::{HeadTracker, HeadUpdate};
pub use l1::{HttpL1Provider, L1Provider, L1SourceConfig};
pub use l2::{
    batch_transactions, l1_info_of, l2_block_ref, raw_transactions, HttpL2Provider, L2Block,
    L2Provider,
};
pub use reorg::{ReorgDetector, ReorgEvent};
pub use retry::{RetryConfig, MAX_ATTEMPTS};
pub use rollup::{PeerCountProvider, RollupNodeClient, SyncStatusProvider};
pub use rpc::{quantity, RpcClient};
pub use types::{RpcBlock, RpcHeader, RpcReceipt, RpcTransaction};
