//! Rollup node RPC client (`optimism_` and `opp2p_` namespaces).

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use opcore_types::{OutputResponse, SyncStatus};
use serde::Deserialize;

use super::{
    rpc::{quantity, RpcClient},
    L1SourceError,
};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeerStats {
    connected: u64,
}

/// Source of the rollup node's view of the L1 and L2 heads.
#[async_trait]
pub trait SyncStatusProvider: Send + Sync {
    async fn sync_status(&self) -> Result<SyncStatus, L1SourceError>;
}

/// Source of the gossip peer count.
#[async_trait]
pub trait PeerCountProvider: Send + Sync {
    async fn peer_count(&self) -> Result<u64, L1SourceError>;
}

#[async_trait]
impl<P: SyncStatusProvider + ?Sized> SyncStatusProvider for Arc<P> {
    async fn sync_status(&self) -> Result<SyncStatus, L1SourceError> {
        (**self).sync_status().await
    }
}

#[async_trait]
impl<P: PeerCountProvider + ?Sized> PeerCountProvider for Arc<P> {
    async fn peer_count(&self) -> Result<u64, L1SourceError> {
        (**self).peer_count().await
    }
}

#[derive(Debug)]
pub struct RollupNodeClient {
    rpc: RpcClient,
}

impl RollupNodeClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, L1SourceError> {
        Ok(Self { rpc: RpcClient::new(url, timeout)? })
    }

    pub async fn output_at_block(&self, number: u64) -> Result<OutputResponse, L1SourceError> {
        self.rpc.request("optimism_outputAtBlock", [quantity(number)]).await
    }
}

#[async_trait]
impl SyncStatusProvider for RollupNodeClient {
    async fn sync_status(&self) -> Result<SyncStatus, L1SourceError> {
        self.rpc.request("optimism_syncStatus", serde_json::json!([])).await
    }
}

#[async_trait]
impl PeerCountProvider for RollupNodeClient {
    async fn peer_count(&self) -> Result<u64, L1SourceError> {
        let stats: PeerStats = self.rpc.request("opp2p_peerStats", serde_json::json!([])).await?;
        Ok(stats.connected)
    }
}
