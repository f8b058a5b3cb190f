//! Sequencer DA throttling.
//!
//! When the batcher falls behind, the sequencer is asked to cap the DA size of what it puts into
//! blocks until the backlog clears.

use std::sync::Arc;

use alloy_primitives::U64;
use async_trait::async_trait;
use bon::Builder;
use opcore_stream::{L1SourceError, RpcClient};
use tracing::{info, warn};

#[async_trait]
pub trait ThrottleClient: Send + Sync {
    /// Cap the DA size of single transactions and of whole blocks. Zero lifts a limit.
    async fn set_max_da_size(&self, max_tx_size: u64, max_block_size: u64)
        -> Result<(), L1SourceError>;
}

/// [`ThrottleClient`] calling `miner_setMaxDASize` on the sequencer's execution client.
#[derive(Debug)]
pub struct SequencerThrottleClient {
    rpc: RpcClient,
}

impl SequencerThrottleClient {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl ThrottleClient for SequencerThrottleClient {
    async fn set_max_da_size(
        &self,
        max_tx_size: u64,
        max_block_size: u64,
    ) -> Result<(), L1SourceError> {
        let ok: bool = self
            .rpc
            .request("miner_setMaxDASize", (U64::from(max_tx_size), U64::from(max_block_size)))
            .await?;
        if ok {
            Ok(())
        } else {
            Err(L1SourceError::Rpc { code: 0, message: "miner_setMaxDASize refused".into() })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Builder)]
pub struct ThrottleConfig {
    /// Pending DA bytes above which throttling starts.
    #[builder(default = 1_000_000)]
    pub threshold: u64,
    #[builder(default = 300)]
    pub tx_size: u64,
    #[builder(default = 21_000)]
    pub block_size: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Applies [`ThrottleConfig`] as the backlog changes, calling the sequencer only on transitions.
pub struct ThrottleController {
    config: ThrottleConfig,
    client: Arc<dyn ThrottleClient>,
    /// Last limits the sequencer accepted.
    applied: Option<(u64, u64)>,
}

impl ThrottleController {
    pub fn new(config: ThrottleConfig, client: Arc<dyn ThrottleClient>) -> Self {
        Self { config, client, applied: None }
    }

    pub fn is_throttling(&self) -> bool {
        self.applied.is_some_and(|limits| limits != (0, 0))
    }

    /// Re-evaluate with `pending` DA bytes in the backlog.
    pub async fn update(&mut self, pending: u64) {
        let limits = if pending > self.config.threshold {
            (self.config.tx_size, self.config.block_size)
        } else {
            (0, 0)
        };
        if self.applied == Some(limits) {
            return;
        }
        match self.client.set_max_da_size(limits.0, limits.1).await {
            Ok(()) => {
                info!(
                    target: "opcore::batcher",
                    pending,
                    max_tx_size = limits.0,
                    max_block_size = limits.1,
                    "updated sequencer DA limits"
                );
                self.applied = Some(limits);
            }
            Err(err) => {
                warn!(target: "opcore::batcher", %err, "failed to set sequencer DA limits");
            }
        }
    }
}
