//! Walks the L1 chain one block at a time.

use std::sync::Arc;

use alloy_primitives::Address;
use async_trait::async_trait;
use opcore_pipeline::{RollupConfig, SystemConfig};
use opcore_stream::L1Provider;
use opcore_types::L1BlockRef;
use tracing::{debug, error, warn};

use crate::{
    errors::{PipelineError, PipelineResult, ResetError},
    traits::{L1RetrievalProvider, OriginAdvancer, OriginProvider, ResettableStage},
};

/// Bottom stage of the pipeline.
///
/// Holds the current L1 origin and hands it up once. Advancing fetches the next block by number,
/// checks it extends the current one and replays its system config logs so the retrieval stage
/// filters by the right batcher address.
#[derive(Debug)]
pub struct L1Traversal<P> {
    block: Option<L1BlockRef>,
    done: bool,
    provider: P,
    system_config: SystemConfig,
    cfg: Arc<RollupConfig>,
}

impl<P: L1Provider> L1Traversal<P> {
    pub fn new(provider: P, cfg: Arc<RollupConfig>) -> Self {
        Self { block: None, done: false, provider, system_config: SystemConfig::default(), cfg }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn system_config(&self) -> &SystemConfig {
        &self.system_config
    }
}

#[async_trait]
impl<P: L1Provider> L1RetrievalProvider for L1Traversal<P> {
    async fn next_l1_block(&mut self) -> PipelineResult<Option<L1BlockRef>> {
        if self.done {
            return Err(PipelineError::Eof.temp());
        }
        self.done = true;
        Ok(self.block)
    }

    fn batcher_address(&self) -> Address {
        self.system_config.batcher_address
    }
}

#[async_trait]
impl<P: L1Provider> OriginAdvancer for L1Traversal<P> {
    async fn advance_origin(&mut self) -> PipelineResult<()> {
        let Some(block) = self.block else {
            warn!(target: "opcore::derive", "cannot advance origin without a current block");
            return Err(PipelineError::Eof.temp());
        };

        let next = self.provider.block_ref_by_number(block.number + 1).await?;
        if !next.is_child_of(&block) {
            return Err(ResetError::ReorgDetected { expected: block.hash, got: next.parent_hash }
                .into());
        }

        let receipts = self.provider.receipts_by_hash(next.hash).await?;
        if let Err(err) =
            self.system_config.update_from_receipts(&receipts, self.cfg.l1_system_config_address)
        {
            error!(target: "opcore::derive", %err, l1_block = next.number, "system config update failed");
            return Err(PipelineError::SystemConfig(err).crit());
        }

        debug!(target: "opcore::derive", l1_block = next.number, "advanced L1 origin");
        self.block = Some(next);
        self.done = false;
        Ok(())
    }
}

impl<P> OriginProvider for L1Traversal<P> {
    fn origin(&self) -> Option<L1BlockRef> {
        self.block
    }
}

#[async_trait]
impl<P: L1Provider> ResettableStage for L1Traversal<P> {
    async fn reset(&mut self, base: L1BlockRef, system_config: &SystemConfig) -> PipelineResult<()> {
        self.block = Some(base);
        self.done = false;
        self.system_config = system_config.clone();
        Ok(())
    }
}
