//! Turns ordered batches into payload attributes.

use async_trait::async_trait;
use opcore_pipeline::{with_batch_transactions, AttributesBuilder, SingleBatch, SystemConfig};
use opcore_stream::L1Provider;
use opcore_types::{L1BlockRef, L2BlockRef, PayloadAttributes};
use tracing::debug;

use crate::{
    errors::{PipelineError, PipelineResult},
    traits::{AttributesProvider, OriginAdvancer, OriginProvider, ResettableStage},
};

/// Payload attributes of the block following `parent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributesWithParent {
    pub attributes: PayloadAttributes,
    pub parent: L2BlockRef,
    /// L1 block the batch was derived from.
    pub derived_from: Option<L1BlockRef>,
    pub is_last_in_span: bool,
}

impl AttributesWithParent {
    pub fn timestamp(&self) -> u64 {
        self.attributes.timestamp
    }

    /// The same block with only its deposit transactions.
    pub fn deposits_only(&self) -> Self {
        let mut out = self.clone();
        if let Some(txs) = out.attributes.transactions.as_mut() {
            txs.retain(|tx| tx.first() == Some(&opcore_pipeline::DEPOSIT_TX_TYPE));
        }
        out
    }
}

/// Top stage of the pipeline.
///
/// Keeps its own copy of the system config in step with the safe chain: config updates are
/// replayed when a batch moves to a new epoch.
#[derive(Debug)]
pub struct AttributesQueue<P, L1> {
    prev: P,
    l1: L1,
    builder: AttributesBuilder,
    system_config: SystemConfig,
    batch: Option<SingleBatch>,
    is_last_in_span: bool,
}

impl<P, L1> AttributesQueue<P, L1>
where
    P: AttributesProvider + OriginAdvancer + OriginProvider + ResettableStage + Send,
    L1: L1Provider,
{
    pub fn new(prev: P, l1: L1, builder: AttributesBuilder) -> Self {
        Self {
            prev,
            l1,
            builder,
            system_config: SystemConfig::default(),
            batch: None,
            is_last_in_span: false,
        }
    }

    pub fn system_config(&self) -> &SystemConfig {
        &self.system_config
    }

    /// Attributes for the next block on top of `parent`.
    pub async fn next_attributes(
        &mut self,
        parent: &L2BlockRef,
    ) -> PipelineResult<AttributesWithParent> {
        if self.batch.is_none() {
            self.batch = Some(self.prev.next_batch(parent).await?);
            self.is_last_in_span = self.prev.is_last_in_span();
        }
        let Some(batch) = self.batch.as_ref() else {
            return Err(PipelineError::NotEnoughData.temp());
        };

        let attributes = self.create_attributes(batch.clone(), parent).await;
        // A failed batch is not retried: the error decides between a retry of the step (which
        // pulls a fresh batch) and a reset.
        let batch = self.batch.take();
        let attributes = attributes?;

        debug!(
            target: "opcore::derive",
            l2_timestamp = attributes.timestamp,
            epoch = batch.as_ref().map(|b| b.epoch_num),
            txs = attributes.txs().len(),
            "derived attributes"
        );
        Ok(AttributesWithParent {
            attributes,
            parent: *parent,
            derived_from: self.prev.origin(),
            is_last_in_span: self.is_last_in_span,
        })
    }

    async fn create_attributes(
        &mut self,
        batch: SingleBatch,
        parent: &L2BlockRef,
    ) -> PipelineResult<PayloadAttributes> {
        if batch.timestamp != parent.timestamp + self.builder.config().block_time {
            return Err(PipelineError::NotEnoughData.temp());
        }

        let (header, _) = self.l1.block_info_and_txs_by_hash(batch.epoch_hash).await?;
        let receipts = if batch.epoch_num != parent.l1_origin.number {
            Some(self.l1.receipts_by_hash(batch.epoch_hash).await?)
        } else {
            None
        };

        let attrs = self.builder.prepare(
            &mut self.system_config,
            parent,
            &header,
            receipts.as_deref().map(Vec::as_slice),
        )?;
        Ok(with_batch_transactions(attrs, batch.transactions))
    }
}

#[async_trait]
impl<P, L1> OriginAdvancer for AttributesQueue<P, L1>
where
    P: AttributesProvider + OriginAdvancer + OriginProvider + ResettableStage + Send,
    L1: L1Provider,
{
    async fn advance_origin(&mut self) -> PipelineResult<()> {
        self.prev.advance_origin().await
    }
}

impl<P: OriginProvider, L1> OriginProvider for AttributesQueue<P, L1> {
    fn origin(&self) -> Option<L1BlockRef> {
        self.prev.origin()
    }
}

#[async_trait]
impl<P, L1> ResettableStage for AttributesQueue<P, L1>
where
    P: AttributesProvider + OriginAdvancer + OriginProvider + ResettableStage + Send,
    L1: L1Provider,
{
    async fn reset(&mut self, base: L1BlockRef, system_config: &SystemConfig) -> PipelineResult<()> {
        self.prev.reset(base, system_config).await?;
        self.system_config = system_config.clone();
        self.batch = None;
        self.is_last_in_span = false;
        Ok(())
    }
}
