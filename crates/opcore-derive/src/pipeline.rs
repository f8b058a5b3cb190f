//! The assembled derivation pipeline.

use std::{collections::VecDeque, fmt, sync::Arc};

use opcore_pipeline::{AttributesBuilder, RollupConfig, SystemConfig};
use opcore_stream::{BlobProvider, L1Provider, L2Provider};
use opcore_types::{L1BlockRef, L2BlockRef};
use tracing::{debug, trace, warn};

use crate::{
    errors::{PipelineErrorKind, PipelineResult},
    stages::{
        AttributesQueue, AttributesWithParent, BatchMux, ChannelMux, ChannelReader,
        EthereumDataSource, FrameQueue, L1Retrieval, L1Traversal,
    },
    traits::{OriginAdvancer, OriginProvider, ResettableStage},
};

pub type TraversalStage<L1> = L1Traversal<L1>;
pub type RetrievalStage<L1, B> = L1Retrieval<TraversalStage<L1>, L1, B>;
pub type FrameQueueStage<L1, B> = FrameQueue<RetrievalStage<L1, B>>;
pub type ChannelMuxStage<L1, B> = ChannelMux<FrameQueueStage<L1, B>>;
pub type ChannelReaderStage<L1, B> = ChannelReader<ChannelMuxStage<L1, B>>;
pub type BatchMuxStage<L1, B, L2> = BatchMux<ChannelReaderStage<L1, B>, L2>;
pub type AttributesQueueStage<L1, B, L2> = AttributesQueue<BatchMuxStage<L1, B, L2>, L1>;

/// Outcome of a single [`DerivationPipeline::step`].
#[derive(Debug)]
pub enum StepResult {
    /// Attributes were derived and queued; take them through the [`Iterator`] impl.
    PreparedAttributes,
    /// The current origin was exhausted and the pipeline moved to the next L1 block.
    AdvancedOrigin,
    OriginAdvanceErr(PipelineErrorKind),
    StepFailed(PipelineErrorKind),
}

/// Pull-based pipeline from L1 blocks to L2 payload attributes.
///
/// Driven by a single task: each [`step`](Self::step) pulls once through the whole stack with the
/// current safe head as cursor.
pub struct DerivationPipeline<L1, B, L2>
where
    L1: L1Provider + Clone,
    B: BlobProvider,
    L2: L2Provider,
{
    attributes: AttributesQueueStage<L1, B, L2>,
    prepared: VecDeque<AttributesWithParent>,
    cfg: Arc<RollupConfig>,
}

impl<L1, B, L2> fmt::Debug for DerivationPipeline<L1, B, L2>
where
    L1: L1Provider + Clone,
    B: BlobProvider,
    L2: L2Provider,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivationPipeline")
            .field("origin", &self.origin())
            .field("prepared", &self.prepared.len())
            .finish_non_exhaustive()
    }
}

impl<L1, B, L2> DerivationPipeline<L1, B, L2>
where
    L1: L1Provider + Clone,
    B: BlobProvider,
    L2: L2Provider,
{
    /// Assemble the stage stack. The pipeline has no origin until [`reset`](Self::reset).
    pub fn new(cfg: Arc<RollupConfig>, l1: L1, blobs: B, l2: L2) -> Self {
        let traversal = L1Traversal::new(l1.clone(), cfg.clone());
        let source = EthereumDataSource::new(l1.clone(), blobs, cfg.clone());
        let retrieval = L1Retrieval::new(traversal, source);
        let frames = FrameQueue::new(retrieval);
        let channels = ChannelMux::new(frames, cfg.clone());
        let reader = ChannelReader::new(channels, cfg.clone());
        let batches = BatchMux::new(reader, l2, cfg.clone());
        let attributes = AttributesQueue::new(batches, l1, AttributesBuilder::new(cfg.clone()));
        Self { attributes, prepared: VecDeque::new(), cfg }
    }

    pub fn rollup_config(&self) -> &RollupConfig {
        &self.cfg
    }

    /// System config as of the last derived block.
    pub fn system_config(&self) -> &SystemConfig {
        self.attributes.system_config()
    }

    /// Derived attributes not yet taken.
    pub fn peek(&self) -> Option<&AttributesWithParent> {
        self.prepared.front()
    }

    /// Pull once through the pipeline, deriving on top of `cursor`.
    pub async fn step(&mut self, cursor: &L2BlockRef) -> StepResult {
        match self.attributes.next_attributes(cursor).await {
            Ok(attrs) => {
                trace!(target: "opcore::derive", timestamp = attrs.timestamp(), "prepared attributes");
                self.prepared.push_back(attrs);
                StepResult::PreparedAttributes
            }
            Err(err) if err.is_eof() => {
                trace!(target: "opcore::derive", "origin exhausted, advancing");
                match self.attributes.advance_origin().await {
                    Ok(()) => StepResult::AdvancedOrigin,
                    Err(err) => StepResult::OriginAdvanceErr(err),
                }
            }
            Err(err) => {
                if !err.is_not_enough_data() {
                    warn!(target: "opcore::derive", %err, "derivation step failed");
                }
                StepResult::StepFailed(err)
            }
        }
    }

    /// Step until the next attributes on top of `cursor` are ready.
    ///
    /// Returns the `Eof` error when L1 has nothing more to offer, and any error other than
    /// `NotEnoughData` as is.
    pub async fn produce(&mut self, cursor: &L2BlockRef) -> PipelineResult<AttributesWithParent> {
        loop {
            if let Some(attrs) = self.next() {
                return Ok(attrs);
            }
            match self.step(cursor).await {
                StepResult::PreparedAttributes | StepResult::AdvancedOrigin => {}
                StepResult::OriginAdvanceErr(err) => return Err(err),
                StepResult::StepFailed(err) if err.is_not_enough_data() => {}
                StepResult::StepFailed(err) => return Err(err),
            }
        }
    }

    /// Restart derivation from `l1_origin` with the system config as of `l2_safe_head`.
    pub async fn reset(
        &mut self,
        l2_safe_head: &L2BlockRef,
        l1_origin: L1BlockRef,
        system_config: &SystemConfig,
    ) -> PipelineResult<()> {
        debug!(
            target: "opcore::derive",
            l2_safe_head = l2_safe_head.number,
            l1_origin = l1_origin.number,
            "resetting pipeline"
        );
        self.prepared.clear();
        self.attributes.reset(l1_origin, system_config).await
    }
}

impl<L1, B, L2> Iterator for DerivationPipeline<L1, B, L2>
where
    L1: L1Provider + Clone,
    B: BlobProvider,
    L2: L2Provider,
{
    type Item = AttributesWithParent;

    /// Take the oldest derived attributes.
    fn next(&mut self) -> Option<Self::Item> {
        self.prepared.pop_front()
    }
}

impl<L1, B, L2> OriginProvider for DerivationPipeline<L1, B, L2>
where
    L1: L1Provider + Clone,
    B: BlobProvider,
    L2: L2Provider,
{
    fn origin(&self) -> Option<L1BlockRef> {
        self.attributes.origin()
    }
}
