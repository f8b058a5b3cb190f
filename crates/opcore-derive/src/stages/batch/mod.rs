//! Batch ordering and validation.
//!
//! [`BatchMux`] runs the pre-Holocene [`BatchQueue`] (buffers batches until they can be ordered)
//! and switches to the Holocene [`BatchStage`] (strict order, drop on first invalid batch) at the
//! first origin past the activation time. Both share a [`BatchWindow`]: the L1 blocks from the
//! safe head's epoch up to the current origin, the singular batches of an accepted span batch,
//! and empty-batch generation once a sequencing window expires.

mod queue;
mod validator;

pub use queue::BatchQueue;
pub use validator::BatchStage;

use std::{collections::VecDeque, sync::Arc};

use async_trait::async_trait;
use opcore_pipeline::{Batch, BatchValidity, RollupConfig, SingleBatch, SpanBatch, SystemConfig};
use opcore_stream::L2Provider;
use opcore_types::{L1BlockRef, L2BlockRef};
use tracing::{debug, info, warn};

use crate::{
    errors::{PipelineError, PipelineResult, ResetError},
    traits::{
        AttributesProvider, BatchStreamProvider, OriginAdvancer, OriginProvider, ResettableStage,
    },
};

/// A batch together with the L1 block it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchWithInclusion {
    pub inclusion: L1BlockRef,
    pub batch: Batch,
}

/// State shared by the queue and the stage.
#[derive(Debug)]
pub struct BatchWindow {
    cfg: Arc<RollupConfig>,
    origin: Option<L1BlockRef>,
    l1_blocks: Vec<L1BlockRef>,
    spans: VecDeque<SingleBatch>,
    last_in_span: bool,
}

impl BatchWindow {
    fn new(cfg: Arc<RollupConfig>) -> Self {
        Self { cfg, origin: None, l1_blocks: Vec::new(), spans: VecDeque::new(), last_in_span: true }
    }

    fn clear(&mut self) {
        self.l1_blocks.clear();
        self.spans.clear();
        self.last_in_span = true;
    }

    pub fn l1_blocks(&self) -> &[L1BlockRef] {
        &self.l1_blocks
    }

    /// Next buffered block of an accepted span batch, linked to `parent`.
    fn pop_span(&mut self, parent: &L2BlockRef) -> Option<SingleBatch> {
        let next = self.spans.front()?;
        if next.timestamp != parent.timestamp + self.cfg.block_time {
            warn!(
                target: "opcore::derive",
                expected = parent.timestamp + self.cfg.block_time,
                got = next.timestamp,
                "span batch no longer follows the safe head, dropping its remaining blocks"
            );
            self.spans.clear();
            return None;
        }
        let mut batch = self.spans.pop_front()?;
        batch.parent_hash = parent.hash;
        self.last_in_span = self.spans.is_empty();
        Some(batch)
    }

    /// Track the origin and trim the window to the parent's epoch.
    ///
    /// Returns true while the origin is still behind the parent's L1 origin, which happens right
    /// after a reset.
    fn update_origin(&mut self, origin: L1BlockRef, parent: &L2BlockRef) -> bool {
        let behind = origin.number < parent.l1_origin.number;

        if self.l1_blocks.first().is_some_and(|first| parent.l1_origin.number > first.number) {
            match self.l1_blocks.iter().position(|b| b.number == parent.l1_origin.number) {
                Some(i) => {
                    self.l1_blocks.drain(..i);
                }
                None => self.l1_blocks.clear(),
            }
        }

        if self.origin != Some(origin) {
            self.origin = Some(origin);
            if behind {
                self.l1_blocks.clear();
            } else if self.l1_blocks.last() != Some(&origin) {
                self.l1_blocks.push(origin);
                debug!(target: "opcore::derive", l1_block = origin.number, "batch window extended");
            }
        }
        behind
    }

    /// The epoch the next block builds on, checked against the parent.
    fn epoch(&self, parent: &L2BlockRef) -> PipelineResult<L1BlockRef> {
        let epoch = *self
            .l1_blocks
            .first()
            .ok_or(PipelineError::MissingL1Block(parent.l1_origin.number).crit())?;
        // The window may already have moved one epoch ahead of the parent after generating
        // every empty batch of the parent's epoch.
        if parent.l1_origin != epoch.id() && parent.l1_origin.number + 1 != epoch.number {
            return Err(ResetError::OriginMismatch {
                parent: parent.l1_origin.number,
                origin: epoch.number,
            }
            .into());
        }
        Ok(epoch)
    }

    /// Empty batch once the sequencing window of the current epoch has run out.
    ///
    /// Only called when the upstream has no more batches for the current origin.
    fn empty_batch(&mut self, parent: &L2BlockRef, out_of_data: bool) -> PipelineResult<SingleBatch> {
        let epoch = self.epoch(parent)?;
        let origin = self.origin.ok_or(PipelineError::MissingOrigin.crit())?;
        let next_timestamp = parent.timestamp + self.cfg.block_time;

        let expiry = epoch.number + self.cfg.seq_window_size;
        let force = (expiry == origin.number && out_of_data) || expiry < origin.number;
        if !force || self.l1_blocks.len() < 2 {
            return Err(PipelineError::Eof.temp());
        }

        let first_of_epoch = epoch.number == parent.l1_origin.number + 1;
        let next_epoch = self.l1_blocks[1];
        if next_timestamp < next_epoch.timestamp || first_of_epoch {
            info!(target: "opcore::derive", epoch = epoch.number, timestamp = next_timestamp, "generating empty batch");
            self.last_in_span = true;
            return Ok(SingleBatch {
                parent_hash: parent.hash,
                epoch_num: epoch.number,
                epoch_hash: epoch.hash,
                timestamp: next_timestamp,
                transactions: Vec::new(),
            });
        }

        // Every empty batch of this epoch has been generated.
        self.l1_blocks.remove(0);
        Err(PipelineError::Eof.temp())
    }

    /// Queue the blocks of an accepted span batch and return the first one.
    fn accept_span(&mut self, span: &SpanBatch, parent: &L2BlockRef) -> PipelineResult<SingleBatch> {
        self.spans = span.to_singles(&self.l1_blocks, parent).into();
        self.pop_span(parent).ok_or(PipelineError::NotEnoughData.temp())
    }

    fn accept_single(&mut self, batch: SingleBatch) -> SingleBatch {
        self.last_in_span = true;
        batch
    }
}

/// Check a batch against the window. Span batches that overlap the safe chain are checked
/// against the L2 block they actually build on.
async fn check_batch<L2: L2Provider>(
    window: &BatchWindow,
    l2: &L2,
    candidate: &BatchWithInclusion,
    parent: &L2BlockRef,
) -> PipelineResult<BatchValidity> {
    let cfg = &window.cfg;
    match &candidate.batch {
        Batch::Single(b) => Ok(b.check_batch(cfg, &window.l1_blocks, parent, &candidate.inclusion)),
        Batch::Span(span) => {
            let next_timestamp = parent.timestamp + cfg.block_time;
            let start = span.starting_timestamp();
            let span_parent = if start < next_timestamp {
                let behind = (next_timestamp - start) / cfg.block_time;
                match parent.number.checked_sub(behind) {
                    Some(number) => l2.block_ref_by_number(Some(number)).await?,
                    None => return Ok(BatchValidity::Drop),
                }
            } else {
                *parent
            };
            Ok(span.check_batch(cfg, &window.l1_blocks, parent, &span_parent, &candidate.inclusion))
        }
    }
}

#[derive(Debug)]
enum Mode {
    Queue(BatchQueue),
    Stage(BatchStage),
}

/// Chooses between [`BatchQueue`] and [`BatchStage`] by the origin's timestamp.
#[derive(Debug)]
pub struct BatchMux<P, L2> {
    prev: P,
    l2: L2,
    window: BatchWindow,
    mode: Mode,
}

impl<P, L2> BatchMux<P, L2>
where
    P: BatchStreamProvider + OriginAdvancer + OriginProvider + ResettableStage + Send,
    L2: L2Provider,
{
    pub fn new(prev: P, l2: L2, cfg: Arc<RollupConfig>) -> Self {
        Self { prev, l2, window: BatchWindow::new(cfg), mode: Mode::Queue(BatchQueue::default()) }
    }

    pub fn is_holocene(&self) -> bool {
        matches!(self.mode, Mode::Stage(_))
    }

    pub fn window(&self) -> &BatchWindow {
        &self.window
    }

    fn transition(&mut self, origin: &L1BlockRef) {
        if matches!(self.mode, Mode::Queue(_)) && self.window.cfg.is_holocene_active(origin.timestamp)
        {
            info!(target: "opcore::derive", l1_block = origin.number, "activating Holocene batch stage");
            self.mode = Mode::Stage(BatchStage::default());
        }
    }
}

#[async_trait]
impl<P, L2> AttributesProvider for BatchMux<P, L2>
where
    P: BatchStreamProvider + OriginAdvancer + OriginProvider + ResettableStage + Send,
    L2: L2Provider,
{
    async fn next_batch(&mut self, parent: &L2BlockRef) -> PipelineResult<SingleBatch> {
        if let Some(batch) = self.window.pop_span(parent) {
            return Ok(batch);
        }

        let origin = self.prev.origin().ok_or(PipelineError::MissingOrigin.crit())?;
        self.transition(&origin);
        let behind = self.window.update_origin(origin, parent);

        match &mut self.mode {
            Mode::Queue(queue) => {
                queue.next_batch(&mut self.window, &mut self.prev, &self.l2, parent, behind).await
            }
            Mode::Stage(stage) => {
                stage.next_batch(&mut self.window, &mut self.prev, &self.l2, parent, behind).await
            }
        }
    }

    fn is_last_in_span(&self) -> bool {
        self.window.last_in_span
    }
}

#[async_trait]
impl<P, L2> OriginAdvancer for BatchMux<P, L2>
where
    P: BatchStreamProvider + OriginAdvancer + OriginProvider + ResettableStage + Send,
    L2: L2Provider,
{
    async fn advance_origin(&mut self) -> PipelineResult<()> {
        self.prev.advance_origin().await
    }
}

impl<P: OriginProvider, L2> OriginProvider for BatchMux<P, L2> {
    fn origin(&self) -> Option<L1BlockRef> {
        self.prev.origin()
    }
}

#[async_trait]
impl<P, L2> ResettableStage for BatchMux<P, L2>
where
    P: BatchStreamProvider + OriginAdvancer + OriginProvider + ResettableStage + Send,
    L2: L2Provider,
{
    async fn reset(&mut self, base: L1BlockRef, system_config: &SystemConfig) -> PipelineResult<()> {
        self.prev.reset(base, system_config).await?;
        self.window.clear();
        self.window.origin = Some(base);
        self.window.l1_blocks.push(base);
        self.mode = if self.window.cfg.is_holocene_active(base.timestamp) {
            Mode::Stage(BatchStage::default())
        } else {
            Mode::Queue(BatchQueue::default())
        };
        Ok(())
    }
}
