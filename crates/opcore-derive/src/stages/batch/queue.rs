//! Pre-Holocene batch queue.

use opcore_pipeline::{Batch, BatchValidity, SingleBatch};
use opcore_stream::L2Provider;
use opcore_types::L2BlockRef;
use tracing::{debug, trace};

use super::{check_batch, BatchWindow, BatchWithInclusion};
use crate::{
    errors::{PipelineError, PipelineResult},
    traits::{BatchStreamProvider, OriginProvider},
};

/// Buffers batches read from L1 and hands them out in L2 order.
///
/// Batches may arrive before the blocks they build on; those are kept as `Future` until the safe
/// head catches up or the window moves past them.
#[derive(Debug, Default)]
pub struct BatchQueue {
    batches: Vec<BatchWithInclusion>,
}

impl BatchQueue {
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub(super) async fn next_batch<P, L2>(
        &mut self,
        window: &mut BatchWindow,
        prev: &mut P,
        l2: &L2,
        parent: &L2BlockRef,
        behind: bool,
    ) -> PipelineResult<SingleBatch>
    where
        P: BatchStreamProvider + OriginProvider + Send,
        L2: L2Provider,
    {
        let mut out_of_data = false;
        match prev.next_batch().await {
            Ok(batch) if !behind => {
                let inclusion = prev.origin().ok_or(PipelineError::MissingOrigin.crit())?;
                trace!(target: "opcore::derive", timestamp = batch.timestamp(), "queued batch");
                self.batches.push(BatchWithInclusion { inclusion, batch });
            }
            Ok(_) => {}
            Err(e) if e.is_eof() => out_of_data = true,
            Err(e) => return Err(e),
        }

        // Catching up to the safe head: batches read so far are already applied.
        if behind {
            return Err(if out_of_data {
                PipelineError::Eof.temp()
            } else {
                PipelineError::NotEnoughData.temp()
            });
        }

        match self.derive_next_batch(window, l2, parent, out_of_data).await {
            Err(e) if e.is_eof() && !out_of_data => Err(PipelineError::NotEnoughData.temp()),
            other => other,
        }
    }

    async fn derive_next_batch<L2: L2Provider>(
        &mut self,
        window: &mut BatchWindow,
        l2: &L2,
        parent: &L2BlockRef,
        out_of_data: bool,
    ) -> PipelineResult<SingleBatch> {
        window.epoch(parent)?;

        let mut accepted = None;
        let mut i = 0;
        while i < self.batches.len() {
            match check_batch(window, l2, &self.batches[i], parent).await? {
                BatchValidity::Accept => {
                    accepted = Some(self.batches.remove(i));
                    break;
                }
                BatchValidity::Drop | BatchValidity::Past => {
                    debug!(target: "opcore::derive", timestamp = self.batches[i].batch.timestamp(), "dropping batch");
                    self.batches.remove(i);
                }
                BatchValidity::Undecided => return Err(PipelineError::Eof.temp()),
                BatchValidity::Future => i += 1,
            }
        }

        match accepted {
            Some(BatchWithInclusion { batch: Batch::Single(batch), .. }) => {
                Ok(window.accept_single(batch))
            }
            Some(BatchWithInclusion { batch: Batch::Span(span), .. }) => {
                window.accept_span(&span, parent)
            }
            None => window.empty_batch(parent, out_of_data),
        }
    }
}
