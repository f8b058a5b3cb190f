//! Holocene batch stage: batches must arrive in order, invalid ones flush their channel.

use opcore_pipeline::{Batch, BatchValidity, SingleBatch};
use opcore_stream::L2Provider;
use opcore_types::L2BlockRef;
use tracing::{debug, warn};

use super::{check_batch, BatchWindow, BatchWithInclusion};
use crate::{
    errors::{PipelineError, PipelineResult},
    traits::{BatchStreamProvider, OriginProvider},
};

#[derive(Debug, Default)]
pub struct BatchStage {
    /// A batch that needs more L1 blocks before it can be judged.
    pending: Option<BatchWithInclusion>,
}

impl BatchStage {
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
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
        if behind {
            self.pending = None;
            return match prev.next_batch().await {
                Ok(_) => Err(PipelineError::NotEnoughData.temp()),
                Err(e) => Err(e),
            };
        }

        let candidate = match self.pending.take() {
            Some(pending) => pending,
            None => match prev.next_batch().await {
                Ok(batch) => {
                    let inclusion = prev.origin().ok_or(PipelineError::MissingOrigin.crit())?;
                    BatchWithInclusion { inclusion, batch }
                }
                Err(e) if e.is_eof() => return window.empty_batch(parent, true),
                Err(e) => return Err(e),
            },
        };

        window.epoch(parent)?;
        match check_batch(window, l2, &candidate, parent).await? {
            BatchValidity::Accept => match candidate.batch {
                Batch::Single(batch) => Ok(window.accept_single(batch)),
                Batch::Span(span) => window.accept_span(&span, parent),
            },
            BatchValidity::Past => {
                debug!(target: "opcore::derive", timestamp = candidate.batch.timestamp(), "skipping past batch");
                Err(PipelineError::NotEnoughData.temp())
            }
            BatchValidity::Undecided => {
                self.pending = Some(candidate);
                Err(PipelineError::Eof.temp())
            }
            BatchValidity::Drop | BatchValidity::Future => {
                warn!(
                    target: "opcore::derive",
                    timestamp = candidate.batch.timestamp(),
                    "invalid batch, flushing channel"
                );
                prev.flush();
                Err(PipelineError::NotEnoughData.temp())
            }
        }
    }
}
