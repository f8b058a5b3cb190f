//! Derivation driver: steps the pipeline, feeds the engine, handles resets.

use std::{sync::Arc, time::Duration};

use bon::Builder;
use opcore_pipeline::RollupConfig;
use opcore_stream::{BlobProvider, EngineApi, HeadTracker, L1Provider, L2Provider, ReorgDetector};
use opcore_types::L2BlockRef;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    engine::{EngineController, EngineError},
    errors::{PipelineError, PipelineErrorKind},
    pipeline::{DerivationPipeline, StepResult},
    reset::{find_reset_origin, system_config_from_l2_block},
    traits::OriginProvider,
};

#[derive(Debug, Clone, Builder)]
pub struct DriverConfig {
    /// Wait between steps once L1 has nothing new.
    #[builder(default = Duration::from_secs(2))]
    pub poll_interval: Duration,
    /// L1 blocks after which a batch's inclusion block is final.
    #[builder(default = 64)]
    pub finality_depth: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("derivation halted: {0}")]
    Pipeline(#[from] PipelineErrorKind),
    #[error("engine halted: {0}")]
    Engine(#[from] EngineError),
}

/// What a single [`Driver::tick`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// A block was derived and is now the safe head.
    Derived(L2BlockRef),
    /// The pipeline made progress without producing a block.
    Stepped,
    /// Nothing to do until L1 extends, or a transient failure.
    Idle,
    /// The pipeline was reset.
    Reset,
}

pub struct Driver<L1, B, L2, E>
where
    L1: L1Provider + Clone,
    B: BlobProvider,
    L2: L2Provider + Clone,
    E: EngineApi,
{
    pipeline: DerivationPipeline<L1, B, L2>,
    engine: EngineController<E, L2>,
    l1: L1,
    l2: L2,
    cfg: Arc<RollupConfig>,
    config: DriverConfig,
    heads: HeadTracker,
    reorgs: ReorgDetector,
    needs_reset: bool,
}

impl<L1, B, L2, E> std::fmt::Debug for Driver<L1, B, L2, E>
where
    L1: L1Provider + Clone,
    B: BlobProvider,
    L2: L2Provider + Clone,
    E: EngineApi,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("pipeline", &self.pipeline)
            .field("heads", self.engine.heads())
            .field("needs_reset", &self.needs_reset)
            .finish_non_exhaustive()
    }
}

impl<L1, B, L2, E> Driver<L1, B, L2, E>
where
    L1: L1Provider + Clone,
    B: BlobProvider,
    L2: L2Provider + Clone,
    E: EngineApi,
{
    /// The driver starts with a reset, which locates the L1 block to derive from.
    pub fn new(
        cfg: Arc<RollupConfig>,
        config: DriverConfig,
        l1: L1,
        blobs: B,
        l2: L2,
        engine: EngineController<E, L2>,
    ) -> Self {
        let pipeline = DerivationPipeline::new(cfg.clone(), l1.clone(), blobs, l2.clone());
        let heads = HeadTracker::new(config.finality_depth);
        // Anything deeper than the finality depth cannot reorg.
        let reorgs = ReorgDetector::new(config.finality_depth as usize);
        Self { pipeline, engine, l1, l2, cfg, config, heads, reorgs, needs_reset: true }
    }

    pub fn engine(&self) -> &EngineController<E, L2> {
        &self.engine
    }

    pub fn pipeline(&self) -> &DerivationPipeline<L1, B, L2> {
        &self.pipeline
    }

    /// The next tick resets the pipeline.
    pub const fn needs_reset(&self) -> bool {
        self.needs_reset
    }

    async fn reset(&mut self) -> Result<(), DriverError> {
        let safe = self.engine.heads().safe_head;
        let target = find_reset_origin(&self.l1, &self.l2, &self.cfg, &safe).await?;
        let block = self
            .l2
            .block_by_number(Some(target.safe_head.number))
            .await
            .map_err(PipelineErrorKind::from)?;
        let system_config = system_config_from_l2_block(&block, &self.cfg)?;

        self.pipeline.reset(&target.safe_head, target.l1_origin, &system_config).await?;
        self.engine.rewind_safe(target.safe_head);
        self.heads.handle_reorg(target.l1_origin.number);
        self.needs_reset = false;
        info!(
            target: "opcore::derive",
            safe_head = target.safe_head.number,
            l1_origin = target.l1_origin.number,
            "derivation reset"
        );
        Ok(())
    }

    /// One unit of work. Only critical errors are returned.
    pub async fn tick(&mut self) -> Result<Tick, DriverError> {
        if self.needs_reset {
            return match self.reset().await {
                Ok(()) => Ok(Tick::Reset),
                Err(DriverError::Pipeline(PipelineErrorKind::Critical(err))) => {
                    Err(PipelineErrorKind::Critical(err).into())
                }
                Err(err) => {
                    warn!(target: "opcore::derive", %err, "reset failed, retrying");
                    Ok(Tick::Idle)
                }
            };
        }

        let cursor = self.engine.heads().safe_head;
        let err = match self.pipeline.step(&cursor).await {
            StepResult::PreparedAttributes => return self.apply_prepared().await,
            StepResult::AdvancedOrigin => return Ok(Tick::Stepped),
            StepResult::OriginAdvanceErr(err) | StepResult::StepFailed(err) => err,
        };

        match err {
            PipelineErrorKind::Temporary(PipelineError::NotEnoughData) => Ok(Tick::Stepped),
            PipelineErrorKind::Temporary(PipelineError::Eof) => Ok(Tick::Idle),
            PipelineErrorKind::Temporary(err) => {
                debug!(target: "opcore::derive", %err, "temporary derivation error");
                Ok(Tick::Idle)
            }
            PipelineErrorKind::Reset(err) => {
                warn!(target: "opcore::derive", %err, "pipeline reset required");
                self.needs_reset = true;
                Ok(Tick::Reset)
            }
            critical @ PipelineErrorKind::Critical(_) => {
                error!(target: "opcore::derive", err = %critical, "critical derivation error");
                Err(critical.into())
            }
        }
    }

    async fn apply_prepared(&mut self) -> Result<Tick, DriverError> {
        let Some(attrs) = self.pipeline.next() else {
            return Ok(Tick::Stepped);
        };
        match self.engine.process_attributes(&attrs).await {
            Ok(block) => {
                if let Some(inclusion) = attrs.derived_from {
                    self.heads.add_safe(&block, inclusion.number);
                }
                Ok(Tick::Derived(block))
            }
            Err(EngineError::Api(err)) => {
                warn!(target: "opcore::derive", %err, "engine unavailable, re-deriving");
                self.needs_reset = true;
                Ok(Tick::Idle)
            }
            Err(err @ (EngineError::InvalidPayload(_) | EngineError::NotAncestor { .. })) => {
                warn!(target: "opcore::derive", %err, "derived block not accepted, resetting");
                self.needs_reset = true;
                Ok(Tick::Reset)
            }
            Err(EngineError::MissingPayloadId) => {
                self.needs_reset = true;
                Ok(Tick::Idle)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Walk L1 up to its head checking parent hashes. A reorg drops the safe blocks derived from
    /// invalidated L1 blocks from finality tracking, and resets derivation when it reaches the
    /// current origin. Returns the L1 head.
    pub async fn follow_l1(&mut self) -> Result<u64, DriverError> {
        let head = self.l1.head_number().await.map_err(PipelineErrorKind::from)?;
        let from = match self.reorgs.latest_block() {
            Some(latest) if latest < head && head - latest <= self.config.finality_depth => latest + 1,
            _ => head,
        };
        for number in from..=head {
            let block = self.l1.block_ref_by_number(number).await.map_err(PipelineErrorKind::from)?;
            let Some(event) = self.reorgs.process_block(&block) else { continue };
            self.heads.handle_reorg(event.first_invalid);
            if self.pipeline.origin().is_some_and(|origin| origin.number >= event.first_invalid) {
                warn!(
                    target: "opcore::derive",
                    first_invalid = event.first_invalid,
                    depth = event.depth,
                    "L1 reorg invalidated the derivation origin"
                );
                self.needs_reset = true;
            }
        }
        Ok(head)
    }

    /// Finalize safe blocks whose L1 inclusion is past the finality depth.
    async fn update_finality(&mut self, l1_head: u64) -> Result<(), DriverError> {
        let finalized = self.heads.update_l1_head(l1_head).finalized_head;
        if finalized.number <= self.engine.heads().finalized_head.number {
            return Ok(());
        }
        let block =
            self.l2.block_ref_by_number(Some(finalized.number)).await.map_err(PipelineErrorKind::from)?;
        if block.hash == finalized.hash {
            self.engine.promote_finalized(block).await?;
        }
        Ok(())
    }

    /// Drive derivation until cancelled or a critical error.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), DriverError> {
        info!(target: "opcore::derive", "derivation driver started");
        loop {
            if cancel.is_cancelled() {
                info!(target: "opcore::derive", "derivation driver stopped");
                return Ok(());
            }

            match self.tick().await? {
                Tick::Derived(_) | Tick::Stepped | Tick::Reset => continue,
                Tick::Idle => {
                    let followed = match self.follow_l1().await {
                        Ok(head) => self.update_finality(head).await,
                        Err(err) => Err(err),
                    };
                    if let Err(err) = followed {
                        debug!(target: "opcore::derive", %err, "L1 head update failed");
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }
    }
}
