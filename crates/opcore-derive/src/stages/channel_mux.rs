//! Channel reassembly, switching from the channel bank to the assembler at Holocene.

use std::sync::Arc;

use async_trait::async_trait;
use opcore_pipeline::{ChannelAssembler, ChannelBank, RollupConfig, SystemConfig};
use opcore_types::L1BlockRef;
use tracing::info;

use crate::{
    errors::{PipelineError, PipelineResult},
    traits::{
        ChannelMuxProvider, ChannelReaderProvider, OriginAdvancer, OriginProvider,
        ResettableStage,
    },
};

#[derive(Debug)]
enum Reassembly {
    Bank(ChannelBank),
    Assembler(ChannelAssembler),
}

impl Reassembly {
    fn for_origin(cfg: &Arc<RollupConfig>, origin: &L1BlockRef) -> Self {
        if cfg.is_holocene_active(origin.timestamp) {
            Self::Assembler(ChannelAssembler::new(cfg.clone()))
        } else {
            Self::Bank(ChannelBank::new(cfg.clone()))
        }
    }
}

/// Picks the channel bank before Holocene and the single-channel assembler after.
///
/// The swap happens once, at the first origin past the activation time; channels buffered in
/// the bank at that point are discarded.
#[derive(Debug)]
pub struct ChannelMux<P> {
    prev: P,
    inner: Reassembly,
    cfg: Arc<RollupConfig>,
}

impl<P> ChannelMux<P>
where
    P: ChannelMuxProvider + OriginAdvancer + OriginProvider + ResettableStage + Send,
{
    pub fn new(prev: P, cfg: Arc<RollupConfig>) -> Self {
        Self { prev, inner: Reassembly::Bank(ChannelBank::new(cfg.clone())), cfg }
    }

    pub fn is_holocene(&self) -> bool {
        matches!(self.inner, Reassembly::Assembler(_))
    }

    fn transition(&mut self, origin: &L1BlockRef) {
        if matches!(self.inner, Reassembly::Bank(_)) && self.cfg.is_holocene_active(origin.timestamp)
        {
            info!(target: "opcore::derive", l1_block = origin.number, "activating Holocene channel assembler");
            self.inner = Reassembly::Assembler(ChannelAssembler::new(self.cfg.clone()));
        }
    }
}

#[async_trait]
impl<P> ChannelReaderProvider for ChannelMux<P>
where
    P: ChannelMuxProvider + OriginAdvancer + OriginProvider + ResettableStage + Send,
{
    async fn next_channel(&mut self) -> PipelineResult<Vec<u8>> {
        let origin = self.prev.origin().ok_or(PipelineError::MissingOrigin.crit())?;
        self.transition(&origin);

        let ready = match &mut self.inner {
            Reassembly::Bank(bank) => bank.read(&origin),
            Reassembly::Assembler(asm) => asm.read(),
        };
        if let Some(data) = ready {
            return Ok(data);
        }

        let frame = self.prev.next_frame().await?;
        match &mut self.inner {
            Reassembly::Bank(bank) => bank.ingest_frame(frame, &origin),
            Reassembly::Assembler(asm) => asm.ingest_frame(frame, &origin),
        }
        Err(PipelineError::NotEnoughData.temp())
    }
}

#[async_trait]
impl<P> OriginAdvancer for ChannelMux<P>
where
    P: ChannelMuxProvider + OriginAdvancer + OriginProvider + ResettableStage + Send,
{
    async fn advance_origin(&mut self) -> PipelineResult<()> {
        self.prev.advance_origin().await
    }
}

impl<P: OriginProvider> OriginProvider for ChannelMux<P> {
    fn origin(&self) -> Option<L1BlockRef> {
        self.prev.origin()
    }
}

#[async_trait]
impl<P> ResettableStage for ChannelMux<P>
where
    P: ChannelMuxProvider + OriginAdvancer + OriginProvider + ResettableStage + Send,
{
    async fn reset(&mut self, base: L1BlockRef, system_config: &SystemConfig) -> PipelineResult<()> {
        self.prev.reset(base, system_config).await?;
        self.inner = Reassembly::for_origin(&self.cfg, &base);
        Ok(())
    }
}
