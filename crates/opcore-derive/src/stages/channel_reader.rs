//! Decompresses channels and decodes the batches inside.

use std::sync::Arc;

use async_trait::async_trait;
use opcore_pipeline::{Batch, BatchReader, RollupConfig, SystemConfig};
use opcore_types::L1BlockRef;
use tracing::{debug, warn};

use crate::{
    errors::{PipelineError, PipelineResult},
    traits::{
        BatchStreamProvider, ChannelReaderProvider, OriginAdvancer, OriginProvider,
        ResettableStage,
    },
};

#[derive(Debug)]
pub struct ChannelReader<P> {
    prev: P,
    reader: Option<BatchReader>,
    cfg: Arc<RollupConfig>,
}

impl<P> ChannelReader<P>
where
    P: ChannelReaderProvider + OriginAdvancer + OriginProvider + ResettableStage + Send,
{
    pub fn new(prev: P, cfg: Arc<RollupConfig>) -> Self {
        Self { prev, reader: None, cfg }
    }

    async fn set_reader(&mut self) -> PipelineResult<()> {
        if self.reader.is_some() {
            return Ok(());
        }
        let data = self.prev.next_channel().await?;
        let origin = self.prev.origin().ok_or(PipelineError::MissingOrigin.crit())?;
        let max = self.cfg.max_rlp_bytes_per_channel(origin.timestamp) as usize;
        let mut reader = BatchReader::new(data, max);
        if let Err(err) = reader.decompress(self.cfg.is_fjord_active(origin.timestamp)) {
            warn!(target: "opcore::derive", %err, "dropping channel that failed to decompress");
            return Err(PipelineError::NotEnoughData.temp());
        }
        self.reader = Some(reader);
        Ok(())
    }
}

#[async_trait]
impl<P> BatchStreamProvider for ChannelReader<P>
where
    P: ChannelReaderProvider + OriginAdvancer + OriginProvider + ResettableStage + Send,
{
    async fn next_batch(&mut self) -> PipelineResult<Batch> {
        self.set_reader().await?;
        let Some(reader) = self.reader.as_mut() else {
            return Err(PipelineError::NotEnoughData.temp());
        };

        match reader.next_batch(&self.cfg) {
            Some(Ok(batch)) => Ok(batch),
            Some(Err(err)) => {
                warn!(target: "opcore::derive", %err, "dropping rest of channel after undecodable batch");
                self.reader = None;
                Err(PipelineError::NotEnoughData.temp())
            }
            None => {
                self.reader = None;
                Err(PipelineError::NotEnoughData.temp())
            }
        }
    }

    fn flush(&mut self) {
        debug!(target: "opcore::derive", "flushing channel");
        self.reader = None;
    }
}

#[async_trait]
impl<P> OriginAdvancer for ChannelReader<P>
where
    P: ChannelReaderProvider + OriginAdvancer + OriginProvider + ResettableStage + Send,
{
    async fn advance_origin(&mut self) -> PipelineResult<()> {
        self.prev.advance_origin().await
    }
}

impl<P: OriginProvider> OriginProvider for ChannelReader<P> {
    fn origin(&self) -> Option<L1BlockRef> {
        self.prev.origin()
    }
}

#[async_trait]
impl<P> ResettableStage for ChannelReader<P>
where
    P: ChannelReaderProvider + OriginAdvancer + OriginProvider + ResettableStage + Send,
{
    async fn reset(&mut self, base: L1BlockRef, system_config: &SystemConfig) -> PipelineResult<()> {
        self.prev.reset(base, system_config).await?;
        self.reader = None;
        Ok(())
    }
}
