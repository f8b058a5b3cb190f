//! Splits batcher payloads into frames.

use std::collections::VecDeque;

use async_trait::async_trait;
use opcore_pipeline::{decode_frames, Frame, SystemConfig};
use opcore_types::L1BlockRef;
use tracing::warn;

use crate::{
    errors::{PipelineError, PipelineResult},
    traits::{
        ChannelMuxProvider, FrameQueueProvider, OriginAdvancer, OriginProvider, ResettableStage,
    },
};

#[derive(Debug)]
pub struct FrameQueue<P> {
    prev: P,
    queue: VecDeque<Frame>,
}

impl<P> FrameQueue<P>
where
    P: FrameQueueProvider + OriginAdvancer + OriginProvider + ResettableStage + Send,
{
    pub fn new(prev: P) -> Self {
        Self { prev, queue: VecDeque::new() }
    }

    pub fn prev(&self) -> &P {
        &self.prev
    }

    /// Pull one payload and queue its frames. A malformed payload is dropped whole.
    async fn load_frames(&mut self) -> PipelineResult<()> {
        if !self.queue.is_empty() {
            return Ok(());
        }
        let data = self.prev.next_data().await?;
        match decode_frames(&data) {
            Ok(frames) => self.queue.extend(frames),
            Err(err) => {
                warn!(target: "opcore::derive", %err, len = data.len(), "dropping malformed batcher payload");
                return Err(PipelineError::NotEnoughData.temp());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<P> ChannelMuxProvider for FrameQueue<P>
where
    P: FrameQueueProvider + OriginAdvancer + OriginProvider + ResettableStage + Send,
{
    async fn next_frame(&mut self) -> PipelineResult<Frame> {
        self.load_frames().await?;
        self.queue.pop_front().ok_or(PipelineError::NotEnoughData.temp())
    }
}

#[async_trait]
impl<P> OriginAdvancer for FrameQueue<P>
where
    P: FrameQueueProvider + OriginAdvancer + OriginProvider + ResettableStage + Send,
{
    async fn advance_origin(&mut self) -> PipelineResult<()> {
        self.prev.advance_origin().await
    }
}

impl<P: OriginProvider> OriginProvider for FrameQueue<P> {
    fn origin(&self) -> Option<L1BlockRef> {
        self.prev.origin()
    }
}

#[async_trait]
impl<P> ResettableStage for FrameQueue<P>
where
    P: FrameQueueProvider + OriginAdvancer + OriginProvider + ResettableStage + Send,
{
    async fn reset(&mut self, base: L1BlockRef, system_config: &SystemConfig) -> PipelineResult<()> {
        self.prev.reset(base, system_config).await?;
        self.queue.clear();
        Ok(())
    }
}
