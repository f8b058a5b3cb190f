//! Interfaces between pipeline stages.
//!
//! Each stage owns the stage below it and pulls through one of the `*Provider` traits. Errors
//! travel up as [`PipelineErrorKind`]; an `Eof` from the top of the stack means the current L1
//! origin is exhausted and [`OriginAdvancer::advance_origin`] should be called.

use alloy_primitives::{Address, Bytes};
use async_trait::async_trait;
use opcore_pipeline::{Batch, Frame, SingleBatch, SystemConfig};
use opcore_types::{L1BlockRef, L2BlockRef};

use crate::errors::PipelineResult;

pub trait OriginProvider {
    /// The L1 block the stage is currently reading from.
    fn origin(&self) -> Option<L1BlockRef>;
}

#[async_trait]
pub trait OriginAdvancer {
    async fn advance_origin(&mut self) -> PipelineResult<()>;
}

#[async_trait]
pub trait ResettableStage {
    /// Drop buffered state and restart from `base`. Stages reset the stage below them first.
    async fn reset(&mut self, base: L1BlockRef, system_config: &SystemConfig) -> PipelineResult<()>;
}

#[async_trait]
pub trait L1RetrievalProvider {
    /// The next L1 block to read batcher data from, once per origin.
    async fn next_l1_block(&mut self) -> PipelineResult<Option<L1BlockRef>>;

    fn batcher_address(&self) -> Address;
}

#[async_trait]
pub trait FrameQueueProvider {
    /// The next batcher transaction payload of the current origin.
    async fn next_data(&mut self) -> PipelineResult<Bytes>;
}

#[async_trait]
pub trait ChannelMuxProvider {
    async fn next_frame(&mut self) -> PipelineResult<Frame>;
}

#[async_trait]
pub trait ChannelReaderProvider {
    /// Raw data of the next complete channel.
    async fn next_channel(&mut self) -> PipelineResult<Vec<u8>>;
}

#[async_trait]
pub trait BatchStreamProvider {
    async fn next_batch(&mut self) -> PipelineResult<Batch>;

    /// Discard the rest of the channel being read.
    fn flush(&mut self);
}

#[async_trait]
pub trait AttributesProvider {
    /// The next batch building on `parent`.
    async fn next_batch(&mut self, parent: &L2BlockRef) -> PipelineResult<SingleBatch>;

    /// Whether the last returned batch ends a span batch, or was a singular batch.
    fn is_last_in_span(&self) -> bool;
}
