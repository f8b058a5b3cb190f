use std::sync::Arc;

use alloy_primitives::B256;
use async_trait::async_trait;
use backon::Retryable;
use opcore_stream::{L1SourceError, RetryConfig, RollupNodeClient};
use opcore_types::OutputResponse;
use tracing::debug;

use super::{StepData, TraceError, TraceProvider};
use crate::position::Position;

/// Output roots by L2 block number.
#[async_trait]
pub trait OutputSource: Send + Sync {
    async fn output_at_block(&self, number: u64) -> Result<OutputResponse, L1SourceError>;
}

#[async_trait]
impl OutputSource for RollupNodeClient {
    async fn output_at_block(&self, number: u64) -> Result<OutputResponse, L1SourceError> {
        RollupNodeClient::output_at_block(self, number).await
    }
}

#[async_trait]
impl<S: OutputSource + ?Sized> OutputSource for Arc<S> {
    async fn output_at_block(&self, number: u64) -> Result<OutputResponse, L1SourceError> {
        (**self).output_at_block(number).await
    }
}

/// Output roots of the blocks after the anchor. Trace index `i` is block `prestate + 1 + i`,
/// held at the proposal's block once past it.
#[derive(Debug)]
pub struct OutputTraceProvider<S> {
    source: S,
    prestate_block: u64,
    poststate_block: u64,
    depth: u8,
    retry: RetryConfig,
}

impl<S: OutputSource> OutputTraceProvider<S> {
    pub fn new(source: S, prestate_block: u64, poststate_block: u64, depth: u8) -> Self {
        Self { source, prestate_block, poststate_block, depth, retry: RetryConfig::default() }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn block_number(&self, position: Position) -> Result<u64, TraceError> {
        let index = position.trace_index(self.depth);
        let offset = u64::try_from(index).map_err(|_| TraceError::IndexTooLarge(index))?;
        Ok(self.prestate_block.saturating_add(1).saturating_add(offset).min(self.poststate_block))
    }

    async fn output_root(&self, number: u64) -> Result<B256, TraceError> {
        let output = (|| async { self.source.output_at_block(number).await })
            .retry(self.retry.backoff())
            .when(L1SourceError::is_transient)
            .notify(|err, dur| {
                debug!(target: "opcore::dispute", %err, delay = ?dur, number, "retrying output fetch");
            })
            .await?;
        Ok(output.output_root)
    }
}

#[async_trait]
impl<S: OutputSource> TraceProvider for OutputTraceProvider<S> {
    async fn get(&self, position: Position) -> Result<B256, TraceError> {
        self.output_root(self.block_number(position)?).await
    }

    async fn get_step_data(&self, _position: Position) -> Result<StepData, TraceError> {
        Err(TraceError::NoStepData)
    }

    async fn absolute_prestate(&self) -> Result<B256, TraceError> {
        self.output_root(self.prestate_block).await
    }
}
