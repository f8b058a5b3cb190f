use alloy_primitives::B256;
use async_trait::async_trait;

use super::{ExecTraceCreator, StepData, TraceAccessor, TraceCache, TraceError, TraceProvider};
use crate::{game::FaultDisputeGame, position::Position};

/// Output trace down to the split depth, an execution trace per output pair below it.
#[derive(Debug)]
pub struct SplitTraceProvider<T, C: ExecTraceCreator> {
    top: T,
    bottom: TraceCache<C>,
    split_depth: u8,
}

impl<T: TraceProvider, C: ExecTraceCreator> SplitTraceProvider<T, C> {
    pub fn new(top: T, bottom: TraceCache<C>, split_depth: u8) -> Self {
        Self { top, bottom, split_depth }
    }

    pub const fn top(&self) -> &T {
        &self.top
    }

    pub const fn bottom(&self) -> &TraceCache<C> {
        &self.bottom
    }

    async fn bottom_for(
        &self,
        game: &FaultDisputeGame,
        ref_index: usize,
        position: Position,
    ) -> Result<(std::sync::Arc<C::Provider>, Position), TraceError> {
        let inputs = game.local_inputs(ref_index, position)?;
        let provider = self.bottom.get_or_create(inputs).await?;
        Ok((provider, position.relative_to(self.split_depth + 1)))
    }
}

#[async_trait]
impl<T: TraceProvider, C: ExecTraceCreator> TraceAccessor for SplitTraceProvider<T, C> {
    async fn get(
        &self,
        game: &FaultDisputeGame,
        ref_index: usize,
        position: Position,
    ) -> Result<B256, TraceError> {
        if position.depth() <= self.split_depth {
            return self.top.get(position).await;
        }
        let (provider, relative) = self.bottom_for(game, ref_index, position).await?;
        provider.get(relative).await
    }

    async fn get_step_data(
        &self,
        game: &FaultDisputeGame,
        ref_index: usize,
        position: Position,
    ) -> Result<StepData, TraceError> {
        if position.depth() <= self.split_depth {
            return Err(TraceError::NoStepData);
        }
        let (provider, relative) = self.bottom_for(game, ref_index, position).await?;
        provider.get_step_data(relative).await
    }
}
