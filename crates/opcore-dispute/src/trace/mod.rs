//! Sources of the honest claim at each position of a game.
//!
//! ```text
//!  depth 0 ─┐
//!           │  OutputTraceProvider   output roots from the rollup node
//!  split   ─┤
//!           │  VmTraceProvider       VM state hashes, one tree per pair of outputs
//!  max     ─┘
//! ```
//!
//! [`SplitTraceProvider`] routes a position to the right half and builds the execution trace
//! for the sub-game a claim belongs to.

use std::sync::Arc;

use alloy_primitives::B256;
use async_trait::async_trait;
use opcore_stream::L1SourceError;

use crate::{
    contract::ContractError,
    game::{FaultDisputeGame, GameError},
    mips::VmError,
    position::Position,
    preimage::{OracleUpdate, PreimageKey},
};

mod cache;
mod exec;
mod output;
mod split;

pub use cache::TraceCache;
pub use exec::{ExecTraceCreator, VmTraceCreator, VmTraceProvider};
pub use output::{OutputSource, OutputTraceProvider};
pub use split::SplitTraceProvider;

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error(transparent)]
    Rollup(#[from] L1SourceError),
    #[error(transparent)]
    Vm(#[from] VmError),
    #[error(transparent)]
    Game(#[from] GameError),
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error("output trace has no step data")]
    NoStepData,
    #[error("no oracle update for preimage {0}")]
    UnknownPreimage(PreimageKey),
    #[error("trace index {0} does not fit the trace")]
    IndexTooLarge(u128),
    #[error("trace task failed: {0}")]
    Join(String),
}

/// Preimage part the oracle needs before a step can read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreimageOracleData {
    /// The key as the program wrote it, not localized.
    pub key: PreimageKey,
    pub offset: u64,
    pub update: OracleUpdate,
}

impl PreimageOracleData {
    /// Local ident when the key is local.
    pub fn local_ident(&self) -> Option<u64> {
        match self.update {
            OracleUpdate::Local { ident } => Some(ident),
            _ => None,
        }
    }
}

/// Witness of one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepData {
    pub pre_state: Vec<u8>,
    pub proof: Vec<u8>,
    pub oracle: Option<PreimageOracleData>,
}

/// One trace. Positions are relative to the trace's own root.
#[async_trait]
pub trait TraceProvider: Send + Sync {
    /// Claim committed to at `position`.
    async fn get(&self, position: Position) -> Result<B256, TraceError>;

    /// Witness of the step that produces the value right after `position`'s pre-state.
    async fn get_step_data(&self, position: Position) -> Result<StepData, TraceError>;

    /// Value before the first trace index.
    async fn absolute_prestate(&self) -> Result<B256, TraceError>;
}

#[async_trait]
impl<P: TraceProvider + ?Sized> TraceProvider for Arc<P> {
    async fn get(&self, position: Position) -> Result<B256, TraceError> {
        (**self).get(position).await
    }

    async fn get_step_data(&self, position: Position) -> Result<StepData, TraceError> {
        (**self).get_step_data(position).await
    }

    async fn absolute_prestate(&self) -> Result<B256, TraceError> {
        (**self).absolute_prestate().await
    }
}

/// Trace access in the context of a game, where the execution trace depends on the branch the
/// claim at `ref_index` sits on. Positions are absolute.
#[async_trait]
pub trait TraceAccessor: Send + Sync {
    async fn get(
        &self,
        game: &FaultDisputeGame,
        ref_index: usize,
        position: Position,
    ) -> Result<B256, TraceError>;

    async fn get_step_data(
        &self,
        game: &FaultDisputeGame,
        ref_index: usize,
        position: Position,
    ) -> Result<StepData, TraceError>;
}
