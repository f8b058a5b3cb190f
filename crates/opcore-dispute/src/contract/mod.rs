//! The dispute game contract as the challenger sees it.
//!
//! [`GameContract`] reads a game's claims and submits moves, steps and resolutions. [`LocalGame`]
//! plays against the in-process [`FaultDisputeGame`]; [`RpcGame`] reads the deployed contract
//! over `eth_call` and hands calls to a [`TxSender`].

mod local;
mod rpc;

use std::sync::Arc;

use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use opcore_stream::L1SourceError;

use crate::{
    game::{FaultDisputeGame, GameError, GameStatus},
    trace::StepData,
};

pub use local::LocalGame;
pub use rpc::{claim_from_abi, RpcGame, RpcGameFactory, RpcGameSource};

#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error(transparent)]
    Game(#[from] GameError),
    #[error(transparent)]
    Rpc(#[from] L1SourceError),
    #[error("abi: {0}")]
    Abi(#[from] alloy_sol_types::Error),
    #[error("transaction {0} reverted")]
    Reverted(B256),
    #[error("failed to send transaction: {0}")]
    Send(String),
    #[error("malformed game data: {0}")]
    Malformed(String),
    #[error("absolute prestate {got} is not the program's {expected}")]
    PrestateMismatch { expected: B256, got: B256 },
}

/// A contract call to be signed and sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractCall {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
}

/// Gets contract calls mined.
#[async_trait]
pub trait TxSender: Send + Sync {
    /// The account the transactions are sent from.
    fn sender(&self) -> Address;

    /// Send `call` and wait for it to be included. Returns the transaction hash.
    async fn send(&self, call: ContractCall) -> Result<B256, ContractError>;
}

#[async_trait]
impl<T: TxSender + ?Sized> TxSender for Arc<T> {
    fn sender(&self) -> Address {
        (**self).sender()
    }

    async fn send(&self, call: ContractCall) -> Result<B256, ContractError> {
        (**self).send(call).await
    }
}

/// Reads and writes one dispute game.
#[async_trait]
pub trait GameContract: Send + Sync {
    fn address(&self) -> Address;

    /// The game as it stands now.
    async fn snapshot(&self) -> Result<FaultDisputeGame, ContractError>;

    /// Counter claim `parent_index` with `value`, posting `bond`.
    async fn make_move(
        &self,
        parent_index: usize,
        value: B256,
        is_attack: bool,
        bond: U256,
        now: u64,
    ) -> Result<(), ContractError>;

    /// Load the preimage the step reads, if any, then counter the max-depth claim.
    async fn step(
        &self,
        claim_index: usize,
        is_attack: bool,
        data: &StepData,
        now: u64,
    ) -> Result<(), ContractError>;

    async fn resolve_claim(&self, index: usize, now: u64) -> Result<(), ContractError>;

    async fn resolve(&self, now: u64) -> Result<GameStatus, ContractError>;

    /// Withdraw what the playing account earned.
    async fn claim_credit(&self) -> Result<U256, ContractError>;
}
