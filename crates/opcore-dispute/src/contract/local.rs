use std::{fmt, sync::Arc};

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ContractError, GameContract};
use crate::{
    game::{FaultDisputeGame, GameError, GameStatus},
    preimage::PreimageOracle,
    trace::StepData,
};

/// A game held in memory, played by one account.
#[derive(Clone)]
pub struct LocalGame {
    address: Address,
    game: Arc<Mutex<FaultDisputeGame>>,
    oracle: Arc<Mutex<PreimageOracle>>,
    account: Address,
}

impl fmt::Debug for LocalGame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalGame")
            .field("address", &self.address)
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

impl LocalGame {
    pub fn new(game: FaultDisputeGame, oracle: Arc<Mutex<PreimageOracle>>, account: Address) -> Self {
        Self { address: game.address(), game: Arc::new(Mutex::new(game)), oracle, account }
    }

    pub const fn account(&self) -> Address {
        self.account
    }

    /// Shared with every clone, so other players can move against the same game.
    pub fn game(&self) -> &Arc<Mutex<FaultDisputeGame>> {
        &self.game
    }

    pub fn oracle(&self) -> &Arc<Mutex<PreimageOracle>> {
        &self.oracle
    }
}

#[async_trait]
impl GameContract for LocalGame {
    fn address(&self) -> Address {
        self.address
    }

    async fn snapshot(&self) -> Result<FaultDisputeGame, ContractError> {
        Ok(self.game.lock().await.clone())
    }

    async fn make_move(
        &self,
        parent_index: usize,
        value: B256,
        is_attack: bool,
        bond: U256,
        now: u64,
    ) -> Result<(), ContractError> {
        self.game.lock().await.make_move(self.account, parent_index, value, is_attack, bond, now)?;
        Ok(())
    }

    async fn step(
        &self,
        claim_index: usize,
        is_attack: bool,
        data: &StepData,
        now: u64,
    ) -> Result<(), ContractError> {
        let mut game = self.game.lock().await;
        let mut oracle = self.oracle.lock().await;
        load_oracle_data(&game, &mut oracle, claim_index, data)?;
        game.step(self.account, claim_index, is_attack, &data.pre_state, &data.proof, &oracle, now)?;
        Ok(())
    }

    async fn resolve_claim(&self, index: usize, now: u64) -> Result<(), ContractError> {
        Ok(self.game.lock().await.resolve_claim(index, now)?)
    }

    async fn resolve(&self, now: u64) -> Result<GameStatus, ContractError> {
        Ok(self.game.lock().await.resolve(now)?)
    }

    async fn claim_credit(&self) -> Result<U256, ContractError> {
        Ok(self.game.lock().await.claim_credit(self.account)?)
    }
}

fn load_oracle_data(
    game: &FaultDisputeGame,
    oracle: &mut PreimageOracle,
    claim_index: usize,
    data: &StepData,
) -> Result<(), GameError> {
    let Some(oracle_data) = &data.oracle else {
        return Ok(());
    };
    let offset = oracle_data.offset;
    match oracle_data.local_ident() {
        Some(ident) => {
            game.add_local_data(oracle, ident, claim_index, offset)?;
        }
        None => oracle_data.update.apply_global(oracle, offset)?,
    }
    Ok(())
}
