//! Plays one game: applies the solver's actions and resolves what has timed out.

use std::fmt;

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::{
    contract::{ContractError, GameContract},
    game::{FaultDisputeGame, GameError, GameStatus},
    scheduler::GamePlayer,
    solver::{Action, Solver},
    trace::{TraceAccessor, TraceError},
};

pub struct Agent<A, C> {
    solver: Solver<A>,
    contract: C,
}

impl<A, C: GameContract> fmt::Debug for Agent<A, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent").field("game", &self.contract.address()).finish_non_exhaustive()
    }
}

impl<A: TraceAccessor, C: GameContract> Agent<A, C> {
    pub const fn new(trace: A, contract: C) -> Self {
        Self { solver: Solver::new(trace), contract }
    }

    pub const fn contract(&self) -> &C {
        &self.contract
    }

    /// Take every honest action against the current claims. Returns how many landed.
    pub async fn act(&self, now: u64) -> Result<usize, TraceError> {
        let snapshot = self.contract.snapshot().await?;
        if snapshot.status() != GameStatus::InProgress {
            return Ok(0);
        }
        let agree_with_root = self.solver.agree_with_claim(&snapshot, 0).await?;
        let actions = self.solver.actions(&snapshot, agree_with_root).await?;

        let mut applied = 0;
        for action in actions {
            let target = action.target();
            match self.apply(&snapshot, action, now).await {
                Ok(()) => applied += 1,
                Err(err) => {
                    warn!(target: "opcore::dispute", game = %snapshot.address(), target, %err, "action failed")
                }
            }
        }
        Ok(applied)
    }

    async fn apply(&self, game: &FaultDisputeGame, action: Action, now: u64) -> Result<(), ContractError> {
        match action {
            Action::Move { parent_index, position, value, is_attack } => {
                let bond = game.config().required_bond(position);
                self.contract.make_move(parent_index, value, is_attack, bond, now).await
            }
            Action::Step { claim_index, is_attack, data } => {
                self.contract.step(claim_index, is_attack, &data, now).await
            }
        }
    }

    /// Resolve every subgame whose clock has run out, then the game itself once the root's
    /// subgame is settled. Each resolution is tried on a copy first so only the ones that
    /// succeed reach the contract.
    pub async fn try_resolve(&self, now: u64) -> Result<GameStatus, ContractError> {
        let mut game = self.contract.snapshot().await?;
        if game.status() != GameStatus::InProgress {
            return Ok(game.status());
        }
        for index in (0..game.claims().len()).rev() {
            if game.is_resolved(index) {
                continue;
            }
            match game.resolve_claim(index, now) {
                Ok(()) => {
                    self.contract.resolve_claim(index, now).await?;
                    debug!(target: "opcore::dispute", game = %game.address(), index, "resolved claim");
                }
                Err(GameError::ClockNotExpired | GameError::OutOfOrderResolution) => {}
                Err(err) => return Err(err.into()),
            }
        }
        if !game.is_resolved(0) {
            return Ok(GameStatus::InProgress);
        }
        self.contract.resolve(now).await
    }

    /// Withdraw what the playing account earned once the game is over.
    pub async fn claim_credit(&self) -> Result<U256, ContractError> {
        let credit = self.contract.claim_credit().await?;
        info!(target: "opcore::dispute", game = %self.contract.address(), %credit, "claimed credit");
        Ok(credit)
    }
}

#[async_trait]
impl<A: TraceAccessor, C: GameContract> GamePlayer for Agent<A, C> {
    fn game_address(&self) -> Address {
        self.contract.address()
    }

    async fn progress(&self, now: u64) -> Result<GameStatus, TraceError> {
        self.act(now).await?;
        Ok(self.try_resolve(now).await?)
    }
}
