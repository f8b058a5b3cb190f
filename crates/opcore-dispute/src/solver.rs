//! Choosing the honest response to every claim in a game.

use alloy_primitives::B256;
use futures::future::try_join_all;
use tracing::{debug, trace};

use crate::{
    game::{Claim, FaultDisputeGame},
    position::Position,
    trace::{StepData, TraceAccessor, TraceError},
};

/// One response to a claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Move { parent_index: usize, position: Position, value: B256, is_attack: bool },
    Step { claim_index: usize, is_attack: bool, data: StepData },
}

impl Action {
    pub const fn target(&self) -> usize {
        match self {
            Self::Move { parent_index, .. } => *parent_index,
            Self::Step { claim_index, .. } => *claim_index,
        }
    }
}

/// Stateless solver: counters every claim it disagrees with whose parent sits on a path it
/// agrees with, and defends the ones it agrees with.
#[derive(Debug)]
pub struct Solver<A> {
    trace: A,
}

impl<A: TraceAccessor> Solver<A> {
    pub const fn new(trace: A) -> Self {
        Self { trace }
    }

    pub const fn trace(&self) -> &A {
        &self.trace
    }

    pub async fn agree_with_claim(
        &self,
        game: &FaultDisputeGame,
        index: usize,
    ) -> Result<bool, TraceError> {
        let claim = game.claim(index)?;
        Ok(self.trace.get(game, index, claim.position).await? == claim.value)
    }

    /// Whether this claim and every other ancestor on its side are honest.
    async fn agree_with_claim_path(
        &self,
        game: &FaultDisputeGame,
        mut index: usize,
    ) -> Result<bool, TraceError> {
        loop {
            if !self.agree_with_claim(game, index).await? {
                return Ok(false);
            }
            let claim = game.claim(index)?;
            let grandparent = game.parent(claim).and_then(|parent| parent.parent_index);
            match grandparent {
                Some(grandparent) => index = grandparent,
                None => return Ok(true),
            }
        }
    }

    /// Claims at depths of our own side are ours to defend, never to counter.
    const fn is_own_level(claim: &Claim, agree_with_root: bool) -> bool {
        (claim.depth() % 2 == 0) == agree_with_root
    }

    /// Every action the honest player should take in `game`, in claim order.
    pub async fn actions(
        &self,
        game: &FaultDisputeGame,
        agree_with_root: bool,
    ) -> Result<Vec<Action>, TraceError> {
        let responses = game
            .claims()
            .iter()
            .enumerate()
            .filter(|&(index, claim)| {
                !game.is_resolved(index) && !Self::is_own_level(claim, agree_with_root)
            })
            .map(|(index, claim)| self.respond(game, index, claim));
        Ok(try_join_all(responses).await?.into_iter().flatten().collect())
    }

    async fn respond(
        &self,
        game: &FaultDisputeGame,
        index: usize,
        claim: &Claim,
    ) -> Result<Option<Action>, TraceError> {
        if let Some(parent) = claim.parent_index {
            if !self.agree_with_claim_path(game, parent).await? {
                trace!(target: "opcore::dispute", index, "claim on a dishonest path");
                return Ok(None);
            }
        }
        if claim.depth() == game.config().max_game_depth {
            self.attempt_step(game, index, claim).await
        } else {
            self.next_move(game, index, claim).await
        }
    }

    async fn next_move(
        &self,
        game: &FaultDisputeGame,
        index: usize,
        claim: &Claim,
    ) -> Result<Option<Action>, TraceError> {
        let is_attack = !self.agree_with_claim(game, index).await?;
        if !is_attack && (claim.is_root() || claim.position.is_rightmost()) {
            return Ok(None);
        }
        let position = claim.position.make_move(is_attack);
        let value = self.trace.get(game, index, position).await?;
        if game.claim_exists(value, position, index) {
            return Ok(None);
        }
        debug!(target: "opcore::dispute", index, %position, is_attack, "counter claim");
        Ok(Some(Action::Move { parent_index: index, position, value, is_attack }))
    }

    async fn attempt_step(
        &self,
        game: &FaultDisputeGame,
        index: usize,
        claim: &Claim,
    ) -> Result<Option<Action>, TraceError> {
        if claim.countered_by.is_some() {
            return Ok(None);
        }
        let config = game.config();
        let is_attack = !self.agree_with_claim(game, index).await?;
        let position = if is_attack {
            claim.position
        } else {
            if config.exec_trace_index(claim.position) == (1u128 << config.exec_depth()) - 1 {
                debug!(target: "opcore::dispute", index, "nothing to step after the last trace index");
                return Ok(None);
            }
            Position::from_gindex(claim.position.gindex() + 1)
        };
        let data = self.trace.get_step_data(game, index, position).await?;
        debug!(target: "opcore::dispute", index, %position, is_attack, "step");
        Ok(Some(Action::Step { claim_index: index, is_attack, data }))
    }
}
