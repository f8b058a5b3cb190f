//! In-process model of the fault dispute game contract.
//!
//! Claims form a DAG rooted at the proposal. Positions at or above the split depth commit to
//! output roots; deeper positions commit to VM state hashes of the execution sub-game between
//! two outputs. Moves cost a bond that grows with depth and each side has its own chess clock.

use std::collections::{HashMap, HashSet};

use alloy_primitives::{keccak256, Address, B256, U256};
use bon::Builder;
use tracing::{debug, info};

use crate::{
    mips::{VmError, VmStatus},
    position::Position,
    preimage::{LocalInputs, OracleError, PreimageOracle},
    vm::VmKind,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GameError {
    #[error("game is not in progress")]
    GameNotInProgress,
    #[error("game has not been resolved")]
    GameNotResolved,
    #[error("no claim at index {0}")]
    UnknownClaim(usize),
    #[error("the root claim cannot be defended")]
    CannotDefendRootClaim,
    #[error("no position to the right of {0}")]
    CannotDefendRightmost(Position),
    #[error("move would exceed the maximum game depth")]
    GameDepthExceeded,
    #[error("claim already exists")]
    ClaimAlreadyExists,
    #[error("bond {got} does not match the required {required}")]
    IncorrectBondAmount { got: U256, required: U256 },
    #[error("clock has run out")]
    ClockTimeExceeded,
    #[error("clock has not run out")]
    ClockNotExpired,
    #[error("execution root claim {0} has the wrong status")]
    UnexpectedRootClaim(B256),
    #[error("claim is not at the maximum depth")]
    InvalidParent,
    #[error("claim is above the split depth")]
    ClaimAboveSplit,
    #[error("no ancestor commits to trace index {0}")]
    NoTraceAncestor(u128),
    #[error("pre-state does not match the claimed pre-state")]
    InvalidPrestate,
    #[error("step agrees with the claim it was meant to counter")]
    ValidStep,
    #[error("claim is already resolved")]
    ClaimAlreadyResolved,
    #[error("a child claim is still unresolved")]
    OutOfOrderResolution,
    #[error("unknown local data ident {0}")]
    InvalidLocalIdent(u64),
    #[error(transparent)]
    Vm(#[from] VmError),
    #[error(transparent)]
    Oracle(#[from] OracleError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Builder)]
pub struct GameConfig {
    #[builder(default = 73)]
    pub max_game_depth: u8,
    #[builder(default = 30)]
    pub split_depth: u8,
    /// Time budget of each side, half the game duration.
    #[builder(default = 302_400)]
    pub max_clock_duration: u64,
    #[builder(default = U256::from(80_000_000_000_000_000u64))]
    pub base_bond: U256,
    #[builder(default)]
    pub absolute_prestate: B256,
    #[builder(default = 10)]
    pub l2_chain_id: u64,
    /// The VM `step` re-executes.
    #[builder(default)]
    pub vm: VmKind,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl GameConfig {
    /// Depth of the execution sub-game trees.
    pub const fn exec_depth(&self) -> u8 {
        self.max_game_depth - self.split_depth - 1
    }

    /// `base · 2^depth`
    pub fn required_bond(&self, position: Position) -> U256 {
        self.base_bond << position.depth() as usize
    }

    /// Trace index of a position in the execution sub-game below the split.
    pub const fn exec_trace_index(&self, position: Position) -> u128 {
        position.relative_to(self.split_depth + 1).trace_index(self.exec_depth())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Clock {
    /// Time the side that made this claim had used when it made it.
    pub duration: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub parent_index: Option<usize>,
    pub countered_by: Option<Address>,
    pub claimant: Address,
    pub bond: U256,
    pub value: B256,
    pub position: Position,
    pub clock: Clock,
}

impl Claim {
    pub const fn is_root(&self) -> bool {
        self.parent_index.is_none()
    }

    pub const fn depth(&self) -> u8 {
        self.position.depth()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameStatus {
    InProgress,
    ChallengerWins,
    DefenderWins,
}

/// The output root a game starts from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Anchor {
    pub root: B256,
    pub block_number: u64,
}

/// A game as read back from its contract.
#[derive(Debug, Clone)]
pub struct GameRecord {
    pub config: GameConfig,
    pub address: Address,
    pub l1_head: B256,
    pub anchor: Anchor,
    pub l2_block_number: u64,
    pub created_at: u64,
    pub claims: Vec<Claim>,
    pub resolved: Vec<bool>,
    pub status: GameStatus,
}

#[derive(Debug, Clone)]
pub struct FaultDisputeGame {
    config: GameConfig,
    address: Address,
    l1_head: B256,
    anchor: Anchor,
    l2_block_number: u64,
    created_at: u64,
    claims: Vec<Claim>,
    claim_keys: HashSet<(B256, Position, Option<usize>)>,
    children: Vec<Vec<usize>>,
    resolved: Vec<bool>,
    credits: HashMap<Address, U256>,
    status: GameStatus,
    resolved_at: Option<u64>,
}

impl FaultDisputeGame {
    /// Create a game over the proposal `root_claim` for `l2_block_number`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: GameConfig,
        address: Address,
        creator: Address,
        root_claim: B256,
        l1_head: B256,
        anchor: Anchor,
        l2_block_number: u64,
        bond: U256,
        now: u64,
    ) -> Result<Self, GameError> {
        let required = config.required_bond(Position::ROOT);
        if bond != required {
            return Err(GameError::IncorrectBondAmount { got: bond, required });
        }
        let root = Claim {
            parent_index: None,
            countered_by: None,
            claimant: creator,
            bond,
            value: root_claim,
            position: Position::ROOT,
            clock: Clock { duration: 0, timestamp: now },
        };
        Ok(Self {
            config,
            address,
            l1_head,
            anchor,
            l2_block_number,
            created_at: now,
            claim_keys: HashSet::from([(root_claim, Position::ROOT, None)]),
            claims: vec![root],
            children: vec![Vec::new()],
            resolved: vec![false],
            credits: HashMap::new(),
            status: GameStatus::InProgress,
            resolved_at: None,
        })
    }

    /// Rebuild a game from its claims. Every claim but the first must point at an earlier one.
    /// Credits are not part of the record.
    pub fn from_record(record: GameRecord) -> Result<Self, GameError> {
        let GameRecord { config, address, l1_head, anchor, l2_block_number, created_at, claims, mut resolved, status } =
            record;
        if claims.first().is_none_or(|root| !root.is_root()) {
            return Err(GameError::UnknownClaim(0));
        }
        let mut children = vec![Vec::new(); claims.len()];
        let mut claim_keys = HashSet::with_capacity(claims.len());
        for (index, claim) in claims.iter().enumerate() {
            match claim.parent_index {
                None if index == 0 => {}
                Some(parent) if parent < index => children[parent].push(index),
                _ => return Err(GameError::UnknownClaim(index)),
            }
            claim_keys.insert((claim.value, claim.position, claim.parent_index));
        }
        resolved.resize(claims.len(), false);
        Ok(Self {
            config,
            address,
            l1_head,
            anchor,
            l2_block_number,
            created_at,
            claims,
            claim_keys,
            children,
            resolved,
            credits: HashMap::new(),
            status,
            resolved_at: None,
        })
    }

    pub const fn config(&self) -> &GameConfig {
        &self.config
    }

    pub const fn address(&self) -> Address {
        self.address
    }

    pub const fn status(&self) -> GameStatus {
        self.status
    }

    pub const fn l2_block_number(&self) -> u64 {
        self.l2_block_number
    }

    pub const fn anchor(&self) -> Anchor {
        self.anchor
    }

    pub const fn created_at(&self) -> u64 {
        self.created_at
    }

    pub const fn resolved_at(&self) -> Option<u64> {
        self.resolved_at
    }

    pub fn claims(&self) -> &[Claim] {
        &self.claims
    }

    pub fn claim(&self, index: usize) -> Result<&Claim, GameError> {
        self.claims.get(index).ok_or(GameError::UnknownClaim(index))
    }

    pub fn parent(&self, claim: &Claim) -> Option<&Claim> {
        claim.parent_index.and_then(|i| self.claims.get(i))
    }

    pub fn is_resolved(&self, index: usize) -> bool {
        self.resolved.get(index).copied().unwrap_or(false)
    }

    pub fn claim_exists(&self, value: B256, position: Position, parent_index: usize) -> bool {
        self.claim_keys.contains(&(value, position, Some(parent_index)))
    }

    pub fn credit(&self, account: Address) -> U256 {
        self.credits.get(&account).copied().unwrap_or_default()
    }

    fn ensure_in_progress(&self) -> Result<(), GameError> {
        if self.status != GameStatus::InProgress {
            return Err(GameError::GameNotInProgress);
        }
        Ok(())
    }

    /// Time the side opposing claim `index` has used, capped at the clock budget.
    pub fn challenger_duration(&self, index: usize, now: u64) -> Result<u64, GameError> {
        let claim = self.claim(index)?;
        let used = self.parent(claim).map_or(0, |p| p.clock.duration);
        let elapsed = now.saturating_sub(claim.clock.timestamp);
        Ok((used + elapsed).min(self.config.max_clock_duration))
    }

    pub fn attack(
        &mut self,
        claimant: Address,
        parent_index: usize,
        value: B256,
        bond: U256,
        now: u64,
    ) -> Result<usize, GameError> {
        self.make_move(claimant, parent_index, value, true, bond, now)
    }

    pub fn defend(
        &mut self,
        claimant: Address,
        parent_index: usize,
        value: B256,
        bond: U256,
        now: u64,
    ) -> Result<usize, GameError> {
        self.make_move(claimant, parent_index, value, false, bond, now)
    }

    /// Counter claim `parent_index` with `value`, to its left when `is_attack`.
    pub fn make_move(
        &mut self,
        claimant: Address,
        parent_index: usize,
        value: B256,
        is_attack: bool,
        bond: U256,
        now: u64,
    ) -> Result<usize, GameError> {
        self.ensure_in_progress()?;
        let parent = self.claim(parent_index)?.clone();
        if !is_attack {
            if parent.is_root() {
                return Err(GameError::CannotDefendRootClaim);
            }
            if parent.position.is_rightmost() {
                return Err(GameError::CannotDefendRightmost(parent.position));
            }
        }
        let position = parent.position.make_move(is_attack);
        if position.depth() > self.config.max_game_depth {
            return Err(GameError::GameDepthExceeded);
        }
        if position.depth() == self.config.split_depth + 1 {
            self.verify_exec_root(value, parent_index, parent.position, is_attack)?;
        }
        let required = self.config.required_bond(position);
        if bond != required {
            return Err(GameError::IncorrectBondAmount { got: bond, required });
        }
        let duration = self.challenger_duration(parent_index, now)?;
        if duration >= self.config.max_clock_duration {
            return Err(GameError::ClockTimeExceeded);
        }
        if !self.claim_keys.insert((value, position, Some(parent_index))) {
            return Err(GameError::ClaimAlreadyExists);
        }

        let index = self.claims.len();
        self.claims.push(Claim {
            parent_index: Some(parent_index),
            countered_by: None,
            claimant,
            bond,
            value,
            position,
            clock: Clock { duration, timestamp: now },
        });
        self.children.push(Vec::new());
        self.resolved.push(false);
        self.children[parent_index].push(index);
        debug!(target: "opcore::dispute", game = %self.address, %position, parent_index, is_attack, "move");
        Ok(index)
    }

    /// The first claim of an execution sub-game must say how the program ended: invalid or
    /// panicked when it disputes the output, valid when it agrees.
    fn verify_exec_root(
        &self,
        value: B256,
        parent_index: usize,
        parent_position: Position,
        is_attack: bool,
    ) -> Result<(), GameError> {
        let status = VmStatus::of_hash(value);
        let expect_invalid = is_attack || {
            let disputed = Position::from_gindex(parent_position.gindex() + 1);
            let index = self.find_trace_ancestor(disputed, parent_index, true)?;
            self.claims[index].depth() % 2 == self.config.split_depth % 2
        };
        let ok = if expect_invalid {
            matches!(status, Some(VmStatus::Invalid | VmStatus::Panic))
        } else {
            status == Some(VmStatus::Valid)
        };
        if !ok {
            return Err(GameError::UnexpectedRootClaim(value));
        }
        Ok(())
    }

    /// Walk up from `start` to the claim committing to the same trace index as `position`. Global
    /// searches compare output trace indices; local ones stay inside the execution sub-game.
    fn find_trace_ancestor(&self, position: Position, start: usize, global: bool) -> Result<usize, GameError> {
        let split = self.config.split_depth;
        let target = if global {
            position.trace_index(split)
        } else {
            self.config.exec_trace_index(position)
        };
        let mut index = Some(start);
        while let Some(i) = index {
            let claim = &self.claims[i];
            if global {
                if claim.depth() <= split && claim.position.trace_index(split) == target {
                    return Ok(i);
                }
            } else {
                if claim.depth() <= split {
                    break;
                }
                if self.config.exec_trace_index(claim.position) == target {
                    return Ok(i);
                }
            }
            index = claim.parent_index;
        }
        Err(GameError::NoTraceAncestor(target))
    }

    /// Inputs of the execution sub-game that `position` belongs to, seen from claim `ref_index`
    /// on the same branch.
    pub fn local_inputs(&self, ref_index: usize, position: Position) -> Result<LocalInputs, GameError> {
        let split = self.config.split_depth;
        if position.depth() <= split {
            return Err(GameError::ClaimAboveSplit);
        }
        let mut leaf_index = ref_index;
        while self.claim(leaf_index)?.depth() > split {
            leaf_index = self.claims[leaf_index].parent_index.ok_or(GameError::ClaimAboveSplit)?;
        }
        let leaf = &self.claims[leaf_index];
        if leaf.depth() != split {
            return Err(GameError::ClaimAboveSplit);
        }

        let depth = position.depth();
        let (starting, disputed, disputed_position) =
            if position.trace_index(depth) > leaf.position.trace_index(depth) {
                let next = Position::from_gindex(leaf.position.gindex() + 1);
                let post = &self.claims[self.find_trace_ancestor(next, leaf_index, true)?];
                (leaf.value, post.value, post.position)
            } else if leaf.position.index_at_depth() > 0 {
                let prev = Position::from_gindex(leaf.position.gindex() - 1);
                let pre = &self.claims[self.find_trace_ancestor(prev, leaf_index, true)?];
                (pre.value, leaf.value, leaf.position)
            } else {
                (self.anchor.root, leaf.value, leaf.position)
            };

        let offset = disputed_position.trace_index(split) as u64 + 1;
        Ok(LocalInputs {
            l1_head: self.l1_head,
            starting_output: starting,
            disputed_output: disputed,
            disputed_block: (self.anchor.block_number + offset).min(self.l2_block_number),
            chain_id: self.config.l2_chain_id,
        })
    }

    /// Load local input `ident` of claim `claim_index`'s execution sub-game into the oracle.
    /// Returns the local context the data is keyed under.
    pub fn add_local_data(
        &self,
        oracle: &mut PreimageOracle,
        ident: u64,
        claim_index: usize,
        part_offset: u64,
    ) -> Result<B256, GameError> {
        self.ensure_in_progress()?;
        let inputs = self.local_inputs(claim_index, self.claim(claim_index)?.position)?;
        let (word, size) = inputs.local_data(ident).ok_or(GameError::InvalidLocalIdent(ident))?;
        let context = inputs.local_context();
        oracle.load_local_data(self.address, ident, context, word, size, part_offset)?;
        Ok(context)
    }

    /// Counter the max-depth claim `claim_index` by executing one instruction.
    #[allow(clippy::too_many_arguments)]
    pub fn step(
        &mut self,
        claimant: Address,
        claim_index: usize,
        is_attack: bool,
        state_data: &[u8],
        proof: &[u8],
        oracle: &PreimageOracle,
        now: u64,
    ) -> Result<(), GameError> {
        self.ensure_in_progress()?;
        let parent = self.claim(claim_index)?.clone();
        if parent.depth() != self.config.max_game_depth {
            return Err(GameError::InvalidParent);
        }
        if self.challenger_duration(claim_index, now)? >= self.config.max_clock_duration {
            return Err(GameError::ClockTimeExceeded);
        }

        let trace_index = self.config.exec_trace_index(parent.position);
        let (pre_value, post) = if is_attack {
            let pre = if trace_index == 0 {
                self.config.absolute_prestate
            } else {
                let prev = Position::from_gindex(parent.position.gindex() - 1);
                self.claims[self.find_trace_ancestor(prev, claim_index, false)?].value
            };
            (pre, parent.clone())
        } else {
            let next = Position::from_gindex(parent.position.gindex() + 1);
            let post = self.claims[self.find_trace_ancestor(next, claim_index, false)?].clone();
            (parent.value, post)
        };

        if keccak256(state_data)[1..] != pre_value[1..] {
            return Err(GameError::InvalidPrestate);
        }
        let context = self.local_inputs(claim_index, parent.position)?.local_context();
        let post_hash = self.config.vm.verify_step(state_data, proof, oracle, self.address, context)?;

        let valid_step = post_hash == post.value;
        let parent_post_agree = (parent.depth() - post.depth()) % 2 == 0;
        if parent_post_agree == valid_step {
            return Err(GameError::ValidStep);
        }
        let countered = &mut self.claims[claim_index].countered_by;
        if countered.is_none() {
            *countered = Some(claimant);
        }
        info!(target: "opcore::dispute", game = %self.address, claim_index, is_attack, "step countered claim");
        Ok(())
    }

    /// Settle the subgame rooted at `index` once its clock has run out and its children are
    /// settled. The leftmost uncountered child counters it.
    pub fn resolve_claim(&mut self, index: usize, now: u64) -> Result<(), GameError> {
        self.ensure_in_progress()?;
        self.claim(index)?;
        if self.resolved[index] {
            return Err(GameError::ClaimAlreadyResolved);
        }
        if self.challenger_duration(index, now)? < self.config.max_clock_duration {
            return Err(GameError::ClockNotExpired);
        }

        let mut leftmost: Option<(Position, Address)> = None;
        for &child in &self.children[index] {
            if !self.resolved[child] {
                return Err(GameError::OutOfOrderResolution);
            }
            let claim = &self.claims[child];
            if claim.countered_by.is_none() && leftmost.is_none_or(|(pos, _)| claim.position < pos) {
                leftmost = Some((claim.position, claim.claimant));
            }
        }

        if let Some((_, counter)) = leftmost {
            self.claims[index].countered_by = Some(counter);
        }
        let claim = &mut self.claims[index];
        let recipient = claim.countered_by.unwrap_or(claim.claimant);
        let bond = std::mem::take(&mut claim.bond);
        *self.credits.entry(recipient).or_default() += bond;
        self.resolved[index] = true;
        Ok(())
    }

    /// Decide the game from the root claim's subgame.
    pub fn resolve(&mut self, now: u64) -> Result<GameStatus, GameError> {
        self.ensure_in_progress()?;
        if !self.resolved[0] {
            return Err(GameError::OutOfOrderResolution);
        }
        self.status = if self.claims[0].countered_by.is_some() {
            GameStatus::ChallengerWins
        } else {
            GameStatus::DefenderWins
        };
        self.resolved_at = Some(now);
        info!(target: "opcore::dispute", game = %self.address, status = ?self.status, "game resolved");
        Ok(self.status)
    }

    /// Pay out what `recipient` is owed once the game is over.
    pub fn claim_credit(&mut self, recipient: Address) -> Result<U256, GameError> {
        if self.status == GameStatus::InProgress {
            return Err(GameError::GameNotResolved);
        }
        Ok(self.credits.remove(&recipient).unwrap_or_default())
    }
}
