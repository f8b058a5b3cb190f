//! Large preimage proposals: keccak preimages too big to load in one call, absorbed in 136-byte
//! blocks with a state commitment per block and challengeable one permutation at a time.

use alloy_primitives::{keccak256, Address, B256, U256};
use tiny_keccak::keccakf;

use super::{
    key::{PreimageKey, PreimageKeyType},
    oracle::PreimageOracle,
};

/// Keccak-256 rate.
pub const KECCAK_RATE: usize = 136;
/// Smallest preimage that may go through a proposal.
pub const MIN_PREIMAGE_SIZE: u64 = (KECCAK_RATE * 20) as u64;
/// Depth of the Merkle tree over a proposal's leaves.
pub const LPP_TREE_DEPTH: usize = 16;

/// Keccak-f[1600] state.
pub type StateMatrix = [u64; 25];

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LppError {
    #[error("proposal already exists")]
    AlreadyInitialized,
    #[error("no such proposal")]
    UnknownProposal,
    #[error("bond below the minimum")]
    InsufficientBond,
    #[error("claimed size below the minimum or input does not add up")]
    InvalidInputSize,
    #[error("part offset past the end of the claimed preimage")]
    PartOffsetOob,
    #[error("input does not start at the next unprocessed block")]
    WrongStartingBlock,
    #[error("proposal is already finalized")]
    AlreadyFinalized,
    #[error("proposal is not finalized")]
    NotFinalized,
    #[error("proposal was countered")]
    BadProposal,
    #[error("challenge period has not elapsed")]
    ActiveProposal,
    #[error("leaf proof does not verify")]
    InvalidProof,
    #[error("leaves are not adjacent")]
    StatesNotContiguous,
    #[error("state matrix does not match the pre-state commitment")]
    StatePreimageMismatch,
    #[error("post-state commitment matches the absorbed state")]
    PostStateMatches,
    #[error("post leaf is not the last absorbed block")]
    InvalidLastLeaf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LppConfig {
    pub min_bond: U256,
    /// Seconds a finalized proposal stays open to challenges.
    pub challenge_period: u64,
}

/// One absorbed block and the state commitment claimed after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    pub input: [u8; KECCAK_RATE],
    pub index: u64,
    pub state_commitment: B256,
}

impl Leaf {
    pub fn hash(&self) -> B256 {
        let mut buf = Vec::with_capacity(KECCAK_RATE + 64);
        buf.extend_from_slice(&self.input);
        buf.extend_from_slice(&U256::from(self.index).to_be_bytes::<32>());
        buf.extend_from_slice(self.state_commitment.as_slice());
        keccak256(buf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalStatus {
    Absorbing,
    Finalized { timestamp: u64 },
    Countered { challenger: Address },
    Squeezed,
}

#[derive(Debug, Clone)]
pub struct LargePreimageProposal {
    pub part_offset: u64,
    pub claimed_size: u64,
    pub bond: U256,
    pub status: ProposalStatus,
    data: Vec<u8>,
    leaves: Vec<Leaf>,
}

impl LargePreimageProposal {
    pub fn leaves(&self) -> &[Leaf] {
        &self.leaves
    }

    pub fn bytes_processed(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn root(&self) -> B256 {
        merkle_root(&self.leaves)
    }

    pub fn proof(&self, index: usize) -> Vec<B256> {
        merkle_proof(&self.leaves, index)
    }
}

/// keccak of the 25 lanes as big-endian 32-byte words.
pub fn state_commitment(state: &StateMatrix) -> B256 {
    let mut buf = [0u8; 25 * 32];
    for (i, lane) in state.iter().enumerate() {
        buf[i * 32 + 24..(i + 1) * 32].copy_from_slice(&lane.to_be_bytes());
    }
    keccak256(buf)
}

/// XOR a block into the rate lanes and permute.
pub fn absorb(state: &mut StateMatrix, block: &[u8; KECCAK_RATE]) {
    for (lane, chunk) in state.iter_mut().zip(block.chunks_exact(8)) {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(chunk);
        *lane ^= u64::from_le_bytes(bytes);
    }
    keccakf(state);
}

/// The first 32 bytes of the state.
pub fn squeeze(state: &StateMatrix) -> B256 {
    let mut out = [0u8; 32];
    for (chunk, lane) in out.chunks_exact_mut(8).zip(state.iter()) {
        chunk.copy_from_slice(&lane.to_le_bytes());
    }
    B256::from(out)
}

/// Keccak pad10*1 up to a multiple of the rate.
pub fn pad(input: &[u8]) -> Vec<u8> {
    let mut out = input.to_vec();
    let pad_len = KECCAK_RATE - input.len() % KECCAK_RATE;
    out.resize(input.len() + pad_len, 0);
    out[input.len()] ^= 0x01;
    let last = out.len() - 1;
    out[last] ^= 0x80;
    out
}

/// State commitments after each block of `input`, with padding applied when `finalize`.
pub fn commitments(input: &[u8], mut state: StateMatrix, finalize: bool) -> (Vec<B256>, StateMatrix) {
    let input = if finalize { pad(input) } else { input.to_vec() };
    let mut out = Vec::with_capacity(input.len() / KECCAK_RATE);
    for block in input.chunks_exact(KECCAK_RATE) {
        let mut buf = [0u8; KECCAK_RATE];
        buf.copy_from_slice(block);
        absorb(&mut state, &buf);
        out.push(state_commitment(&state));
    }
    (out, state)
}

fn zero_hashes() -> [B256; LPP_TREE_DEPTH] {
    let mut zeros = [B256::ZERO; LPP_TREE_DEPTH];
    for i in 1..LPP_TREE_DEPTH {
        zeros[i] = keccak256([zeros[i - 1].as_slice(), zeros[i - 1].as_slice()].concat());
    }
    zeros
}

fn levels(leaves: &[Leaf]) -> Vec<Vec<B256>> {
    let zeros = zero_hashes();
    let mut levels = vec![leaves.iter().map(Leaf::hash).collect::<Vec<_>>()];
    for height in 0..LPP_TREE_DEPTH {
        let level = &levels[height];
        let next = level
            .chunks(2)
            .map(|pair| {
                let right = pair.get(1).copied().unwrap_or(zeros[height]);
                keccak256([pair[0].as_slice(), right.as_slice()].concat())
            })
            .collect();
        levels.push(next);
    }
    levels
}

pub fn merkle_root(leaves: &[Leaf]) -> B256 {
    if leaves.is_empty() {
        let zero = zero_hashes()[LPP_TREE_DEPTH - 1];
        return keccak256([zero.as_slice(), zero.as_slice()].concat());
    }
    levels(leaves)[LPP_TREE_DEPTH][0]
}

pub fn merkle_proof(leaves: &[Leaf], index: usize) -> Vec<B256> {
    let zeros = zero_hashes();
    let levels = levels(leaves);
    (0..LPP_TREE_DEPTH)
        .map(|height| levels[height].get((index >> height) ^ 1).copied().unwrap_or(zeros[height]))
        .collect()
}

pub fn verify_leaf(root: B256, leaf: &Leaf, proof: &[B256]) -> bool {
    if proof.len() != LPP_TREE_DEPTH {
        return false;
    }
    let mut node = leaf.hash();
    for (height, sibling) in proof.iter().enumerate() {
        node = if (leaf.index >> height) & 1 == 1 {
            keccak256([sibling.as_slice(), node.as_slice()].concat())
        } else {
            keccak256([node.as_slice(), sibling.as_slice()].concat())
        };
    }
    node == root
}

impl PreimageOracle {
    pub fn proposal(&self, claimant: Address, uuid: u64) -> Option<&LargePreimageProposal> {
        self.proposals.get(&(claimant, uuid))
    }

    pub fn init_lpp(
        &mut self,
        claimant: Address,
        uuid: u64,
        part_offset: u64,
        claimed_size: u64,
        bond: U256,
    ) -> Result<(), LppError> {
        if bond < self.lpp_config.min_bond {
            return Err(LppError::InsufficientBond);
        }
        if claimed_size < MIN_PREIMAGE_SIZE {
            return Err(LppError::InvalidInputSize);
        }
        if part_offset >= claimed_size + 8 {
            return Err(LppError::PartOffsetOob);
        }
        if self.proposals.contains_key(&(claimant, uuid)) {
            return Err(LppError::AlreadyInitialized);
        }
        self.proposals.insert(
            (claimant, uuid),
            LargePreimageProposal {
                part_offset,
                claimed_size,
                bond,
                status: ProposalStatus::Absorbing,
                data: Vec::new(),
                leaves: Vec::new(),
            },
        );
        Ok(())
    }

    /// Append blocks of `input` with one claimed commitment each. With `finalize`, `input` is the
    /// unpadded tail and the proposal stops accepting leaves.
    #[allow(clippy::too_many_arguments)]
    pub fn add_leaves(
        &mut self,
        claimant: Address,
        uuid: u64,
        input_start_block: u64,
        input: &[u8],
        state_commitments: &[B256],
        finalize: bool,
        now: u64,
    ) -> Result<(), LppError> {
        let proposal = self.proposals.get_mut(&(claimant, uuid)).ok_or(LppError::UnknownProposal)?;
        if proposal.status != ProposalStatus::Absorbing {
            return Err(LppError::AlreadyFinalized);
        }
        if input_start_block != proposal.leaves.len() as u64 {
            return Err(LppError::WrongStartingBlock);
        }
        let blocks = if finalize {
            if proposal.data.len() as u64 + input.len() as u64 != proposal.claimed_size {
                return Err(LppError::InvalidInputSize);
            }
            pad(input)
        } else {
            if input.len() % KECCAK_RATE != 0 {
                return Err(LppError::InvalidInputSize);
            }
            input.to_vec()
        };
        if blocks.len() / KECCAK_RATE != state_commitments.len() {
            return Err(LppError::InvalidInputSize);
        }

        for (block, commitment) in blocks.chunks_exact(KECCAK_RATE).zip(state_commitments) {
            let mut buf = [0u8; KECCAK_RATE];
            buf.copy_from_slice(block);
            let index = proposal.leaves.len() as u64;
            proposal.leaves.push(Leaf { input: buf, index, state_commitment: *commitment });
        }
        proposal.data.extend_from_slice(input);
        if finalize {
            proposal.status = ProposalStatus::Finalized { timestamp: now };
        }
        Ok(())
    }

    /// Counter a proposal whose first commitment is wrong.
    pub fn challenge_first_lpp(
        &mut self,
        challenger: Address,
        claimant: Address,
        uuid: u64,
        post: &Leaf,
        post_proof: &[B256],
    ) -> Result<(), LppError> {
        let proposal = self.challengeable(claimant, uuid)?;
        if post.index != 0 {
            return Err(LppError::StatesNotContiguous);
        }
        if !verify_leaf(proposal.root(), post, post_proof) {
            return Err(LppError::InvalidProof);
        }
        let mut state = [0u64; 25];
        absorb(&mut state, &post.input);
        if state_commitment(&state) == post.state_commitment {
            return Err(LppError::PostStateMatches);
        }
        self.counter(challenger, claimant, uuid);
        Ok(())
    }

    /// Counter a proposal by replaying the permutation between two adjacent leaves.
    #[allow(clippy::too_many_arguments)]
    pub fn challenge_lpp(
        &mut self,
        challenger: Address,
        claimant: Address,
        uuid: u64,
        mut state: StateMatrix,
        pre: &Leaf,
        pre_proof: &[B256],
        post: &Leaf,
        post_proof: &[B256],
    ) -> Result<(), LppError> {
        let proposal = self.challengeable(claimant, uuid)?;
        let root = proposal.root();
        if !verify_leaf(root, pre, pre_proof) || !verify_leaf(root, post, post_proof) {
            return Err(LppError::InvalidProof);
        }
        if pre.index + 1 != post.index {
            return Err(LppError::StatesNotContiguous);
        }
        if state_commitment(&state) != pre.state_commitment {
            return Err(LppError::StatePreimageMismatch);
        }
        absorb(&mut state, &post.input);
        if state_commitment(&state) == post.state_commitment {
            return Err(LppError::PostStateMatches);
        }
        self.counter(challenger, claimant, uuid);
        Ok(())
    }

    /// Finish an unchallenged proposal: store its part and refund the bond.
    #[allow(clippy::too_many_arguments)]
    pub fn squeeze_lpp(
        &mut self,
        claimant: Address,
        uuid: u64,
        mut state: StateMatrix,
        pre: &Leaf,
        pre_proof: &[B256],
        post: &Leaf,
        post_proof: &[B256],
        now: u64,
    ) -> Result<PreimageKey, LppError> {
        let challenge_period = self.lpp_config.challenge_period;
        let proposal = self.proposals.get(&(claimant, uuid)).ok_or(LppError::UnknownProposal)?;
        match proposal.status {
            ProposalStatus::Finalized { timestamp } if now >= timestamp + challenge_period => {}
            ProposalStatus::Finalized { .. } => return Err(LppError::ActiveProposal),
            ProposalStatus::Countered { .. } => return Err(LppError::BadProposal),
            ProposalStatus::Absorbing | ProposalStatus::Squeezed => {
                return Err(LppError::NotFinalized)
            }
        }
        let root = proposal.root();
        if !verify_leaf(root, pre, pre_proof) || !verify_leaf(root, post, post_proof) {
            return Err(LppError::InvalidProof);
        }
        if pre.index + 1 != post.index {
            return Err(LppError::StatesNotContiguous);
        }
        if post.index + 1 != proposal.leaves.len() as u64 {
            return Err(LppError::InvalidLastLeaf);
        }
        if state_commitment(&state) != pre.state_commitment {
            return Err(LppError::StatePreimageMismatch);
        }
        absorb(&mut state, &post.input);
        let key = PreimageKey::new(squeeze(&state), PreimageKeyType::Keccak256);

        let (offset, bond, data) = (proposal.part_offset, proposal.bond, proposal.data.clone());
        self.store_part(key, offset, &data).map_err(|_| LppError::PartOffsetOob)?;
        self.credit(claimant, bond);
        if let Some(p) = self.proposals.get_mut(&(claimant, uuid)) {
            p.status = ProposalStatus::Squeezed;
        }
        Ok(key)
    }

    fn challengeable(&self, claimant: Address, uuid: u64) -> Result<&LargePreimageProposal, LppError> {
        let proposal = self.proposals.get(&(claimant, uuid)).ok_or(LppError::UnknownProposal)?;
        match proposal.status {
            ProposalStatus::Countered { .. } => Err(LppError::BadProposal),
            ProposalStatus::Squeezed => Err(LppError::AlreadyFinalized),
            _ => Ok(proposal),
        }
    }

    fn counter(&mut self, challenger: Address, claimant: Address, uuid: u64) {
        let Some(proposal) = self.proposals.get_mut(&(claimant, uuid)) else { return };
        proposal.status = ProposalStatus::Countered { challenger };
        let bond = std::mem::take(&mut proposal.bond);
        self.credit(challenger, bond);
    }
}
