//! Preimage keys, the oracle model and the VM's preimage sources.

use alloy_primitives::{keccak256, B256};

mod client;
mod key;
pub mod lpp;
mod oracle;

pub use client::{
    oracle_channel, OracleClient, OracleRequest, OracleServer, PreimageFetcher, PreimageSource,
    PreimageStore,
};
pub use key::{PreimageKey, PreimageKeyType};
pub use lpp::{Leaf, LppConfig, LppError, ProposalStatus};
pub use oracle::{
    preimage_part, run_precompile, verify_point_evaluation, OracleError, OracleUpdate,
    PreimageOracle, IDENTITY_PRECOMPILE, POINT_EVALUATION_PRECOMPILE, RIPEMD160_PRECOMPILE,
    SHA256_PRECOMPILE,
};

/// Idents of the local inputs a game provides to the program.
pub mod local {
    pub const L1_HEAD: u64 = 1;
    pub const STARTING_OUTPUT_ROOT: u64 = 2;
    pub const DISPUTED_OUTPUT_ROOT: u64 = 3;
    pub const DISPUTED_L2_BLOCK_NUMBER: u64 = 4;
    pub const CHAIN_ID: u64 = 5;
}

/// The inputs one execution sub-game runs the program against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalInputs {
    pub l1_head: B256,
    pub starting_output: B256,
    pub disputed_output: B256,
    pub disputed_block: u64,
    pub chain_id: u64,
}

impl LocalInputs {
    /// `keccak(starting ‖ disputed)`: binds local keys to this pair of outputs.
    pub fn local_context(&self) -> B256 {
        keccak256([self.starting_output.as_slice(), self.disputed_output.as_slice()].concat())
    }

    /// Identifies a provider built for exactly these inputs.
    pub fn cache_key(&self) -> B256 {
        keccak256(
            [
                self.l1_head.as_slice(),
                self.starting_output.as_slice(),
                self.disputed_output.as_slice(),
                &self.disputed_block.to_be_bytes(),
                &self.chain_id.to_be_bytes(),
            ]
            .concat(),
        )
    }

    /// The word stored under `ident` and how many of its leading bytes are data.
    pub fn local_data(&self, ident: u64) -> Option<(B256, usize)> {
        let short = |value: u64| {
            let mut word = B256::ZERO;
            word[..8].copy_from_slice(&value.to_be_bytes());
            (word, 8)
        };
        Some(match ident {
            local::L1_HEAD => (self.l1_head, 32),
            local::STARTING_OUTPUT_ROOT => (self.starting_output, 32),
            local::DISPUTED_OUTPUT_ROOT => (self.disputed_output, 32),
            local::DISPUTED_L2_BLOCK_NUMBER => short(self.disputed_block),
            local::CHAIN_ID => short(self.chain_id),
            _ => return None,
        })
    }
}
