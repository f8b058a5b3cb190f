//! Output roots, withdrawal hashes and versioned message nonces.

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_sol_types::SolValue;

/// The only output root version defined so far.
pub const OUTPUT_VERSION_V0: B256 = B256::ZERO;

/// Preimage of an L2 output root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputRootProof {
    pub version: B256,
    pub state_root: B256,
    pub message_passer_storage_root: B256,
    pub block_hash: B256,
}

impl OutputRootProof {
    pub fn v0(state_root: B256, message_passer_storage_root: B256, block_hash: B256) -> Self {
        Self { version: OUTPUT_VERSION_V0, state_root, message_passer_storage_root, block_hash }
    }

    /// `keccak(version ‖ stateRoot ‖ messagePasserStorageRoot ‖ blockHash)`
    pub fn hash(&self) -> B256 {
        output_root(
            self.version,
            self.state_root,
            self.message_passer_storage_root,
            self.block_hash,
        )
    }
}

pub fn output_root(
    version: B256,
    state_root: B256,
    message_passer_storage_root: B256,
    block_hash: B256,
) -> B256 {
    let mut buf = [0u8; 128];
    buf[..32].copy_from_slice(version.as_slice());
    buf[32..64].copy_from_slice(state_root.as_slice());
    buf[64..96].copy_from_slice(message_passer_storage_root.as_slice());
    buf[96..].copy_from_slice(block_hash.as_slice());
    keccak256(buf)
}

/// `keccak(abi.encode(nonce, sender, target, value, gasLimit, data))`
pub fn withdrawal_hash(
    nonce: U256,
    sender: Address,
    target: Address,
    value: U256,
    gas_limit: U256,
    data: &Bytes,
) -> B256 {
    keccak256((nonce, sender, target, value, gas_limit, data.clone()).abi_encode_params())
}

/// Pack a message nonce with its version: version in the high 16 bytes, nonce in the low 16.
pub fn encode_versioned_nonce(nonce: u128, version: u128) -> U256 {
    (U256::from(version) << 128) | U256::from(nonce)
}

/// Split a versioned nonce into `(nonce, version)`.
pub fn decode_versioned_nonce(versioned: U256) -> (u128, u128) {
    let words = versioned.to_be_bytes::<32>();
    let mut hi = [0u8; 16];
    let mut lo = [0u8; 16];
    hi.copy_from_slice(&words[..16]);
    lo.copy_from_slice(&words[16..]);
    (u128::from_be_bytes(lo), u128::from_be_bytes(hi))
}
