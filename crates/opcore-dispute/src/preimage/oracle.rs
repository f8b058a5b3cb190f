//! In-process model of the on-chain preimage oracle: keyed 32-byte parts of
//! `len(8, BE) ‖ preimage`, loaded by type-specific loaders and read back by the VM.

use std::collections::HashMap;

use alloy_eips::eip4844::{env_settings::EnvKzgSettings, kzg_to_versioned_hash};
use alloy_primitives::{address, Address, B256, U256};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use super::{
    key::{PreimageKey, PreimageKeyType},
    lpp::{LargePreimageProposal, LppConfig},
};

/// Field elements per blob.
pub const FIELD_ELEMENTS_PER_BLOB: u64 = 4096;

/// Modulus of the BLS12-381 scalar field.
pub const BLS_MODULUS: U256 = U256::from_be_bytes([
    0x73, 0xed, 0xa7, 0x53, 0x29, 0x9d, 0x7d, 0x48, 0x33, 0x39, 0xd8, 0x08, 0x09, 0xa1, 0xd8, 0x05,
    0x53, 0xbd, 0xa4, 0x02, 0xff, 0xfe, 0x5b, 0xfe, 0xff, 0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x01,
]);

pub const SHA256_PRECOMPILE: Address = address!("0000000000000000000000000000000000000002");
pub const RIPEMD160_PRECOMPILE: Address = address!("0000000000000000000000000000000000000003");
pub const IDENTITY_PRECOMPILE: Address = address!("0000000000000000000000000000000000000004");
pub const POINT_EVALUATION_PRECOMPILE: Address =
    address!("000000000000000000000000000000000000000a");

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OracleError {
    #[error("part offset {offset} is past the end of a {size} byte preimage")]
    PartOffsetOob { offset: u64, size: u64 },
    #[error("no part of {key} loaded at offset {offset}")]
    MissingPart { key: PreimageKey, offset: u64 },
    #[error("local data of {0} bytes does not fit in a word")]
    LocalDataTooLarge(usize),
    #[error("KZG point evaluation proof does not verify")]
    InvalidKzgProof,
    #[error("kzg: {0}")]
    Kzg(String),
    #[error("precompile {0} is not supported")]
    UnsupportedPrecompile(Address),
    #[error("preimage for {0} not found")]
    NotFound(PreimageKey),
    #[error("fetching preimage: {0}")]
    Fetch(String),
    #[error("preimage server is gone")]
    ChannelClosed,
}

impl OracleError {
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Fetch(_))
    }
}

/// The 32-byte window at `offset` into `len(8, BE) ‖ preimage`, and how many of its bytes are
/// real. `None` once the offset is past the end.
pub fn preimage_part(preimage: &[u8], offset: u64) -> Option<([u8; 32], usize)> {
    let total = preimage.len() as u64 + 8;
    if offset >= total {
        return None;
    }
    let prefix = (preimage.len() as u64).to_be_bytes();
    let len = (total - offset).min(32) as usize;
    let mut part = [0u8; 32];
    for (i, byte) in part.iter_mut().take(len).enumerate() {
        let pos = offset as usize + i;
        *byte = if pos < 8 { prefix[pos] } else { preimage[pos - 8] };
    }
    Some((part, len))
}

/// Check `p(z) = y` for the polynomial committed to by `commitment`.
pub fn verify_point_evaluation(
    commitment: &[u8],
    z: B256,
    y: B256,
    proof: &[u8],
) -> Result<bool, OracleError> {
    let kzg = |e: c_kzg::Error| OracleError::Kzg(format!("{e:?}"));
    let commitment = c_kzg::Bytes48::from_bytes(commitment).map_err(kzg)?;
    let proof = c_kzg::Bytes48::from_bytes(proof).map_err(kzg)?;
    let z = c_kzg::Bytes32::from_bytes(z.as_slice()).map_err(kzg)?;
    let y = c_kzg::Bytes32::from_bytes(y.as_slice()).map_err(kzg)?;
    EnvKzgSettings::Default.get().verify_kzg_proof(&commitment, &z, &y, &proof).map_err(kzg)
}

/// Run one of the supported precompiles: `status(1) ‖ output`.
pub fn run_precompile(precompile: Address, input: &[u8]) -> Result<Vec<u8>, OracleError> {
    let output = match precompile {
        SHA256_PRECOMPILE => Some(Sha256::digest(input).to_vec()),
        RIPEMD160_PRECOMPILE => {
            let mut out = vec![0u8; 12];
            out.extend_from_slice(&Ripemd160::digest(input));
            Some(out)
        }
        IDENTITY_PRECOMPILE => Some(input.to_vec()),
        POINT_EVALUATION_PRECOMPILE => point_evaluation(input)?,
        other => return Err(OracleError::UnsupportedPrecompile(other)),
    };
    Ok(match output {
        Some(out) => [&[1u8][..], &out].concat(),
        None => vec![0u8],
    })
}

/// `versioned_hash(32) ‖ z(32) ‖ y(32) ‖ commitment(48) ‖ proof(48)`.
fn point_evaluation(input: &[u8]) -> Result<Option<Vec<u8>>, OracleError> {
    if input.len() != 192 {
        return Ok(None);
    }
    let commitment = &input[96..144];
    if kzg_to_versioned_hash(commitment).as_slice() != &input[..32] {
        return Ok(None);
    }
    let z = B256::from_slice(&input[32..64]);
    let y = B256::from_slice(&input[64..96]);
    if !verify_point_evaluation(commitment, z, y, &input[144..192])? {
        return Ok(None);
    }
    let mut out = U256::from(FIELD_ELEMENTS_PER_BLOB).to_be_bytes_vec();
    out.extend_from_slice(&BLS_MODULUS.to_be_bytes::<32>());
    Ok(Some(out))
}

#[derive(Debug, Clone, Copy)]
struct Part {
    data: [u8; 32],
    len: usize,
}

/// Keyed preimage store shared by every game, plus the large preimage proposals in flight.
#[derive(Debug, Default)]
pub struct PreimageOracle {
    lengths: HashMap<PreimageKey, u64>,
    parts: HashMap<(PreimageKey, u64), Part>,
    pub(super) lpp_config: LppConfig,
    pub(super) proposals: HashMap<(Address, u64), LargePreimageProposal>,
    pub(super) credits: HashMap<Address, U256>,
}

impl PreimageOracle {
    pub fn new(lpp_config: LppConfig) -> Self {
        Self { lpp_config, ..Default::default() }
    }

    /// Read up to 32 bytes at `offset` of the preimage for `key`.
    pub fn read_preimage(&self, key: PreimageKey, offset: u64) -> Result<([u8; 32], usize), OracleError> {
        self.parts
            .get(&(key, offset))
            .map(|p| (p.data, p.len))
            .ok_or(OracleError::MissingPart { key, offset })
    }

    pub fn preimage_length(&self, key: PreimageKey) -> Option<u64> {
        self.lengths.get(&key).copied()
    }

    pub fn credit_of(&self, account: Address) -> U256 {
        self.credits.get(&account).copied().unwrap_or_default()
    }

    pub(super) fn store_part(
        &mut self,
        key: PreimageKey,
        offset: u64,
        preimage: &[u8],
    ) -> Result<(), OracleError> {
        let (data, len) = preimage_part(preimage, offset)
            .ok_or(OracleError::PartOffsetOob { offset, size: preimage.len() as u64 })?;
        self.parts.insert((key, offset), Part { data, len });
        self.lengths.insert(key, preimage.len() as u64);
        Ok(())
    }

    /// Local data for the sub-game identified by `local_context` of the game at `game`: the first
    /// `size` bytes of `word`.
    pub fn load_local_data(
        &mut self,
        game: Address,
        ident: u64,
        local_context: B256,
        word: B256,
        size: usize,
        part_offset: u64,
    ) -> Result<PreimageKey, OracleError> {
        if size > 32 {
            return Err(OracleError::LocalDataTooLarge(size));
        }
        let key = PreimageKey::local(ident).localize(game, local_context);
        self.store_part(key, part_offset, &word[..size])?;
        Ok(key)
    }

    pub fn load_keccak256_preimage_part(
        &mut self,
        part_offset: u64,
        preimage: &[u8],
    ) -> Result<PreimageKey, OracleError> {
        let key = PreimageKey::keccak256(preimage);
        self.store_part(key, part_offset, preimage)?;
        Ok(key)
    }

    pub fn load_sha256_preimage_part(
        &mut self,
        part_offset: u64,
        preimage: &[u8],
    ) -> Result<PreimageKey, OracleError> {
        let key = PreimageKey::sha256(preimage);
        self.store_part(key, part_offset, preimage)?;
        Ok(key)
    }

    /// Field element `y = p(z)` of the blob behind `commitment`, checked with a KZG proof.
    pub fn load_blob_preimage_part(
        &mut self,
        z: B256,
        y: B256,
        commitment: &[u8],
        proof: &[u8],
        part_offset: u64,
    ) -> Result<PreimageKey, OracleError> {
        if !verify_point_evaluation(commitment, z, y, proof)? {
            return Err(OracleError::InvalidKzgProof);
        }
        let key = PreimageKey::blob(commitment, z);
        self.store_part(key, part_offset, y.as_slice())?;
        Ok(key)
    }

    pub fn load_precompile_preimage_part(
        &mut self,
        part_offset: u64,
        precompile: Address,
        required_gas: u64,
        input: &[u8],
    ) -> Result<PreimageKey, OracleError> {
        let result = run_precompile(precompile, input)?;
        let key = PreimageKey::precompile(precompile, required_gas, input);
        self.store_part(key, part_offset, &result)?;
        Ok(key)
    }

    pub(super) fn credit(&mut self, account: Address, amount: U256) {
        *self.credits.entry(account).or_default() += amount;
    }
}

/// Everything needed to put one preimage part into the oracle before a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleUpdate {
    /// Loaded through the game, which knows the local inputs.
    Local { ident: u64 },
    Keccak256(Vec<u8>),
    Sha256(Vec<u8>),
    Blob { z: B256, y: B256, commitment: Vec<u8>, proof: Vec<u8> },
    Precompile { address: Address, required_gas: u64, input: Vec<u8> },
}

impl OracleUpdate {
    pub fn key_type(&self) -> PreimageKeyType {
        match self {
            Self::Local { .. } => PreimageKeyType::Local,
            Self::Keccak256(_) => PreimageKeyType::Keccak256,
            Self::Sha256(_) => PreimageKeyType::Sha256,
            Self::Blob { .. } => PreimageKeyType::Blob,
            Self::Precompile { .. } => PreimageKeyType::Precompile,
        }
    }

    /// Load the part at `offset` of a global preimage. Local data goes through the game instead.
    pub fn apply_global(&self, oracle: &mut PreimageOracle, offset: u64) -> Result<(), OracleError> {
        match self {
            Self::Local { .. } => Ok(()),
            Self::Keccak256(preimage) => oracle.load_keccak256_preimage_part(offset, preimage).map(drop),
            Self::Sha256(preimage) => oracle.load_sha256_preimage_part(offset, preimage).map(drop),
            Self::Blob { z, y, commitment, proof } => {
                oracle.load_blob_preimage_part(*z, *y, commitment, proof, offset).map(drop)
            }
            Self::Precompile { address, required_gas, input } => oracle
                .load_precompile_preimage_part(offset, *address, *required_gas, input)
                .map(drop),
        }
    }
}
