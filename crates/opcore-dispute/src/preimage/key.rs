use std::fmt;

use alloy_primitives::{keccak256, Address, B256};
use sha2::{Digest, Sha256};

/// Type tag carried in the first byte of a preimage key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PreimageKeyType {
    Local = 1,
    Keccak256 = 2,
    Sha256 = 3,
    Blob = 5,
    Precompile = 6,
}

impl TryFrom<u8> for PreimageKeyType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Local,
            2 => Self::Keccak256,
            3 => Self::Sha256,
            5 => Self::Blob,
            6 => Self::Precompile,
            other => return Err(other),
        })
    }
}

/// A 32-byte preimage key: type byte followed by 31 bytes of hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PreimageKey(B256);

impl PreimageKey {
    /// Replace the first byte of `hash` with the type tag.
    pub fn new(hash: B256, ty: PreimageKeyType) -> Self {
        let mut key = hash;
        key[0] = ty as u8;
        Self(key)
    }

    pub const fn from_raw(raw: B256) -> Self {
        Self(raw)
    }

    /// Local key `ident` as the program asks for it, before localization.
    pub fn local(ident: u64) -> Self {
        let mut key = B256::ZERO;
        key[24..].copy_from_slice(&ident.to_be_bytes());
        key[0] = PreimageKeyType::Local as u8;
        Self(key)
    }

    pub fn keccak256(preimage: &[u8]) -> Self {
        Self::new(keccak256(preimage), PreimageKeyType::Keccak256)
    }

    pub fn sha256(preimage: &[u8]) -> Self {
        Self::new(B256::from_slice(&Sha256::digest(preimage)), PreimageKeyType::Sha256)
    }

    /// Field element `z` of the blob committed to by `commitment`.
    pub fn blob(commitment: &[u8], z: B256) -> Self {
        Self::new(keccak256([commitment, z.as_slice()].concat()), PreimageKeyType::Blob)
    }

    /// Result of the precompile at `address` run on `input` with `required_gas`.
    pub fn precompile(address: Address, required_gas: u64, input: &[u8]) -> Self {
        let hash = keccak256([address.as_slice(), &required_gas.to_be_bytes(), input].concat());
        Self::new(hash, PreimageKeyType::Precompile)
    }

    pub fn key_type(&self) -> Result<PreimageKeyType, u8> {
        PreimageKeyType::try_from(self.0[0])
    }

    pub const fn is_local(&self) -> bool {
        self.0 .0[0] == PreimageKeyType::Local as u8
    }

    /// Bind a local key to one game and sub-game: `keccak(key ‖ game ‖ context)` with the local
    /// type byte. Non-local keys are returned unchanged.
    pub fn localize(self, game: Address, local_context: B256) -> Self {
        if !self.is_local() {
            return self;
        }
        let mut buf = [0u8; 96];
        buf[..32].copy_from_slice(self.0.as_slice());
        buf[44..64].copy_from_slice(game.as_slice());
        buf[64..].copy_from_slice(local_context.as_slice());
        Self::new(keccak256(buf), PreimageKeyType::Local)
    }

    pub const fn as_b256(&self) -> B256 {
        self.0
    }
}

impl From<PreimageKey> for B256 {
    fn from(key: PreimageKey) -> Self {
        key.0
    }
}

impl fmt::Debug for PreimageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PreimageKey({})", self.0)
    }
}

impl fmt::Display for PreimageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}
