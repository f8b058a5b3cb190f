//! `TransactionDeposited` log decoding and deposit source hashes.

use alloy_primitives::{keccak256, Bytes, B256, U256};
use alloy_sol_types::{sol, SolEvent};

use super::{DepositError, DepositedTransaction};

sol! {
    /// Emitted by the portal for every L1 to L2 deposit.
    #[derive(Debug)]
    event TransactionDeposited(
        address indexed from,
        address indexed to,
        uint256 indexed version,
        bytes opaqueData
    );
}

pub const TRANSACTION_DEPOSITED_TOPIC: B256 = B256::new(TransactionDeposited::SIGNATURE_HASH.0);

/// `mint(32) ++ value(32) ++ gas(8) ++ isCreation(1)`, followed by calldata.
const OPAQUE_HEADER_LEN: usize = 73;

/// Source-hash domains.
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub(crate) enum SourceDomain {
    UserDeposit = 0,
    L1Info = 1,
    Upgrade = 2,
}

impl SourceDomain {
    /// `keccak256(bytes32(domain) ++ inner)`
    pub(crate) fn hash(self, inner: B256) -> B256 {
        let mut input = [0u8; 64];
        input[31] = self as u8;
        input[32..].copy_from_slice(inner.as_slice());
        keccak256(input)
    }

    /// Deposits anchored to an L1 block: `inner = keccak256(block_hash ++ bytes32(index))`.
    pub(crate) fn hash_block_index(self, block_hash: B256, index: u64) -> B256 {
        let mut id = [0u8; 64];
        id[..32].copy_from_slice(block_hash.as_slice());
        id[56..].copy_from_slice(&index.to_be_bytes());
        self.hash(keccak256(id))
    }
}

pub(super) fn from_log(
    log_data: &[u8],
    topics: &[B256],
    l1_block_hash: B256,
    log_index: u64,
) -> Result<DepositedTransaction, DepositError> {
    let log = TransactionDeposited::decode_raw_log(topics.iter().copied(), log_data)?;
    if log.version != U256::ZERO {
        return Err(DepositError::UnsupportedVersion(log.version));
    }

    let opaque: &[u8] = log.opaqueData.as_ref();
    let Some((header, calldata)) = opaque.split_at_checked(OPAQUE_HEADER_LEN) else {
        return Err(DepositError::InvalidOpaqueDataLength(opaque.len()));
    };
    let (mint, rest) = header.split_at(32);
    let (value, rest) = rest.split_at(32);
    let (gas, creation) = rest.split_at(8);
    let mut gas_limit = [0u8; 8];
    gas_limit.copy_from_slice(gas);

    Ok(DepositedTransaction {
        source_hash: compute_source_hash(l1_block_hash, log_index),
        from: log.from,
        to: (creation[0] == 0).then_some(log.to),
        mint: U256::from_be_slice(mint),
        value: U256::from_be_slice(value),
        gas_limit: u64::from_be_bytes(gas_limit),
        is_system_tx: false,
        data: Bytes::copy_from_slice(calldata),
    })
}

/// Source hash of a user deposit, keyed by the log's position in its L1 block.
pub fn compute_source_hash(l1_block_hash: B256, log_index: u64) -> B256 {
    SourceDomain::UserDeposit.hash_block_index(l1_block_hash, log_index)
}

/// Source hash of a network-upgrade transaction.
pub fn compute_upgrade_source_hash(intent: &str) -> B256 {
    SourceDomain::Upgrade.hash(keccak256(intent.as_bytes()))
}
