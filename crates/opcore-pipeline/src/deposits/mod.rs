//! Deposited transactions: user deposits read from portal logs, plus the system deposits the
//! node injects itself. All of them encode as type `0x7E`.

pub mod encode;
pub mod parse;

use alloy_consensus::Receipt;
use alloy_primitives::{Address, Bytes, B256, U256};
use serde::Serialize;
use thiserror::Error;

pub use encode::DEPOSIT_TX_TYPE;
pub use parse::{compute_source_hash, compute_upgrade_source_hash, TRANSACTION_DEPOSITED_TOPIC};

#[derive(Debug, Error)]
pub enum DepositError {
    #[error("invalid opaque data length: expected at least 73 bytes, got {0}")]
    InvalidOpaqueDataLength(usize),
    #[error("unsupported deposit version: {0}")]
    UnsupportedVersion(U256),
    #[error("failed to decode log: {0}")]
    DecodeError(#[from] alloy_sol_types::Error),
}

/// Collect the user deposits emitted by `deposit_contract` in one L1 block.
///
/// Log indices count every log of the block, so reverted receipts (which carry no logs) do not
/// shift them.
pub fn deposits_from_receipts(
    receipts: &[Receipt],
    deposit_contract: Address,
    l1_block_hash: B256,
) -> Result<Vec<DepositedTransaction>, DepositError> {
    let mut out = Vec::new();
    let mut log_index = 0u64;
    for receipt in receipts {
        let ok = receipt.status.coerce_status();
        for log in &receipt.logs {
            let index = log_index;
            log_index += 1;
            if !ok ||
                log.address != deposit_contract ||
                log.topics().first() != Some(&TRANSACTION_DEPOSITED_TOPIC)
            {
                continue;
            }
            out.push(DepositedTransaction::from_log(
                &log.data.data,
                log.topics(),
                l1_block_hash,
                index,
            )?);
        }
    }
    Ok(out)
}

/// A deposit ready to be placed in L2 payload attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DepositedTransaction {
    pub source_hash: B256,
    pub from: Address,
    pub to: Option<Address>,
    pub mint: U256,
    pub value: U256,
    pub gas_limit: u64,
    pub is_system_tx: bool,
    pub data: Bytes,
}

impl DepositedTransaction {
    /// Decode a version 0 `TransactionDeposited` log found at `log_index` of `l1_block_hash`.
    pub fn from_log(
        log_data: &[u8],
        topics: &[B256],
        l1_block_hash: B256,
        log_index: u64,
    ) -> Result<Self, DepositError> {
        parse::from_log(log_data, topics, l1_block_hash, log_index)
    }

    /// Appends `0x7E ++ rlp([source_hash, from, to, mint, value, gas, is_system_tx, data])`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        encode::encode_deposit_tx(self, out)
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = Vec::with_capacity(256);
        self.encode(&mut buf);
        Bytes::from(buf)
    }

    pub fn tx_hash(&self) -> B256 {
        encode::tx_hash(self)
    }
}
