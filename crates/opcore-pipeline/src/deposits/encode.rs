//! RLP encoding for deposit transactions (type 0x7E).
//!
//! `0x7E || rlp([source_hash, from, to, mint, value, gas, is_system_tx, data])`
//! Spec: <https://specs.optimism.io/protocol/deposits.html>

use alloy_primitives::{keccak256, B256};
use alloy_rlp::{Encodable, Header, EMPTY_STRING_CODE};

use super::DepositedTransaction;

/// EIP-2718 transaction type for deposits, arbitrarily chosen by OP
pub const DEPOSIT_TX_TYPE: u8 = 0x7E;

fn fields_len(tx: &DepositedTransaction) -> usize {
    tx.source_hash.length() +
        tx.from.length() +
        tx.to.map_or(1, |to| to.length()) +
        tx.mint.length() +
        tx.value.length() +
        tx.gas_limit.length() +
        tx.is_system_tx.length() +
        tx.data.length()
}

/// Encode a deposit transaction into the provided buffer.
pub fn encode_deposit_tx(tx: &DepositedTransaction, out: &mut Vec<u8>) {
    out.push(DEPOSIT_TX_TYPE);
    Header { list: true, payload_length: fields_len(tx) }.encode(out);
    tx.source_hash.encode(out);
    tx.from.encode(out);
    match tx.to {
        Some(to) => to.encode(out),
        // Contract creation: empty string
        None => out.push(EMPTY_STRING_CODE),
    }
    tx.mint.encode(out);
    tx.value.encode(out);
    tx.gas_limit.encode(out);
    tx.is_system_tx.encode(out);
    tx.data.encode(out);
}

/// Compute the keccak256 hash of the encoded deposit transaction.
#[inline]
pub fn tx_hash(tx: &DepositedTransaction) -> B256 {
    let mut buf = Vec::with_capacity(256);
    encode_deposit_tx(tx, &mut buf);
    keccak256(&buf)
}
