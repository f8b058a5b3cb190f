//! Shared builders for pipeline tests.
use alloy_consensus::{Eip658Value, Receipt, SignableTransaction, TxEip1559, TxEnvelope, TxLegacy};
use alloy_eips::eip2718::Encodable2718;
use alloy_primitives::{
    address, keccak256, Address, Bytes, Log, LogData, Signature, TxKind, B256, U256,
};
use alloy_sol_types::SolValue;
use opcore_types::{BlockId, L1BlockRef, L2BlockRef};

use crate::{
    config::RollupConfig, deposits::TRANSACTION_DEPOSITED_TOPIC,
    system_config::CONFIG_UPDATE_TOPIC,
};

pub const PORTAL: Address = address!("bEb5Fc579115071764c7423A4f12eDde41f106Ed");
pub const SYSTEM_CONFIG: Address = address!("229047fed2591dbec1eF1118d64F7aF3dB9EB290");
pub const CHAIN_ID: u64 = 10;

/// Bedrock-only chain with 2s blocks and L2 genesis at time 0.
pub fn mock_config() -> RollupConfig {
    RollupConfig {
        block_time: 2,
        max_sequencer_drift: 600,
        seq_window_size: 100,
        channel_timeout: 30,
        l1_chain_id: 1,
        l2_chain_id: CHAIN_ID,
        regolith_time: Some(0),
        deposit_contract_address: PORTAL,
        l1_system_config_address: SYSTEM_CONFIG,
        ..Default::default()
    }
}

pub fn l1_hash(number: u64) -> B256 {
    keccak256(number.to_be_bytes())
}

pub fn l1_ref(number: u64, timestamp: u64) -> L1BlockRef {
    L1BlockRef {
        hash: l1_hash(number),
        number,
        parent_hash: l1_hash(number.wrapping_sub(1)),
        timestamp,
        ..Default::default()
    }
}

pub fn l2_ref(number: u64, timestamp: u64, origin: u64, sequence_number: u64) -> L2BlockRef {
    L2BlockRef {
        hash: keccak256([b"l2".as_slice(), &number.to_be_bytes()].concat()),
        number,
        parent_hash: keccak256([b"l2".as_slice(), &(number.wrapping_sub(1)).to_be_bytes()].concat()),
        timestamp,
        l1_origin: BlockId::new(l1_hash(origin), origin),
        sequence_number,
    }
}

/// An EIP-1559 transfer with a syntactically valid, unverified signature.
pub fn signed_1559(nonce: u64) -> Bytes {
    let tx = TxEip1559 {
        chain_id: CHAIN_ID,
        nonce,
        gas_limit: 21_000,
        max_fee_per_gas: 2_000_000_000,
        max_priority_fee_per_gas: 1_000_000,
        to: TxKind::Call(Address::repeat_byte(0x42)),
        value: U256::from(nonce + 1),
        access_list: Default::default(),
        input: Bytes::from(vec![0xab; nonce as usize % 7]),
    };
    let sig = Signature::new(U256::from(nonce + 1), U256::from(2u64), nonce % 2 == 1);
    TxEnvelope::from(tx.into_signed(sig)).encoded_2718().into()
}

/// A legacy transaction, EIP-155 protected or not.
pub fn signed_legacy(nonce: u64, protected: bool) -> Bytes {
    let tx = TxLegacy {
        chain_id: protected.then_some(CHAIN_ID),
        nonce,
        gas_price: 1_000_000_000,
        gas_limit: 50_000,
        to: TxKind::Create,
        value: U256::ZERO,
        input: Bytes::from_static(&[0x60, 0x80]),
    };
    let sig = Signature::new(U256::from(3u64), U256::from(4u64), false);
    TxEnvelope::from(tx.into_signed(sig)).encoded_2718().into()
}

pub fn receipt(logs: Vec<Log>, ok: bool) -> Receipt {
    Receipt { status: Eip658Value::Eip658(ok), cumulative_gas_used: 21_000, logs }
}

/// A `TransactionDeposited` log as the portal emits it.
pub fn deposit_log(from: Address, to: Address, mint: u64, creation: bool) -> Log {
    let mut opaque = Vec::new();
    opaque.extend_from_slice(&U256::from(mint).to_be_bytes::<32>());
    opaque.extend_from_slice(&U256::from(7u64).to_be_bytes::<32>());
    opaque.extend_from_slice(&50_000u64.to_be_bytes());
    opaque.push(creation as u8);
    opaque.extend_from_slice(&[0xca, 0xfe]);

    let topics = vec![
        TRANSACTION_DEPOSITED_TOPIC,
        B256::left_padding_from(from.as_slice()),
        B256::left_padding_from(to.as_slice()),
        B256::ZERO,
    ];
    let data = Bytes::from(opaque).abi_encode();
    Log { address: PORTAL, data: LogData::new_unchecked(topics, data.into()) }
}

/// A `ConfigUpdate` log of the given kind carrying one 32-byte word.
pub fn config_update_log(kind: u8, word: [u8; 32]) -> Log {
    let topics = vec![CONFIG_UPDATE_TOPIC, B256::ZERO, B256::from(U256::from(kind))];
    let data = Bytes::from(word.to_vec()).abi_encode();
    Log { address: SYSTEM_CONFIG, data: LogData::new_unchecked(topics, data.into()) }
}
