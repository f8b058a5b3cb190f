use crate::deposits::{
    compute_source_hash, compute_upgrade_source_hash, deposits_from_receipts,
    encode::{encode_deposit_tx, tx_hash},
    DepositedTransaction, DEPOSIT_TX_TYPE, TRANSACTION_DEPOSITED_TOPIC,
};
use alloy_primitives::{address, keccak256, Address, Bytes, B256, U256};
use alloy_rlp::Decodable;

use super::fixtures::{deposit_log, receipt, PORTAL};

fn mock_deposit() -> DepositedTransaction {
    DepositedTransaction {
        source_hash: B256::repeat_byte(0xab),
        from: Address::repeat_byte(0x01),
        to: Some(Address::repeat_byte(0x02)),
        mint: U256::from(1000),
        value: U256::from(500),
        gas_limit: 100_000,
        is_system_tx: false,
        data: Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]),
    }
}

#[test]
fn test_deposit_event_topic() {
    let expected = keccak256("TransactionDeposited(address,address,uint256,bytes)");
    assert_eq!(TRANSACTION_DEPOSITED_TOPIC, expected);
}

#[test]
fn test_source_hash_domains_differ() {
    let block_hash = B256::repeat_byte(0x01);
    let user = compute_source_hash(block_hash, 5);
    assert_ne!(user, B256::ZERO);
    assert_ne!(user, compute_source_hash(block_hash, 6));
    assert_ne!(user, crate::l1_info::compute_l1_info_source_hash(block_hash, 5));
    assert_ne!(
        compute_upgrade_source_hash("Ecotone: L1 Block Deployment"),
        compute_upgrade_source_hash("Ecotone: Gas Price Oracle Deployment")
    );
}

#[test]
fn test_encode_is_typed_rlp_list() {
    let deposit = mock_deposit();
    let mut buf = Vec::new();
    encode_deposit_tx(&deposit, &mut buf);

    assert_eq!(buf[0], DEPOSIT_TX_TYPE);
    let header = alloy_rlp::Header::decode(&mut &buf[1..]).unwrap();
    assert!(header.list);
    assert_eq!(header.payload_length + header.length(), buf.len() - 1);
    assert_eq!(tx_hash(&deposit), keccak256(&buf));
}

#[test]
fn test_encode_buffer_reuse() {
    let deposit = mock_deposit();
    let mut buf = Vec::new();
    deposit.encode(&mut buf);
    let first = buf.clone();

    buf.clear();
    deposit.encode(&mut buf);
    assert_eq!(buf, first);
    assert_eq!(deposit.to_bytes().as_ref(), first.as_slice());
}

#[test]
fn test_contract_creation_encodes_empty_to() {
    let mut creation = mock_deposit();
    creation.to = None;
    let call = mock_deposit();

    // `to` shrinks from a 21-byte string to the single empty-string byte.
    assert_eq!(call.to_bytes().len() - creation.to_bytes().len(), 20);
    assert_ne!(creation.tx_hash(), call.tx_hash());
}

#[test]
fn test_from_log_decodes_opaque_data() {
    let from = address!("1111111111111111111111111111111111111111");
    let to = address!("2222222222222222222222222222222222222222");
    let log = deposit_log(from, to, 1_000, false);
    let block = B256::repeat_byte(0x33);

    let deposit = DepositedTransaction::from_log(&log.data.data, log.topics(), block, 4).unwrap();
    assert_eq!(deposit.from, from);
    assert_eq!(deposit.to, Some(to));
    assert_eq!(deposit.mint, U256::from(1_000u64));
    assert_eq!(deposit.value, U256::from(7u64));
    assert_eq!(deposit.gas_limit, 50_000);
    assert_eq!(deposit.data.as_ref(), &[0xca, 0xfe]);
    assert_eq!(deposit.source_hash, compute_source_hash(block, 4));

    let creation = deposit_log(from, to, 0, true);
    let deposit =
        DepositedTransaction::from_log(&creation.data.data, creation.topics(), block, 0).unwrap();
    assert_eq!(deposit.to, None);
}

#[test]
fn test_deposits_from_receipts_filters_and_indexes() {
    let a = Address::repeat_byte(0xa);
    let b = Address::repeat_byte(0xb);
    let mut foreign = deposit_log(a, b, 1, false);
    foreign.address = Address::repeat_byte(0xff);

    let receipts = vec![
        receipt(vec![foreign, deposit_log(a, b, 1, false)], true),
        receipt(vec![deposit_log(a, b, 2, false)], false),
        receipt(vec![deposit_log(b, a, 3, false)], true),
    ];
    let block = B256::repeat_byte(0x44);
    let deposits = deposits_from_receipts(&receipts, PORTAL, block).unwrap();

    assert_eq!(deposits.len(), 2);
    assert_eq!(deposits[0].mint, U256::from(1u64));
    assert_eq!(deposits[0].source_hash, compute_source_hash(block, 1));
    assert_eq!(deposits[1].mint, U256::from(3u64));
    assert_eq!(deposits[1].source_hash, compute_source_hash(block, 3));
}
