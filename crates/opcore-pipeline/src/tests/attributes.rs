use std::sync::Arc;

use alloy_consensus::Header;
use alloy_primitives::{Address, Sealed, B256, B64};

use super::fixtures::{
    config_update_log, deposit_log, l1_hash, l2_ref, mock_config, receipt,
};
use crate::{
    attributes::{with_batch_transactions, AttributesBuilder, AttributesError},
    config::{RollupConfig, SEQUENCER_FEE_VAULT},
    l1_info::{Hardfork, L1BlockInfo},
    system_config::SystemConfig,
};

fn epoch(number: u64, timestamp: u64) -> Sealed<Header> {
    let header = Header {
        number,
        timestamp,
        parent_hash: l1_hash(number - 1),
        base_fee_per_gas: Some(7_000_000_000),
        mix_hash: B256::repeat_byte(0x77),
        excess_blob_gas: Some(0),
        parent_beacon_block_root: Some(B256::repeat_byte(0xbe)),
        ..Default::default()
    };
    Sealed::new_unchecked(header, l1_hash(number))
}

fn sys() -> SystemConfig {
    let mut sys = SystemConfig::default();
    sys.batcher_address = Address::repeat_byte(0xba);
    sys.gas_limit = 30_000_000;
    sys
}

fn l1_info(attrs: &opcore_types::PayloadAttributes) -> (Hardfork, L1BlockInfo) {
    let tx = &attrs.txs()[0];
    // 0x7E ‖ rlp list; the calldata is the last RLP item.
    let mut buf = &tx[1..];
    let header = alloy_rlp::Header::decode(&mut buf).unwrap();
    assert!(header.list);
    let mut fields = buf;
    for _ in 0..7 {
        let h = alloy_rlp::Header::decode(&mut fields).unwrap();
        fields = &fields[h.payload_length..];
    }
    let data: alloy_primitives::Bytes = alloy_rlp::Decodable::decode(&mut fields).unwrap();
    L1BlockInfo::decode_calldata(&data).unwrap()
}

#[test]
fn test_same_epoch_increments_sequence_number() {
    let builder = AttributesBuilder::new(Arc::new(mock_config()));
    let mut sys = sys();
    let parent = l2_ref(20, 140, 10, 2);

    let attrs = builder.prepare(&mut sys, &parent, &epoch(10, 120), None).unwrap();
    assert_eq!(attrs.timestamp, 142);
    assert_eq!(attrs.txs().len(), 1);
    assert_eq!(attrs.prev_randao, B256::repeat_byte(0x77));
    assert_eq!(attrs.suggested_fee_recipient, SEQUENCER_FEE_VAULT);
    assert_eq!(attrs.no_tx_pool, Some(true));
    assert_eq!(attrs.gas_limit, Some(30_000_000));
    assert_eq!(attrs.withdrawals, None);
    assert_eq!(attrs.parent_beacon_block_root, None);
    assert_eq!(attrs.eip_1559_params, None);

    let (fork, info) = l1_info(&attrs);
    assert_eq!(fork, Hardfork::Bedrock);
    assert_eq!(info.sequence_number, 3);
    assert_eq!(info.number, 10);
    assert_eq!(info.batcher_addr, Address::repeat_byte(0xba));
}

#[test]
fn test_new_epoch_includes_deposits() {
    let builder = AttributesBuilder::new(Arc::new(mock_config()));
    let mut sys = sys();
    let parent = l2_ref(20, 140, 10, 5);
    let receipts = vec![receipt(
        vec![
            deposit_log(Address::repeat_byte(1), Address::repeat_byte(2), 10, false),
            deposit_log(Address::repeat_byte(3), Address::repeat_byte(4), 20, false),
        ],
        true,
    )];

    let attrs = builder.prepare(&mut sys, &parent, &epoch(11, 132), Some(&receipts)).unwrap();
    assert_eq!(attrs.txs().len(), 3);
    assert!(attrs.txs().iter().all(|tx| tx[0] == 0x7E));
    let (_, info) = l1_info(&attrs);
    assert_eq!(info.sequence_number, 0);
    assert_eq!(info.number, 11);
    assert_eq!(info.hash, l1_hash(11));

    let attrs = with_batch_transactions(attrs, vec![super::fixtures::signed_1559(0)]);
    assert_eq!(attrs.txs().len(), 4);
    assert_eq!(attrs.txs()[3][0], 0x02);
}

#[test]
fn test_origin_must_extend_parent_origin() {
    let builder = AttributesBuilder::new(Arc::new(mock_config()));
    let parent = l2_ref(20, 140, 10, 0);

    let err = builder.prepare(&mut sys(), &parent, &epoch(12, 132), Some(&[])).unwrap_err();
    assert!(matches!(err, AttributesError::BrokenOrigin { parent: 10, got: 12 }));

    let mut forked = epoch(11, 132).into_inner();
    forked.parent_hash = B256::repeat_byte(0xff);
    let forked = Sealed::new_unchecked(forked, l1_hash(11));
    let err = builder.prepare(&mut sys(), &parent, &forked, Some(&[])).unwrap_err();
    assert!(matches!(err, AttributesError::OriginHashMismatch { number: 10, .. }));

    let other = Sealed::new_unchecked(epoch(10, 120).into_inner(), B256::repeat_byte(0x01));
    let err = builder.prepare(&mut sys(), &parent, &other, None).unwrap_err();
    assert!(matches!(err, AttributesError::OriginHashMismatch { number: 10, .. }));

    let err = builder.prepare(&mut sys(), &parent, &epoch(11, 132), None).unwrap_err();
    assert!(matches!(err, AttributesError::MissingReceipts));
}

#[test]
fn test_origin_in_future_is_rejected() {
    let builder = AttributesBuilder::new(Arc::new(mock_config()));
    let parent = l2_ref(20, 140, 10, 0);
    let err = builder.prepare(&mut sys(), &parent, &epoch(11, 150), Some(&[])).unwrap_err();
    assert!(matches!(err, AttributesError::OriginInFuture { l2: 142, l1: 150 }));
}

#[test]
fn test_fork_dependent_fields() {
    let cfg = RollupConfig {
        canyon_time: Some(0),
        delta_time: Some(0),
        ecotone_time: Some(0),
        fjord_time: Some(0),
        granite_time: Some(0),
        holocene_time: Some(0),
        ..mock_config()
    };
    let builder = AttributesBuilder::new(Arc::new(cfg));
    let mut sys = sys();
    sys.eip1559_denominator = 250;
    sys.eip1559_elasticity = 6;

    let attrs = builder.prepare(&mut sys, &l2_ref(20, 140, 10, 0), &epoch(10, 120), None).unwrap();
    assert_eq!(attrs.withdrawals, Some(vec![]));
    assert_eq!(attrs.parent_beacon_block_root, Some(B256::repeat_byte(0xbe)));
    assert_eq!(attrs.eip_1559_params, Some(B64::from([0, 0, 0, 250, 0, 0, 0, 6])));

    let (fork, info) = l1_info(&attrs);
    assert_eq!(fork, Hardfork::Ecotone);
    assert_eq!(info.blob_basefee, alloy_primitives::U256::from(1u64));
}

#[test]
fn test_operator_fee_applies_from_next_epoch() {
    let cfg = RollupConfig {
        canyon_time: Some(0),
        delta_time: Some(0),
        ecotone_time: Some(0),
        fjord_time: Some(0),
        granite_time: Some(0),
        holocene_time: Some(0),
        isthmus_time: Some(0),
        ..mock_config()
    };
    let builder = AttributesBuilder::new(Arc::new(cfg));
    let mut sys = sys();

    let mut word = [0u8; 32];
    word[20..24].copy_from_slice(&7u32.to_be_bytes());
    word[24..32].copy_from_slice(&9u64.to_be_bytes());
    let receipts = vec![receipt(vec![config_update_log(5, word)], true)];

    let attrs =
        builder.prepare(&mut sys, &l2_ref(20, 140, 10, 0), &epoch(11, 132), Some(&receipts)).unwrap();
    let (fork, info) = l1_info(&attrs);
    assert_eq!(fork, Hardfork::Isthmus);
    assert_eq!((info.operator_fee_scalar, info.operator_fee_constant), (0, 0));

    // Later blocks of the same epoch still use the old values.
    let attrs = builder.prepare(&mut sys, &l2_ref(21, 142, 11, 0), &epoch(11, 132), None).unwrap();
    assert_eq!(l1_info(&attrs).1.operator_fee_scalar, 0);

    let attrs =
        builder.prepare(&mut sys, &l2_ref(22, 144, 11, 1), &epoch(12, 144), Some(&[])).unwrap();
    let (_, info) = l1_info(&attrs);
    assert_eq!((info.operator_fee_scalar, info.operator_fee_constant), (7, 9));
}
