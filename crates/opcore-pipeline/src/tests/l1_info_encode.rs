use crate::l1_info::{
    encode::{
        encode_bedrock, encode_ecotone, encode_isthmus, BEDROCK_SELECTOR, ECOTONE_SELECTOR,
        ISTHMUS_SELECTOR,
    },
    L1BlockInfo, BEDROCK_L1_INFO_TX_CALLDATA_LEN, ECOTONE_L1_INFO_TX_CALLDATA_LEN,
    ISTHMUS_L1_INFO_TX_CALLDATA_LEN,
};
use alloy_primitives::{address, B256, U256};

fn test_info() -> L1BlockInfo {
    L1BlockInfo {
        number: 0x123456789ABCDEF0,
        timestamp: 0xFEDCBA9876543210,
        basefee: U256::from(0xAABBCCDDu64),
        hash: B256::repeat_byte(0x42),
        sequence_number: 0x1111222233334444,
        batcher_addr: address!("1234567890123456789012345678901234567890"),
        l1_fee_overhead: U256::from(188u64),
        l1_fee_scalar: U256::from(684_000u64),
        blob_basefee: U256::from(0x55667788u64),
        basefee_scalar: 0xAABBCCDD,
        blob_basefee_scalar: 0x11223344,
        operator_fee_scalar: 0xDEADBEEF,
        operator_fee_constant: 0xCAFEBABE12345678,
    }
}

#[test]
fn test_bedrock_word_layout() {
    let info = test_info();
    let mut buf = Vec::new();
    encode_bedrock(&info, &mut buf);

    assert_eq!(buf.len(), BEDROCK_L1_INFO_TX_CALLDATA_LEN);
    assert_eq!(&buf[0..4], &BEDROCK_SELECTOR);
    assert_eq!(&buf[28..36], &info.number.to_be_bytes());
    assert_eq!(&buf[60..68], &info.timestamp.to_be_bytes());
    assert_eq!(&buf[100..132], info.hash.as_slice());
    assert_eq!(&buf[156..164], &info.sequence_number.to_be_bytes());
    // batcherHash is the address left-padded
    assert_eq!(&buf[164..176], &[0u8; 12]);
    assert_eq!(&buf[176..196], info.batcher_addr.as_slice());
    assert_eq!(&buf[228..260], &info.l1_fee_scalar.to_be_bytes::<32>());
}

#[test]
fn test_ecotone_field_positions() {
    let info = test_info();
    let mut buf = Vec::new();
    encode_ecotone(&info, &mut buf);

    assert_eq!(buf.len(), ECOTONE_L1_INFO_TX_CALLDATA_LEN);
    assert_eq!(&buf[0..4], &ECOTONE_SELECTOR);
    assert_eq!(&buf[4..8], &info.basefee_scalar.to_be_bytes());
    assert_eq!(&buf[8..12], &info.blob_basefee_scalar.to_be_bytes());
    assert_eq!(&buf[12..20], &info.sequence_number.to_be_bytes());
    assert_eq!(&buf[20..28], &info.timestamp.to_be_bytes());
    assert_eq!(&buf[28..36], &info.number.to_be_bytes());
    assert_eq!(&buf[36..68], &info.basefee.to_be_bytes::<32>());
    assert_eq!(&buf[68..100], &info.blob_basefee.to_be_bytes::<32>());
    assert_eq!(&buf[100..132], info.hash.as_slice());
    assert_eq!(&buf[132..144], &[0u8; 12]);
    assert_eq!(&buf[144..164], info.batcher_addr.as_slice());
}

#[test]
fn test_isthmus_operator_fee_fields() {
    let info = test_info();
    let mut buf = Vec::new();
    encode_isthmus(&info, &mut buf);

    assert_eq!(buf.len(), ISTHMUS_L1_INFO_TX_CALLDATA_LEN);
    assert_eq!(&buf[0..4], &ISTHMUS_SELECTOR);
    assert_eq!(&buf[164..168], &info.operator_fee_scalar.to_be_bytes());
    assert_eq!(&buf[168..176], &info.operator_fee_constant.to_be_bytes());
}

#[test]
fn test_isthmus_extends_ecotone() {
    let info = test_info();
    let mut ecotone = Vec::new();
    let mut isthmus = Vec::new();
    encode_ecotone(&info, &mut ecotone);
    encode_isthmus(&info, &mut isthmus);

    assert_eq!(&ecotone[4..], &isthmus[4..164]);
}

#[test]
fn test_buffer_reuse() {
    let info = test_info();
    let mut buf = Vec::with_capacity(512);

    encode_ecotone(&info, &mut buf);
    let first = buf.clone();

    buf.clear();
    encode_ecotone(&info, &mut buf);

    assert_eq!(buf, first);
}
