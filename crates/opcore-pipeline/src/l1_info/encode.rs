//! Encoding for L1 block info calldata.
//!
//! ## Bedrock (ABI, 260 bytes)
//! Selector followed by eight 32-byte words:
//! `number, timestamp, basefee, hash, sequenceNumber, batcherHash, l1FeeOverhead, l1FeeScalar`.
//!
//! ## Ecotone (packed, 164 bytes)
//! <https://specs.optimism.io/protocol/ecotone/l1-attributes.html>
//! ```text
//! | Offset | Size | Field              |
//! |--------|------|--------------------|
//! | 0      | 4    | Function selector  |
//! | 4      | 4    | baseFeeScalar      |
//! | 8      | 4    | blobBaseFeeScalar  |
//! | 12     | 8    | sequenceNumber     |
//! | 20     | 8    | l1BlockTimestamp   |
//! | 28     | 8    | l1BlockNumber      |
//! | 36     | 32   | basefee            |
//! | 68     | 32   | blobBaseFee        |
//! | 100    | 32   | l1BlockHash        |
//! | 132    | 32   | batcherHash        |
//! ```
//!
//! ## Isthmus (packed, 176 bytes)
//! Ecotone layout followed by:
//! ```text
//! | 164    | 4    | operatorFeeScalar   |
//! | 168    | 8    | operatorFeeConstant |
//! ```
//!
//! `batcherHash` is the batcher address left-padded to 32 bytes.

use alloy_primitives::{Address, B256, U256};

use super::{L1BlockInfo, L1InfoError};

// === Function selectors ===

/// setL1BlockValues(uint64,uint64,uint256,bytes32,uint64,bytes32,uint256,uint256)
pub const BEDROCK_SELECTOR: [u8; 4] = [0x01, 0x5d, 0x8e, 0xb9];

/// setL1BlockValuesEcotone()
pub const ECOTONE_SELECTOR: [u8; 4] = [0x44, 0x0a, 0x5e, 0x20];

/// setL1BlockValuesIsthmus()
pub const ISTHMUS_SELECTOR: [u8; 4] = [0x09, 0x89, 0x99, 0xbe];

// === Calldata lengths ===

/// 4 + 8 * 32
pub const BEDROCK_L1_INFO_TX_CALLDATA_LEN: usize = 260;

/// 4 + 4 + 4 + 8 + 8 + 8 + 32 + 32 + 32 + 32
pub const ECOTONE_L1_INFO_TX_CALLDATA_LEN: usize = 164;

/// Ecotone + 4 + 8
pub const ISTHMUS_L1_INFO_TX_CALLDATA_LEN: usize = 176;

#[inline]
fn batcher_hash(addr: Address) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[12..].copy_from_slice(addr.as_slice());
    out
}

#[inline]
fn u64_word(v: u64) -> [u8; 32] {
    U256::from(v).to_be_bytes::<32>()
}

/// Encode L1BlockInfo for Bedrock (ABI words).
pub fn encode_bedrock(info: &L1BlockInfo, out: &mut Vec<u8>) {
    out.reserve(BEDROCK_L1_INFO_TX_CALLDATA_LEN);
    out.extend_from_slice(&BEDROCK_SELECTOR);
    out.extend_from_slice(&u64_word(info.number));
    out.extend_from_slice(&u64_word(info.timestamp));
    out.extend_from_slice(&info.basefee.to_be_bytes::<32>());
    out.extend_from_slice(info.hash.as_slice());
    out.extend_from_slice(&u64_word(info.sequence_number));
    out.extend_from_slice(&batcher_hash(info.batcher_addr));
    out.extend_from_slice(&info.l1_fee_overhead.to_be_bytes::<32>());
    out.extend_from_slice(&info.l1_fee_scalar.to_be_bytes::<32>());
}

fn encode_packed_common(info: &L1BlockInfo, selector: [u8; 4], out: &mut Vec<u8>) {
    out.extend_from_slice(&selector);
    out.extend_from_slice(&info.basefee_scalar.to_be_bytes());
    out.extend_from_slice(&info.blob_basefee_scalar.to_be_bytes());
    out.extend_from_slice(&info.sequence_number.to_be_bytes());
    out.extend_from_slice(&info.timestamp.to_be_bytes());
    out.extend_from_slice(&info.number.to_be_bytes());
    out.extend_from_slice(&info.basefee.to_be_bytes::<32>());
    out.extend_from_slice(&info.blob_basefee.to_be_bytes::<32>());
    out.extend_from_slice(info.hash.as_slice());
    out.extend_from_slice(&batcher_hash(info.batcher_addr));
}

/// Encode L1BlockInfo for Ecotone hardfork (packed).
pub fn encode_ecotone(info: &L1BlockInfo, out: &mut Vec<u8>) {
    out.reserve(ECOTONE_L1_INFO_TX_CALLDATA_LEN);
    encode_packed_common(info, ECOTONE_SELECTOR, out);
}

/// Encode L1BlockInfo for Isthmus hardfork: Ecotone plus operator fee fields.
pub fn encode_isthmus(info: &L1BlockInfo, out: &mut Vec<u8>) {
    out.reserve(ISTHMUS_L1_INFO_TX_CALLDATA_LEN);
    encode_packed_common(info, ISTHMUS_SELECTOR, out);
    out.extend_from_slice(&info.operator_fee_scalar.to_be_bytes());
    out.extend_from_slice(&info.operator_fee_constant.to_be_bytes());
}

#[inline]
fn be_u32(data: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&data[at..at + 4]);
    u32::from_be_bytes(b)
}

#[inline]
fn be_u64(data: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&data[at..at + 8]);
    u64::from_be_bytes(b)
}

#[inline]
fn word(data: &[u8], at: usize) -> U256 {
    U256::from_be_slice(&data[at..at + 32])
}

#[inline]
fn word_u64(data: &[u8], at: usize, field: &'static str) -> Result<u64, L1InfoError> {
    u64::try_from(word(data, at)).map_err(|_| L1InfoError::Overflow(field))
}

/// Decode Bedrock calldata. Length is checked by the caller.
pub fn decode_bedrock(data: &[u8]) -> Result<L1BlockInfo, L1InfoError> {
    Ok(L1BlockInfo {
        number: word_u64(data, 4, "number")?,
        timestamp: word_u64(data, 36, "timestamp")?,
        basefee: word(data, 68),
        hash: B256::from_slice(&data[100..132]),
        sequence_number: word_u64(data, 132, "sequenceNumber")?,
        batcher_addr: Address::from_slice(&data[176..196]),
        l1_fee_overhead: word(data, 196),
        l1_fee_scalar: word(data, 228),
        ..Default::default()
    })
}

/// Decode Ecotone or Isthmus calldata. Length is checked by the caller.
pub fn decode_packed(data: &[u8], isthmus: bool) -> L1BlockInfo {
    let mut info = L1BlockInfo {
        basefee_scalar: be_u32(data, 4),
        blob_basefee_scalar: be_u32(data, 8),
        sequence_number: be_u64(data, 12),
        timestamp: be_u64(data, 20),
        number: be_u64(data, 28),
        basefee: word(data, 36),
        blob_basefee: word(data, 68),
        hash: B256::from_slice(&data[100..132]),
        batcher_addr: Address::from_slice(&data[144..164]),
        ..Default::default()
    };
    if isthmus {
        info.operator_fee_scalar = be_u32(data, 164);
        info.operator_fee_constant = be_u64(data, 168);
    }
    info
}
