//! Engine API payload types and the versioned envelope codec replicated by the conductor.
//!
//! ## Envelope wire format
//! ```text
//! | Size     | Field                                             |
//! |----------|---------------------------------------------------|
//! | 1        | version (1, 2, 3, 4)                              |
//! | 32       | parentBeaconBlockRoot (version >= 3)              |
//! | 32       | parentHash                                        |
//! | 20       | feeRecipient                                      |
//! | 32       | stateRoot                                         |
//! | 32       | receiptsRoot                                      |
//! | 256      | logsBloom                                         |
//! | 32       | prevRandao                                        |
//! | 8 * 4    | blockNumber, gasLimit, gasUsed, timestamp         |
//! | 32       | baseFeePerGas                                     |
//! | 32       | blockHash                                         |
//! | 4 + n    | extraData                                         |
//! | 4 + ...  | transactions (count, then 4-byte length + bytes)  |
//! | 4 + 44n  | withdrawals (version >= 2)                        |
//! | 16       | blobGasUsed, excessBlobGas (version >= 3)         |
//! | 32       | withdrawalsRoot (version 4)                       |
//! ```
//! All integers are big-endian.

use alloy_primitives::{Address, Bytes, B256, B64, U256};
use serde::{Deserialize, Serialize};

/// Payload shape, one per engine API generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PayloadVersion {
    /// Bedrock: no withdrawals.
    V1 = 1,
    /// Canyon: withdrawals list.
    V2 = 2,
    /// Ecotone: blob gas fields and parent beacon root.
    V3 = 3,
    /// Isthmus: withdrawals root.
    V4 = 4,
}

impl PayloadVersion {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            3 => Some(Self::V3),
            4 => Some(Self::V4),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadCodecError {
    #[error("empty envelope")]
    Empty,
    #[error("unknown envelope version {0}")]
    UnknownVersion(u8),
    #[error("envelope truncated at {0}")]
    Truncated(&'static str),
    #[error("{0} trailing bytes after envelope")]
    TrailingBytes(usize),
    #[error("payload fields do not match version {0:?}")]
    ShapeMismatch(PayloadVersion),
}

/// A withdrawal as carried in execution payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Withdrawal {
    #[serde(with = "alloy_serde::quantity")]
    pub index: u64,
    #[serde(with = "alloy_serde::quantity")]
    pub validator_index: u64,
    pub address: Address,
    #[serde(with = "alloy_serde::quantity")]
    pub amount: u64,
}

/// Execution payload as exchanged with the engine API. Optional fields are present only for the
/// payload versions that define them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPayload {
    pub parent_hash: B256,
    pub fee_recipient: Address,
    pub state_root: B256,
    pub receipts_root: B256,
    pub logs_bloom: Bytes,
    pub prev_randao: B256,
    #[serde(with = "alloy_serde::quantity")]
    pub block_number: u64,
    #[serde(with = "alloy_serde::quantity")]
    pub gas_limit: u64,
    #[serde(with = "alloy_serde::quantity")]
    pub gas_used: u64,
    #[serde(with = "alloy_serde::quantity")]
    pub timestamp: u64,
    pub extra_data: Bytes,
    pub base_fee_per_gas: U256,
    pub block_hash: B256,
    pub transactions: Vec<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub withdrawals: Option<Vec<Withdrawal>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "alloy_serde::quantity::opt")]
    pub blob_gas_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "alloy_serde::quantity::opt")]
    pub excess_blob_gas: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub withdrawals_root: Option<B256>,
}

impl ExecutionPayload {
    /// The smallest payload version whose shape matches the populated fields.
    pub fn version(&self) -> PayloadVersion {
        if self.withdrawals_root.is_some() {
            PayloadVersion::V4
        } else if self.blob_gas_used.is_some() || self.excess_blob_gas.is_some() {
            PayloadVersion::V3
        } else if self.withdrawals.is_some() {
            PayloadVersion::V2
        } else {
            PayloadVersion::V1
        }
    }

    /// Returns true if the populated fields are exactly the ones `version` defines.
    pub fn matches_version(&self, version: PayloadVersion) -> bool {
        let has_withdrawals = self.withdrawals.is_some();
        let has_blob = self.blob_gas_used.is_some() && self.excess_blob_gas.is_some();
        let partial_blob = self.blob_gas_used.is_some() != self.excess_blob_gas.is_some();
        let has_root = self.withdrawals_root.is_some();
        if partial_blob {
            return false;
        }
        match version {
            PayloadVersion::V1 => !has_withdrawals && !has_blob && !has_root,
            PayloadVersion::V2 => has_withdrawals && !has_blob && !has_root,
            PayloadVersion::V3 => has_withdrawals && has_blob && !has_root,
            PayloadVersion::V4 => has_withdrawals && has_blob && has_root,
        }
    }
}

/// Payload plus the out-of-band parent beacon root introduced with Ecotone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPayloadEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_beacon_block_root: Option<B256>,
    pub execution_payload: ExecutionPayload,
}

const BLOOM_LEN: usize = 256;
const WITHDRAWAL_LEN: usize = 8 + 8 + 20 + 8;

impl ExecutionPayloadEnvelope {
    #[inline]
    pub fn block_hash(&self) -> B256 {
        self.execution_payload.block_hash
    }

    #[inline]
    pub fn block_number(&self) -> u64 {
        self.execution_payload.block_number
    }

    /// Encode the envelope in the versioned wire format.
    pub fn encode(&self) -> Result<Vec<u8>, PayloadCodecError> {
        let p = &self.execution_payload;
        let version = p.version();
        if !p.matches_version(version) {
            return Err(PayloadCodecError::ShapeMismatch(version));
        }
        // V3 onwards requires the beacon root; earlier versions must not carry one.
        let beacon_ok = match version {
            PayloadVersion::V1 | PayloadVersion::V2 => self.parent_beacon_block_root.is_none(),
            PayloadVersion::V3 | PayloadVersion::V4 => self.parent_beacon_block_root.is_some(),
        };
        if !beacon_ok || p.logs_bloom.len() != BLOOM_LEN {
            return Err(PayloadCodecError::ShapeMismatch(version));
        }

        let mut out = Vec::with_capacity(700 + p.transactions.iter().map(|t| t.len() + 4).sum::<usize>());
        out.push(version as u8);
        if let Some(root) = self.parent_beacon_block_root {
            out.extend_from_slice(root.as_slice());
        }
        out.extend_from_slice(p.parent_hash.as_slice());
        out.extend_from_slice(p.fee_recipient.as_slice());
        out.extend_from_slice(p.state_root.as_slice());
        out.extend_from_slice(p.receipts_root.as_slice());
        out.extend_from_slice(&p.logs_bloom);
        out.extend_from_slice(p.prev_randao.as_slice());
        out.extend_from_slice(&p.block_number.to_be_bytes());
        out.extend_from_slice(&p.gas_limit.to_be_bytes());
        out.extend_from_slice(&p.gas_used.to_be_bytes());
        out.extend_from_slice(&p.timestamp.to_be_bytes());
        out.extend_from_slice(&p.base_fee_per_gas.to_be_bytes::<32>());
        out.extend_from_slice(p.block_hash.as_slice());
        put_bytes(&mut out, &p.extra_data);
        out.extend_from_slice(&(p.transactions.len() as u32).to_be_bytes());
        for tx in &p.transactions {
            put_bytes(&mut out, tx);
        }
        if let Some(withdrawals) = &p.withdrawals {
            out.extend_from_slice(&(withdrawals.len() as u32).to_be_bytes());
            for w in withdrawals {
                out.extend_from_slice(&w.index.to_be_bytes());
                out.extend_from_slice(&w.validator_index.to_be_bytes());
                out.extend_from_slice(w.address.as_slice());
                out.extend_from_slice(&w.amount.to_be_bytes());
            }
        }
        if let (Some(used), Some(excess)) = (p.blob_gas_used, p.excess_blob_gas) {
            out.extend_from_slice(&used.to_be_bytes());
            out.extend_from_slice(&excess.to_be_bytes());
        }
        if let Some(root) = p.withdrawals_root {
            out.extend_from_slice(root.as_slice());
        }
        Ok(out)
    }

    /// Decode an envelope from the versioned wire format.
    pub fn decode(data: &[u8]) -> Result<Self, PayloadCodecError> {
        let (&first, rest) = data.split_first().ok_or(PayloadCodecError::Empty)?;
        let version =
            PayloadVersion::from_byte(first).ok_or(PayloadCodecError::UnknownVersion(first))?;
        let mut r = Reader { buf: rest };

        let parent_beacon_block_root =
            if version >= PayloadVersion::V3 { Some(r.b256("parentBeaconBlockRoot")?) } else { None };

        let parent_hash = r.b256("parentHash")?;
        let fee_recipient = Address::from_slice(r.take(20, "feeRecipient")?);
        let state_root = r.b256("stateRoot")?;
        let receipts_root = r.b256("receiptsRoot")?;
        let logs_bloom = Bytes::copy_from_slice(r.take(BLOOM_LEN, "logsBloom")?);
        let prev_randao = r.b256("prevRandao")?;
        let block_number = r.u64("blockNumber")?;
        let gas_limit = r.u64("gasLimit")?;
        let gas_used = r.u64("gasUsed")?;
        let timestamp = r.u64("timestamp")?;
        let base_fee_per_gas = U256::from_be_slice(r.take(32, "baseFeePerGas")?);
        let block_hash = r.b256("blockHash")?;
        let extra_data = r.bytes("extraData")?;

        let tx_count = r.u32("transactions")? as usize;
        let mut transactions = Vec::with_capacity(tx_count.min(4096));
        for _ in 0..tx_count {
            transactions.push(r.bytes("transaction")?);
        }

        let withdrawals = if version >= PayloadVersion::V2 {
            let count = r.u32("withdrawals")? as usize;
            let mut list = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let mut w = Reader { buf: r.take(WITHDRAWAL_LEN, "withdrawal")? };
                list.push(Withdrawal {
                    index: w.u64("withdrawal")?,
                    validator_index: w.u64("withdrawal")?,
                    address: Address::from_slice(w.take(20, "withdrawal")?),
                    amount: w.u64("withdrawal")?,
                });
            }
            Some(list)
        } else {
            None
        };

        let (blob_gas_used, excess_blob_gas) = if version >= PayloadVersion::V3 {
            (Some(r.u64("blobGasUsed")?), Some(r.u64("excessBlobGas")?))
        } else {
            (None, None)
        };

        let withdrawals_root =
            if version == PayloadVersion::V4 { Some(r.b256("withdrawalsRoot")?) } else { None };

        if !r.buf.is_empty() {
            return Err(PayloadCodecError::TrailingBytes(r.buf.len()));
        }

        Ok(Self {
            parent_beacon_block_root,
            execution_payload: ExecutionPayload {
                parent_hash,
                fee_recipient,
                state_root,
                receipts_root,
                logs_bloom,
                prev_randao,
                block_number,
                gas_limit,
                gas_used,
                timestamp,
                extra_data,
                base_fee_per_gas,
                block_hash,
                transactions,
                withdrawals,
                blob_gas_used,
                excess_blob_gas,
                withdrawals_root,
            },
        })
    }
}

fn put_bytes(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], PayloadCodecError> {
        if self.buf.len() < n {
            return Err(PayloadCodecError::Truncated(field));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn b256(&mut self, field: &'static str) -> Result<B256, PayloadCodecError> {
        self.take(32, field).map(B256::from_slice)
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, PayloadCodecError> {
        let raw = self.take(8, field)?;
        Ok(u64::from_be_bytes(raw.try_into().expect("8 bytes")))
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, PayloadCodecError> {
        let raw = self.take(4, field)?;
        Ok(u32::from_be_bytes(raw.try_into().expect("4 bytes")))
    }

    fn bytes(&mut self, field: &'static str) -> Result<Bytes, PayloadCodecError> {
        let len = self.u32(field)? as usize;
        self.take(len, field).map(Bytes::copy_from_slice)
    }
}

/// Payload attributes handed to `engine_forkchoiceUpdated` to start a block build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadAttributes {
    #[serde(with = "alloy_serde::quantity")]
    pub timestamp: u64,
    pub prev_randao: B256,
    pub suggested_fee_recipient: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub withdrawals: Option<Vec<Withdrawal>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_beacon_block_root: Option<B256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transactions: Option<Vec<Bytes>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_tx_pool: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "alloy_serde::quantity::opt")]
    pub gas_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eip_1559_params: Option<B64>,
}

impl PayloadAttributes {
    /// Transactions forced into the block, empty if none.
    #[inline]
    pub fn txs(&self) -> &[Bytes] {
        self.transactions.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkchoiceState {
    pub head_block_hash: B256,
    pub safe_block_hash: B256,
    pub finalized_block_hash: B256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayloadStatusKind {
    Valid,
    Invalid,
    Syncing,
    Accepted,
    InvalidBlockHash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadStatus {
    pub status: PayloadStatusKind,
    #[serde(default)]
    pub latest_valid_hash: Option<B256>,
    #[serde(default)]
    pub validation_error: Option<String>,
}

impl PayloadStatus {
    #[inline]
    pub fn valid(hash: B256) -> Self {
        Self { status: PayloadStatusKind::Valid, latest_valid_hash: Some(hash), validation_error: None }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.status == PayloadStatusKind::Valid
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkchoiceUpdated {
    pub payload_status: PayloadStatus,
    #[serde(default)]
    pub payload_id: Option<B64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_payload(version: PayloadVersion) -> ExecutionPayloadEnvelope {
        let mut payload = ExecutionPayload {
            parent_hash: B256::repeat_byte(0x01),
            fee_recipient: Address::repeat_byte(0x02),
            state_root: B256::repeat_byte(0x03),
            receipts_root: B256::repeat_byte(0x04),
            logs_bloom: Bytes::from(vec![0u8; BLOOM_LEN]),
            prev_randao: B256::repeat_byte(0x05),
            block_number: 42,
            gas_limit: 30_000_000,
            gas_used: 21_000,
            timestamp: 1_700_000_000,
            extra_data: Bytes::from_static(b"opcore"),
            base_fee_per_gas: U256::from(7u64),
            block_hash: B256::repeat_byte(0x06),
            transactions: vec![Bytes::from_static(&[0x7e, 0x01]), Bytes::from_static(&[0x02; 40])],
            ..Default::default()
        };
        let mut beacon = None;
        if version >= PayloadVersion::V2 {
            payload.withdrawals = Some(vec![Withdrawal {
                index: 1,
                validator_index: 2,
                address: Address::repeat_byte(0x09),
                amount: 3,
            }]);
        }
        if version >= PayloadVersion::V3 {
            payload.blob_gas_used = Some(0);
            payload.excess_blob_gas = Some(131072);
            beacon = Some(B256::repeat_byte(0x0b));
        }
        if version == PayloadVersion::V4 {
            payload.withdrawals_root = Some(B256::repeat_byte(0x0c));
        }
        ExecutionPayloadEnvelope { parent_beacon_block_root: beacon, execution_payload: payload }
    }

    #[test]
    fn test_envelope_versions_survive_wire_codec() {
        for version in [PayloadVersion::V1, PayloadVersion::V2, PayloadVersion::V3, PayloadVersion::V4]
        {
            let env = mock_payload(version);
            let encoded = env.encode().unwrap();
            assert_eq!(encoded[0], version as u8);
            assert_eq!(ExecutionPayloadEnvelope::decode(&encoded).unwrap(), env);
        }
    }

    #[test]
    fn test_v3_without_beacon_root_is_rejected() {
        let mut env = mock_payload(PayloadVersion::V3);
        env.parent_beacon_block_root = None;
        assert_eq!(env.encode(), Err(PayloadCodecError::ShapeMismatch(PayloadVersion::V3)));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(ExecutionPayloadEnvelope::decode(&[]), Err(PayloadCodecError::Empty));
        assert_eq!(
            ExecutionPayloadEnvelope::decode(&[9, 1, 2]),
            Err(PayloadCodecError::UnknownVersion(9))
        );
        let mut encoded = mock_payload(PayloadVersion::V1).encode().unwrap();
        encoded.truncate(100);
        assert!(matches!(
            ExecutionPayloadEnvelope::decode(&encoded),
            Err(PayloadCodecError::Truncated(_))
        ));
    }

    #[test]
    fn test_payload_json_uses_engine_field_names() {
        let env = mock_payload(PayloadVersion::V3);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["executionPayload"]["blockNumber"], "0x2a");
        assert!(json["parentBeaconBlockRoot"].is_string());
        let back: ExecutionPayloadEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, env);
    }
}
