//! The L1 attributes deposit that opens every L2 block.
//!
//! Its calldata carries the epoch's L1 origin and fee parameters into the `L1Block`
//! predeploy. Three layouts exist: ABI-encoded for Bedrock (260 bytes) and packed for
//! Ecotone (164 bytes) and Isthmus (176 bytes, with operator fee fields).
//!
//! Spec: https://specs.optimism.io/protocol/deposits.html#l1-attributes-deposited-transaction

pub(crate) mod encode;

use alloy_primitives::{address, Address, Bytes, B256, U256};

use crate::deposits::{parse::SourceDomain, DepositedTransaction};

pub use encode::{
    BEDROCK_L1_INFO_TX_CALLDATA_LEN, ECOTONE_L1_INFO_TX_CALLDATA_LEN,
    ISTHMUS_L1_INFO_TX_CALLDATA_LEN,
};

pub const L1_ATTRIBUTES_DEPOSITOR: Address = address!("DeaDDEaDDeAdDeAdDEAdDEaddeAddEAdDEAd0001");
pub const L1_BLOCK_ADDRESS: Address = address!("4200000000000000000000000000000000000015");
pub const L1_INFO_TX_GAS: u64 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum L1InfoError {
    #[error("unknown L1 info selector {0:02x?}")]
    UnknownSelector([u8; 4]),
    #[error("invalid calldata length for {fork:?}: expected {expected}, got {got}")]
    InvalidLength { fork: Hardfork, expected: usize, got: usize },
    #[error("value out of range in field {0}")]
    Overflow(&'static str),
}

/// Calldata layout of the L1 attributes deposit, selected by the active fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Hardfork {
    #[default]
    Bedrock,
    Ecotone,
    Isthmus,
}

impl Hardfork {
    pub const fn l1_info_selector(&self) -> [u8; 4] {
        match self {
            Self::Bedrock => encode::BEDROCK_SELECTOR,
            Self::Ecotone => encode::ECOTONE_SELECTOR,
            Self::Isthmus => encode::ISTHMUS_SELECTOR,
        }
    }

    pub const fn l1_info_calldata_len(&self) -> usize {
        match self {
            Self::Bedrock => BEDROCK_L1_INFO_TX_CALLDATA_LEN,
            Self::Ecotone => ECOTONE_L1_INFO_TX_CALLDATA_LEN,
            Self::Isthmus => ISTHMUS_L1_INFO_TX_CALLDATA_LEN,
        }
    }

    /// Layout named by the leading selector, if any.
    pub fn from_l1_info_calldata(data: &[u8]) -> Option<Self> {
        [Self::Bedrock, Self::Ecotone, Self::Isthmus]
            .into_iter()
            .find(|fork| data.get(..4) == Some(&fork.l1_info_selector()[..]))
    }
}

/// Values written by the L1 attributes deposit.
///
/// `l1_fee_overhead` and `l1_fee_scalar` only exist in the Bedrock layout; the blob and scalar
/// fields arrive with Ecotone and the operator fee pair with Isthmus. Fields a layout does not
/// carry stay zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct L1BlockInfo {
    pub number: u64,
    pub timestamp: u64,
    pub basefee: U256,
    pub hash: B256,
    /// Position of the L2 block within its epoch.
    pub sequence_number: u64,
    pub batcher_addr: Address,
    pub l1_fee_overhead: U256,
    pub l1_fee_scalar: U256,
    pub blob_basefee: U256,
    pub basefee_scalar: u32,
    pub blob_basefee_scalar: u32,
    pub operator_fee_scalar: u32,
    pub operator_fee_constant: u64,
}

impl L1BlockInfo {
    /// Ecotone-shaped info; Bedrock and Isthmus extras are added with the `with_*` setters.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        number: u64,
        timestamp: u64,
        basefee: U256,
        hash: B256,
        sequence_number: u64,
        batcher_addr: Address,
        blob_basefee: U256,
        basefee_scalar: u32,
        blob_basefee_scalar: u32,
    ) -> Self {
        Self {
            number,
            timestamp,
            basefee,
            hash,
            sequence_number,
            batcher_addr,
            blob_basefee,
            basefee_scalar,
            blob_basefee_scalar,
            ..Default::default()
        }
    }

    pub fn with_bedrock_fees(mut self, overhead: U256, scalar: U256) -> Self {
        self.l1_fee_overhead = overhead;
        self.l1_fee_scalar = scalar;
        self
    }

    pub fn with_operator_fees(mut self, scalar: u32, constant: u64) -> Self {
        self.operator_fee_scalar = scalar;
        self.operator_fee_constant = constant;
        self
    }

    pub fn encode(&self, hardfork: Hardfork, out: &mut Vec<u8>) {
        match hardfork {
            Hardfork::Bedrock => encode::encode_bedrock(self, out),
            Hardfork::Ecotone => encode::encode_ecotone(self, out),
            Hardfork::Isthmus => encode::encode_isthmus(self, out),
        }
    }

    pub fn to_calldata(&self, hardfork: Hardfork) -> Bytes {
        let mut buf = Vec::with_capacity(hardfork.l1_info_calldata_len());
        self.encode(hardfork, &mut buf);
        Bytes::from(buf)
    }

    /// Parse L1 info calldata of any supported format.
    pub fn decode_calldata(data: &[u8]) -> Result<(Hardfork, Self), L1InfoError> {
        let fork = Hardfork::from_l1_info_calldata(data).ok_or_else(|| {
            let mut sel = [0u8; 4];
            let n = data.len().min(4);
            sel[..n].copy_from_slice(&data[..n]);
            L1InfoError::UnknownSelector(sel)
        })?;
        let expected = fork.l1_info_calldata_len();
        if data.len() != expected {
            return Err(L1InfoError::InvalidLength { fork, expected, got: data.len() });
        }
        let info = match fork {
            Hardfork::Bedrock => encode::decode_bedrock(data)?,
            Hardfork::Ecotone => encode::decode_packed(data, false),
            Hardfork::Isthmus => encode::decode_packed(data, true),
        };
        Ok((fork, info))
    }

    pub fn source_hash(&self) -> B256 {
        compute_l1_info_source_hash(self.hash, self.sequence_number)
    }

    /// The first transaction of an L2 block in this epoch.
    pub fn to_deposit_tx(&self, hardfork: Hardfork, regolith: bool) -> DepositedTransaction {
        DepositedTransaction {
            source_hash: self.source_hash(),
            from: L1_ATTRIBUTES_DEPOSITOR,
            to: Some(L1_BLOCK_ADDRESS),
            mint: U256::ZERO,
            value: U256::ZERO,
            gas_limit: L1_INFO_TX_GAS,
            // Regolith removed the system-tx gas exemption.
            is_system_tx: !regolith,
            data: self.to_calldata(hardfork),
        }
    }
}

/// Source hash of the L1 attributes deposit at `sequence_number` within the epoch of
/// `l1_block_hash`.
pub fn compute_l1_info_source_hash(l1_block_hash: B256, sequence_number: u64) -> B256 {
    SourceDomain::L1Info.hash_block_index(l1_block_hash, sequence_number)
}
