//! JSON shapes of the `eth_` RPC responses we consume, and their conversions.

use alloy_consensus::{Eip658Value, Header, Receipt};
use alloy_eips::eip4844::calc_blob_gasprice;
use alloy_primitives::{Address, Bytes, Log, Sealed, B256};
use opcore_types::L1BlockRef;
use serde::Deserialize;

/// A block as returned by `eth_getBlockByHash(hash, true)`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlock {
    pub hash: B256,
    #[serde(flatten)]
    pub header: Header,
    #[serde(default)]
    pub transactions: Vec<RpcTransaction>,
}

/// A block header as returned by `eth_getBlockByNumber(n, false)`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcHeader {
    pub hash: B256,
    #[serde(flatten)]
    pub header: Header,
}

impl RpcHeader {
    pub fn block_ref(&self) -> L1BlockRef {
        block_ref(&self.header, self.hash)
    }
}

impl RpcBlock {
    pub fn block_ref(&self) -> L1BlockRef {
        block_ref(&self.header, self.hash)
    }

    pub fn sealed_header(&self) -> Sealed<Header> {
        Sealed::new_unchecked(self.header.clone(), self.hash)
    }
}

fn block_ref(header: &Header, hash: B256) -> L1BlockRef {
    L1BlockRef {
        hash,
        number: header.number,
        parent_hash: header.parent_hash,
        timestamp: header.timestamp,
        blob_base_fee: header.excess_blob_gas.map(calc_blob_gasprice),
        excess_blob_gas: header.excess_blob_gas,
    }
}

/// The transaction fields derivation looks at.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    pub hash: B256,
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(rename = "type", default, with = "alloy_serde::quantity")]
    pub tx_type: u8,
    #[serde(default)]
    pub input: Bytes,
    #[serde(default)]
    pub blob_versioned_hashes: Vec<B256>,
}

impl RpcTransaction {
    pub const BLOB_TX_TYPE: u8 = 3;

    #[inline]
    pub fn is_blob(&self) -> bool {
        self.tx_type == Self::BLOB_TX_TYPE
    }
}

/// A receipt as returned by `eth_getBlockReceipts`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReceipt {
    #[serde(default, with = "alloy_serde::quantity::opt")]
    pub status: Option<u64>,
    #[serde(with = "alloy_serde::quantity")]
    pub cumulative_gas_used: u64,
    #[serde(default)]
    pub logs: Vec<Log>,
}

impl From<RpcReceipt> for Receipt {
    fn from(r: RpcReceipt) -> Self {
        Receipt {
            // Pre-Byzantium receipts carry no status; treat them as successful.
            status: Eip658Value::Eip658(r.status.map_or(true, |s| s == 1)),
            cumulative_gas_used: r.cumulative_gas_used,
            logs: r.logs,
        }
    }
}
