use alloy_primitives::B256;
use serde::{Deserialize, Serialize};

/// A `(hash, number)` pair identifying a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId {
    pub hash: B256,
    #[serde(with = "alloy_serde::quantity")]
    pub number: u64,
}

impl BlockId {
    #[inline]
    pub const fn new(hash: B256, number: u64) -> Self {
        Self { hash, number }
    }
}

/// Reference to an L1 block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct L1BlockRef {
    pub hash: B256,
    #[serde(with = "alloy_serde::quantity")]
    pub number: u64,
    pub parent_hash: B256,
    #[serde(with = "alloy_serde::quantity")]
    pub timestamp: u64,
    /// Blob base fee at this block, known post-Cancun.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_base_fee: Option<u128>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excess_blob_gas: Option<u64>,
}

impl L1BlockRef {
    #[inline]
    pub fn id(&self) -> BlockId {
        BlockId::new(self.hash, self.number)
    }

    /// Returns true if `self` is the direct child of `parent`.
    #[inline]
    pub fn is_child_of(&self, parent: &L1BlockRef) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }
}

/// Reference to an L2 block together with its L1 origin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct L2BlockRef {
    pub hash: B256,
    #[serde(with = "alloy_serde::quantity")]
    pub number: u64,
    pub parent_hash: B256,
    #[serde(with = "alloy_serde::quantity")]
    pub timestamp: u64,
    #[serde(rename = "l1origin")]
    pub l1_origin: BlockId,
    /// Number of L2 blocks since the last L1-origin change.
    #[serde(rename = "sequenceNumber", with = "alloy_serde::quantity")]
    pub sequence_number: u64,
}

impl L2BlockRef {
    #[inline]
    pub fn id(&self) -> BlockId {
        BlockId::new(self.hash, self.number)
    }
}

/// Sync status reported by a rollup node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SyncStatus {
    pub current_l1: L1BlockRef,
    pub head_l1: L1BlockRef,
    pub safe_l1: L1BlockRef,
    pub finalized_l1: L1BlockRef,
    pub unsafe_l2: L2BlockRef,
    pub safe_l2: L2BlockRef,
    pub finalized_l2: L2BlockRef,
}

/// Response of `optimism_outputAtBlock`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputResponse {
    pub version: B256,
    pub output_root: B256,
    pub block_ref: L2BlockRef,
    pub withdrawal_storage_root: B256,
    pub state_root: B256,
}
