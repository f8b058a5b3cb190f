//! Singular batch: the non-deposit transactions of exactly one L2 block.

use alloy_primitives::{Bytes, B256};
use alloy_rlp::{Decodable, Encodable, RlpDecodable, RlpEncodable};
use opcore_types::{BlockId, L1BlockRef, L2BlockRef};
use tracing::debug;

use super::{has_invalid_transactions, BatchError, BatchValidity};
use crate::config::RollupConfig;

/// `rlp([parent_hash, epoch_num, epoch_hash, timestamp, [tx...]])`
#[derive(Debug, Clone, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct SingleBatch {
    pub parent_hash: B256,
    pub epoch_num: u64,
    pub epoch_hash: B256,
    pub timestamp: u64,
    pub transactions: Vec<Bytes>,
}

impl SingleBatch {
    pub fn decode(mut data: &[u8]) -> Result<Self, BatchError> {
        let batch = <Self as Decodable>::decode(&mut data)?;
        if !data.is_empty() {
            return Err(BatchError::TrailingBytes);
        }
        Ok(batch)
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        <Self as Encodable>::encode(self, out)
    }

    #[inline]
    pub const fn epoch(&self) -> BlockId {
        BlockId::new(self.epoch_hash, self.epoch_num)
    }

    /// If any transactions are empty or deposits.
    pub fn has_invalid_transactions(&self) -> bool {
        has_invalid_transactions(&self.transactions)
    }

    /// Validate the batch timestamp against the safe head.
    pub fn check_batch_timestamp(
        &self,
        cfg: &RollupConfig,
        l2_safe_head: &L2BlockRef,
        inclusion_block: &L1BlockRef,
    ) -> BatchValidity {
        let next_timestamp = l2_safe_head.timestamp + cfg.block_time;
        let holocene = cfg.is_holocene_active(inclusion_block.timestamp);
        if self.timestamp > next_timestamp {
            return if holocene { BatchValidity::Drop } else { BatchValidity::Future };
        }
        if self.timestamp < next_timestamp {
            return if holocene { BatchValidity::Past } else { BatchValidity::Drop };
        }
        BatchValidity::Accept
    }

    /// Check the batch against the safe head and the L1 blocks starting at the current epoch.
    ///
    /// <https://specs.optimism.io/protocol/derivation.html#batch-queue>
    pub fn check_batch(
        &self,
        cfg: &RollupConfig,
        l1_blocks: &[L1BlockRef],
        l2_safe_head: &L2BlockRef,
        inclusion_block: &L1BlockRef,
    ) -> BatchValidity {
        let Some(epoch) = l1_blocks.first() else {
            return BatchValidity::Undecided;
        };

        let ts = self.check_batch_timestamp(cfg, l2_safe_head, inclusion_block);
        if !ts.is_accept() {
            return ts;
        }

        // The timestamp is right, so it must build on the safe head.
        if self.parent_hash != l2_safe_head.hash {
            debug!(target: "opcore::derive", parent = %self.parent_hash, "batch does not extend safe head");
            return BatchValidity::Drop;
        }

        // Included too late.
        if self.epoch_num + cfg.seq_window_size < inclusion_block.number {
            return BatchValidity::Drop;
        }

        let batch_origin = if self.epoch_num == epoch.number {
            epoch
        } else if self.epoch_num == epoch.number + 1 {
            // Without the next L1 block validity cannot be decided yet.
            match l1_blocks.get(1) {
                Some(next) => next,
                None => return BatchValidity::Undecided,
            }
        } else {
            return BatchValidity::Drop;
        };

        if self.epoch_hash != batch_origin.hash {
            return BatchValidity::Drop;
        }
        if self.timestamp < batch_origin.timestamp {
            return BatchValidity::Drop;
        }

        let Some(max) = batch_origin.timestamp.checked_add(cfg.max_sequencer_drift(batch_origin.timestamp))
        else {
            return BatchValidity::Drop;
        };
        if self.timestamp > max {
            if !self.transactions.is_empty() {
                return BatchValidity::Drop;
            }
            // An empty batch past the drift is only fine while the next origin is not yet
            // eligible.
            if epoch.number == batch_origin.number {
                match l1_blocks.get(1) {
                    None => return BatchValidity::Undecided,
                    Some(next) if self.timestamp >= next.timestamp => return BatchValidity::Drop,
                    Some(_) => {}
                }
            }
        }

        if self.has_invalid_transactions() {
            return BatchValidity::Drop;
        }

        BatchValidity::Accept
    }
}
