//! Span batch: a delta-encoded run of consecutive L2 blocks.
//!
//! ```text
//! prefix  = rel_timestamp ‖ l1_origin_num ‖ parent_check(20) ‖ l1_origin_check(20)
//! payload = block_count ‖ origin_bits ‖ block_tx_counts ‖ txs
//! ```
//! `l1_origin_num` is the origin of the last block; `origin_bits[i]` marks an origin change
//! between block `i-1` and block `i` (bit 0: against the parent block).

use alloy_primitives::{Bytes, FixedBytes};
use opcore_types::{L1BlockRef, L2BlockRef};
use tracing::debug;

use super::{
    has_invalid_transactions,
    span_txs::{decode_txs, encode_txs, read_bitlist, read_varint, write_bitlist, write_varint},
    BatchError, BatchValidity, SingleBatch,
};
use crate::config::{RollupConfig, MAX_SPAN_BATCH_ELEMENTS};

/// One L2 block of a span batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpanBatchElement {
    pub epoch_num: u64,
    pub timestamp: u64,
    pub transactions: Vec<Bytes>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpanBatch {
    /// First 20 bytes of the parent of the first block.
    pub parent_check: FixedBytes<20>,
    /// First 20 bytes of the L1 origin hash of the last block.
    pub l1_origin_check: FixedBytes<20>,
    /// Whether the first block starts a new epoch relative to its parent.
    pub first_origin_changed: bool,
    pub batches: Vec<SpanBatchElement>,
}

impl SpanBatch {
    /// Build a span batch from consecutive singular batches.
    ///
    /// `first_origin_changed` is whether the first block's sequence number is 0.
    pub fn from_singles(singles: &[SingleBatch], first_origin_changed: bool) -> Result<Self, BatchError> {
        let (first, last) = match (singles.first(), singles.last()) {
            (Some(f), Some(l)) => (f, l),
            _ => return Err(BatchError::EmptySpanBatch),
        };
        Ok(Self {
            parent_check: FixedBytes::from_slice(&first.parent_hash[..20]),
            l1_origin_check: FixedBytes::from_slice(&last.epoch_hash[..20]),
            first_origin_changed,
            batches: singles
                .iter()
                .map(|b| SpanBatchElement {
                    epoch_num: b.epoch_num,
                    timestamp: b.timestamp,
                    transactions: b.transactions.clone(),
                })
                .collect(),
        })
    }

    /// Append the next singular batch.
    pub fn push(&mut self, batch: &SingleBatch) {
        if self.batches.is_empty() {
            self.parent_check = FixedBytes::from_slice(&batch.parent_hash[..20]);
        }
        self.l1_origin_check = FixedBytes::from_slice(&batch.epoch_hash[..20]);
        self.batches.push(SpanBatchElement {
            epoch_num: batch.epoch_num,
            timestamp: batch.timestamp,
            transactions: batch.transactions.clone(),
        });
    }

    pub fn starting_timestamp(&self) -> u64 {
        self.batches.first().map_or(0, |b| b.timestamp)
    }

    pub fn final_timestamp(&self) -> u64 {
        self.batches.last().map_or(0, |b| b.timestamp)
    }

    pub fn starting_epoch_num(&self) -> u64 {
        self.batches.first().map_or(0, |b| b.epoch_num)
    }

    pub fn final_epoch_num(&self) -> u64 {
        self.batches.last().map_or(0, |b| b.epoch_num)
    }

    pub fn encode(&self, cfg: &RollupConfig, out: &mut Vec<u8>) -> Result<(), BatchError> {
        let first = self.batches.first().ok_or(BatchError::EmptySpanBatch)?;
        let rel = first
            .timestamp
            .checked_sub(cfg.genesis.l2_time)
            .ok_or(BatchError::TimestampBeforeGenesis)?;

        write_varint(rel, out);
        write_varint(self.final_epoch_num(), out);
        out.extend_from_slice(self.parent_check.as_slice());
        out.extend_from_slice(self.l1_origin_check.as_slice());

        write_varint(self.batches.len() as u64, out);
        let mut origin_bits = Vec::with_capacity(self.batches.len());
        origin_bits.push(self.first_origin_changed);
        for pair in self.batches.windows(2) {
            if pair[1].timestamp != pair[0].timestamp + cfg.block_time {
                return Err(BatchError::NotContiguous);
            }
            origin_bits.push(pair[1].epoch_num != pair[0].epoch_num);
        }
        write_bitlist(&origin_bits, out);

        let mut txs = Vec::new();
        for b in &self.batches {
            write_varint(b.transactions.len() as u64, out);
            txs.extend_from_slice(&b.transactions);
        }
        encode_txs(&txs, out)
    }

    pub fn decode(mut data: &[u8], cfg: &RollupConfig) -> Result<Self, BatchError> {
        let buf = &mut data;
        let rel_timestamp = read_varint(buf, "rel_timestamp")?;
        let l1_origin_num = read_varint(buf, "l1_origin_num")?;
        if buf.len() < 40 {
            return Err(BatchError::BufferTooShort("checks"));
        }
        let parent_check = FixedBytes::from_slice(&buf[..20]);
        let l1_origin_check = FixedBytes::from_slice(&buf[20..40]);
        *buf = &buf[40..];

        let block_count = read_varint(buf, "block_count")?;
        if block_count == 0 {
            return Err(BatchError::EmptySpanBatch);
        }
        if block_count > MAX_SPAN_BATCH_ELEMENTS {
            return Err(BatchError::TooManyElements(block_count));
        }
        let block_count = block_count as usize;
        let origin_bits = read_bitlist(buf, block_count, "origin_bits")?;

        let mut tx_counts = Vec::with_capacity(block_count);
        let mut total = 0u64;
        for _ in 0..block_count {
            let n = read_varint(buf, "block_tx_counts")?;
            total = total.saturating_add(n);
            tx_counts.push(n as usize);
        }
        if total > MAX_SPAN_BATCH_ELEMENTS {
            return Err(BatchError::TooManyElements(total));
        }

        let mut txs = decode_txs(buf, total as usize, cfg.l2_chain_id)?.into_iter();
        if !buf.is_empty() {
            return Err(BatchError::TrailingBytes);
        }

        let changes = origin_bits.iter().skip(1).filter(|b| **b).count() as u64;
        let mut epoch = l1_origin_num
            .checked_sub(changes)
            .ok_or(BatchError::InvalidTransaction("origin bits exceed l1 origin".into()))?;
        let start = cfg.genesis.l2_time + rel_timestamp;

        let mut batches = Vec::with_capacity(block_count);
        for (i, n) in tx_counts.into_iter().enumerate() {
            if i > 0 && origin_bits[i] {
                epoch += 1;
            }
            batches.push(SpanBatchElement {
                epoch_num: epoch,
                timestamp: start + i as u64 * cfg.block_time,
                transactions: txs.by_ref().take(n).collect(),
            });
        }

        Ok(Self { parent_check, l1_origin_check, first_origin_changed: origin_bits[0], batches })
    }

    /// Check the span batch prefix against the safe head.
    ///
    /// `parent` is the L2 block right before the first block of the span: the safe head unless
    /// the span overlaps already-safe blocks.
    pub fn check_batch_prefix(
        &self,
        cfg: &RollupConfig,
        l1_blocks: &[L1BlockRef],
        l2_safe_head: &L2BlockRef,
        parent: &L2BlockRef,
        inclusion_block: &L1BlockRef,
    ) -> BatchValidity {
        if l1_blocks.is_empty() {
            return BatchValidity::Undecided;
        }
        let holocene = cfg.is_holocene_active(inclusion_block.timestamp);

        let next_timestamp = l2_safe_head.timestamp + cfg.block_time;
        if self.starting_timestamp() > next_timestamp {
            return if holocene { BatchValidity::Drop } else { BatchValidity::Future };
        }
        if self.final_timestamp() < next_timestamp {
            return if holocene { BatchValidity::Past } else { BatchValidity::Drop };
        }

        if parent.timestamp + cfg.block_time != self.starting_timestamp() ||
            !parent.hash.as_slice().starts_with(self.parent_check.as_slice())
        {
            debug!(target: "opcore::derive", "span batch parent check failed");
            return BatchValidity::Drop;
        }

        let start_epoch = self.starting_epoch_num();
        if start_epoch + cfg.seq_window_size < inclusion_block.number {
            return BatchValidity::Drop;
        }
        if start_epoch > parent.l1_origin.number + 1 || start_epoch < parent.l1_origin.number {
            return BatchValidity::Drop;
        }

        let end_epoch = self.final_epoch_num();
        match l1_blocks.iter().find(|b| b.number == end_epoch) {
            Some(origin) if !origin.hash.as_slice().starts_with(self.l1_origin_check.as_slice()) => {
                BatchValidity::Drop
            }
            Some(_) => BatchValidity::Accept,
            // Need more L1 blocks to check the origins of the whole span.
            None => BatchValidity::Undecided,
        }
    }

    /// Full check of the span batch. Blocks before `next_timestamp` are already safe and skipped.
    pub fn check_batch(
        &self,
        cfg: &RollupConfig,
        l1_blocks: &[L1BlockRef],
        l2_safe_head: &L2BlockRef,
        parent: &L2BlockRef,
        inclusion_block: &L1BlockRef,
    ) -> BatchValidity {
        let prefix = self.check_batch_prefix(cfg, l1_blocks, l2_safe_head, parent, inclusion_block);
        if !prefix.is_accept() {
            return prefix;
        }

        let next_timestamp = l2_safe_head.timestamp + cfg.block_time;
        for (i, block) in self.batches.iter().enumerate() {
            if block.timestamp < next_timestamp {
                continue;
            }
            let Some(idx) = l1_blocks.iter().position(|b| b.number == block.epoch_num) else {
                return BatchValidity::Drop;
            };
            let origin = &l1_blocks[idx];
            if block.timestamp < origin.timestamp {
                return BatchValidity::Drop;
            }

            let max = origin.timestamp + cfg.max_sequencer_drift(origin.timestamp);
            if block.timestamp > max {
                if !block.transactions.is_empty() {
                    return BatchValidity::Drop;
                }
                let origin_advanced = i == 0 || self.batches[i - 1].epoch_num < block.epoch_num;
                if !origin_advanced {
                    match l1_blocks.get(idx + 1) {
                        None => return BatchValidity::Undecided,
                        Some(next) if block.timestamp >= next.timestamp => {
                            return BatchValidity::Drop;
                        }
                        Some(_) => {}
                    }
                }
            }

            if has_invalid_transactions(&block.transactions) {
                return BatchValidity::Drop;
            }
        }
        BatchValidity::Accept
    }

    /// Split into singular batches, filling epoch hashes from `l1_blocks`.
    ///
    /// Blocks at or before the safe head timestamp are omitted. Parent hashes are left zero: the
    /// batch stage links each block to the safe head as it is emitted.
    pub fn to_singles(
        &self,
        l1_blocks: &[L1BlockRef],
        l2_safe_head: &L2BlockRef,
    ) -> Vec<SingleBatch> {
        self.batches
            .iter()
            .filter(|b| b.timestamp > l2_safe_head.timestamp)
            .map(|b| SingleBatch {
                parent_hash: Default::default(),
                epoch_num: b.epoch_num,
                epoch_hash: l1_blocks
                    .iter()
                    .find(|l1| l1.number == b.epoch_num)
                    .map(|l1| l1.hash)
                    .unwrap_or_default(),
                timestamp: b.timestamp,
                transactions: b.transactions.clone(),
            })
            .collect()
    }
}
