//! Turns a stream of unsafe L2 blocks into frame-carrying transactions.
//!
//! Blocks are queued in order and stay queued until the safe head passes them, so that channels
//! invalidated on L1 (timed out, or reorged away) can be rebuilt from the same blocks. A cursor
//! marks the first block not yet put into a channel.
//!
//! Channels live in a FIFO queue; only the newest one can be open. Frames are handed out from
//! the oldest channel that has any, which keeps frames of one channel contiguous on L1.

use std::{collections::VecDeque, sync::Arc};

use alloy_primitives::B256;
use opcore_pipeline::{RollupConfig, SingleBatch};
use opcore_stream::{batch_transactions, l2_block_ref, L2Block};
use opcore_types::{BlockId, L2BlockRef};
use tracing::{debug, info, warn};

use crate::{
    channel::{PendingChannel, TxData, TxId},
    channel_out::{hex_id, ChannelOut, ChannelOutError, CloseReason},
    config::ChannelConfig,
    metrics::BatcherMetrics,
};

#[derive(Debug, thiserror::Error)]
pub enum ChannelManagerError {
    #[error("L2 reorg: expected parent {expected}, got {got}")]
    Reorg { expected: B256, got: B256 },
    #[error("{0} DA bytes pending, refusing more blocks")]
    PendingDaFull(u64),
    #[error("no transaction data available")]
    NoData,
    #[error("channel manager is closed")]
    Closed,
    #[error("invalid L2 block: {0}")]
    Block(String),
    #[error(transparent)]
    ChannelOut(#[from] ChannelOutError),
}

/// An L2 block waiting to be batched.
#[derive(Debug, Clone)]
pub struct QueuedBlock {
    pub block_ref: L2BlockRef,
    pub batch: SingleBatch,
    /// Size of the user transactions, the block's estimated DA footprint.
    pub da_bytes: u64,
}

#[derive(Debug)]
pub struct ChannelManager {
    cfg: Arc<RollupConfig>,
    config: ChannelConfig,
    metrics: Arc<BatcherMetrics>,
    blocks: VecDeque<QueuedBlock>,
    /// Index in `blocks` of the first block not in a channel.
    cursor: usize,
    /// Hash of the newest queued block.
    tip: Option<B256>,
    channels: VecDeque<PendingChannel>,
    /// Latest L1 origin of the last closed channel, the reference for the duration limit.
    l1_origin_last_closed: u64,
    l1_head: u64,
    closed: bool,
}

impl ChannelManager {
    pub fn new(cfg: Arc<RollupConfig>, config: ChannelConfig, metrics: Arc<BatcherMetrics>) -> Self {
        Self {
            cfg,
            config,
            metrics,
            blocks: VecDeque::new(),
            cursor: 0,
            tip: None,
            channels: VecDeque::new(),
            l1_origin_last_closed: 0,
            l1_head: 0,
            closed: false,
        }
    }

    #[inline]
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    #[inline]
    pub fn metrics(&self) -> &Arc<BatcherMetrics> {
        &self.metrics
    }

    /// Blocks not yet in a channel.
    pub fn pending_blocks(&self) -> usize {
        self.blocks.len() - self.cursor
    }

    pub fn pending_da_bytes(&self) -> u64 {
        self.blocks.iter().skip(self.cursor).map(|b| b.da_bytes).sum()
    }

    pub fn channel_queue_len(&self) -> usize {
        self.channels.len()
    }

    /// The newest queued block.
    pub fn tip(&self) -> Option<&L2BlockRef> {
        self.blocks.back().map(|b| &b.block_ref)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Queue the next L2 block. Its parent must be the previously added block.
    pub fn add_l2_block(&mut self, block: &L2Block) -> Result<L2BlockRef, ChannelManagerError> {
        if self.closed {
            return Err(ChannelManagerError::Closed);
        }
        let parent = block.header.parent_hash;
        if let Some(tip) = self.tip {
            if parent != tip {
                return Err(ChannelManagerError::Reorg { expected: tip, got: parent });
            }
        }

        let block_ref = l2_block_ref(block, &self.cfg)
            .map_err(|e| ChannelManagerError::Block(e.to_string()))?;
        let transactions = batch_transactions(block);
        let da_bytes = transactions.iter().map(|tx| tx.len() as u64).sum();

        let pending = self.pending_da_bytes();
        let max = self.config.max_pending_da;
        if max > 0 && pending > 0 && pending + da_bytes > max {
            return Err(ChannelManagerError::PendingDaFull(pending));
        }

        let batch = SingleBatch {
            parent_hash: parent,
            epoch_num: block_ref.l1_origin.number,
            epoch_hash: block_ref.l1_origin.hash,
            timestamp: block_ref.timestamp,
            transactions,
        };
        self.blocks.push_back(QueuedBlock { block_ref, batch, da_bytes });
        self.tip = Some(block_ref.hash);
        self.metrics.record_block_added();
        self.update_gauges();
        Ok(block_ref)
    }

    /// The next transaction's worth of frames, building channels from queued blocks as needed.
    pub fn tx_data(&mut self, l1_head: BlockId) -> Result<TxData, ChannelManagerError> {
        self.l1_head = self.l1_head.max(l1_head.number);
        if let Some(data) = self.next_ready() {
            return Ok(data);
        }
        if !self.closed && self.pending_blocks() > 0 {
            self.process_blocks()?;
            self.check_deadlines(l1_head.number)?;
            self.output_frames()?;
        }
        self.next_ready().ok_or(ChannelManagerError::NoData)
    }

    fn next_ready(&mut self) -> Option<TxData> {
        let max_frames = self.config.max_frames_per_tx();
        let as_blob = self.config.use_blobs;
        let ch = self.channels.iter_mut().find(|ch| ch.has_tx_data())?;
        let data = ch.next_tx_data(max_frames, as_blob)?;
        self.metrics.record_frames_submitted(data.frames.len() as u64, data.len() as u64);
        debug!(target: "opcore::batcher", tx = %data.id(), frames = data.frames.len(), "tx data ready");
        Some(data)
    }

    fn open_channel(&mut self) -> Result<&mut PendingChannel, ChannelManagerError> {
        let needs_new = self.channels.back().is_none_or(|ch| ch.out().is_closed());
        if needs_new {
            let out = ChannelOut::random(
                self.cfg.clone(),
                self.config.batch_type,
                self.config.compressor_config(),
                self.config.max_frame_size,
            )?;
            debug!(
                target: "opcore::batcher",
                channel = %hex_id(&out.id()),
                l1_head = self.l1_head,
                "opened channel"
            );
            self.channels.push_back(PendingChannel::new(out, self.l1_head));
            self.metrics.record_channel_opened();
        }
        self.channels.back_mut().ok_or(ChannelManagerError::NoData)
    }

    /// Feed queued blocks into the open channel until it fills up or the queue runs dry.
    fn process_blocks(&mut self) -> Result<(), ChannelManagerError> {
        while self.cursor < self.blocks.len() {
            let block = self.blocks[self.cursor].clone();
            let ch = self.open_channel()?;
            let first_in_epoch = block.block_ref.sequence_number == 0;
            match ch.out_mut().add_block(&block.batch, first_in_epoch) {
                Ok(()) => {
                    ch.record_block(block.block_ref.number, block.block_ref.l1_origin.number);
                    let closed = ch.out().is_closed();
                    self.cursor += 1;
                    if closed {
                        self.on_closed();
                        break;
                    }
                }
                Err(ChannelOutError::Full) => {
                    self.on_closed();
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.update_gauges();
        Ok(())
    }

    /// Close the open channel if it spans too many L1 origins or its blocks risk leaving the
    /// sequencing window.
    fn check_deadlines(&mut self, l1_head: u64) -> Result<(), ChannelManagerError> {
        let max_duration = self.config.max_channel_duration;
        let margin = self.config.sub_safety_margin;
        let seq_window = self.cfg.seq_window_size;
        let last_closed = self.l1_origin_last_closed;
        let Some(ch) = self.channels.back_mut() else { return Ok(()) };
        if ch.out().is_closed() || ch.block_count() == 0 {
            return Ok(());
        }

        let reason = if max_duration > 0 && ch.latest_origin >= last_closed + max_duration {
            Some(CloseReason::MaxDuration)
        } else if l1_head + margin >= ch.oldest_origin + seq_window {
            Some(CloseReason::Timeout)
        } else {
            None
        };
        if let Some(reason) = reason {
            ch.out_mut().close(reason)?;
            self.on_closed();
        }
        Ok(())
    }

    fn on_closed(&mut self) {
        let Some(ch) = self.channels.back() else { return };
        let Some(reason) = ch.out().close_reason() else { return };
        self.l1_origin_last_closed = self.l1_origin_last_closed.max(ch.latest_origin);
        self.metrics.record_channel_closed(reason, ch.out().input_bytes());
        info!(
            target: "opcore::batcher",
            channel = %hex_id(&ch.id()),
            %reason,
            blocks = ch.block_count(),
            first_block = ?ch.first_block,
            last_block = ch.last_block,
            input_bytes = ch.out().input_bytes(),
            ready_bytes = ch.out().ready_bytes(),
            "closed channel"
        );
    }

    fn output_frames(&mut self) -> Result<(), ChannelManagerError> {
        for ch in &mut self.channels {
            ch.output_frames()?;
        }
        Ok(())
    }

    fn channel_mut(&mut self, id: &TxId) -> Option<&mut PendingChannel> {
        self.channels.iter_mut().find(|ch| ch.id() == id.channel)
    }

    /// The transaction failed to land; its frames are resent.
    pub fn tx_failed(&mut self, id: &TxId) {
        self.metrics.record_tx_failed();
        match self.channel_mut(id) {
            Some(ch) => ch.tx_failed(id),
            None => debug!(target: "opcore::batcher", tx = %id, "failed tx of a dropped channel"),
        }
    }

    /// The transaction was included in L1 block `inclusion`.
    ///
    /// If the channel's transactions now span more L1 blocks than derivation accepts, the channel
    /// and every later one are dropped and their blocks queued again.
    pub fn tx_confirmed(&mut self, id: &TxId, inclusion: BlockId) {
        self.metrics.record_tx_confirmed();
        let timeout = self.config.inclusion_timeout();
        let Some(pos) = self.channels.iter().position(|ch| ch.id() == id.channel) else {
            debug!(target: "opcore::batcher", tx = %id, "confirmed tx of a dropped channel");
            return;
        };
        let ch = &mut self.channels[pos];
        ch.tx_confirmed(id, inclusion);
        if ch.is_timed_out(timeout) {
            warn!(
                target: "opcore::batcher",
                channel = %hex_id(&ch.id()),
                span = ?ch.inclusion_span(),
                timeout,
                "channel timed out on L1, requeueing its blocks"
            );
            self.metrics.record_channel_timed_out();
            self.invalidate_from(pos);
        } else if ch.is_confirmed() {
            debug!(target: "opcore::batcher", channel = %hex_id(&ch.id()), "channel fully confirmed");
        }
    }

    /// An included transaction was reorged out of L1.
    pub fn tx_reorged(&mut self, id: &TxId) {
        self.metrics.record_tx_reorged();
        if self.channel_mut(id).is_some_and(|ch| ch.tx_reorged(id)) {
            info!(target: "opcore::batcher", tx = %id, "resubmitting reorged frames");
        }
    }

    /// Drop the channel at `pos` and all newer ones, rewinding the cursor to its first block.
    fn invalidate_from(&mut self, pos: usize) {
        let first = self.channels[pos].first_block;
        self.channels.truncate(pos);
        if let (Some(first), Some(front)) = (first, self.blocks.front()) {
            let idx = first.saturating_sub(front.block_ref.number) as usize;
            self.cursor = self.cursor.min(idx);
        }
        self.update_gauges();
    }

    /// Forget blocks and channels the safe head has passed.
    pub fn prune_safe(&mut self, safe: &L2BlockRef) {
        if let Some(b) = self.blocks.iter().find(|b| b.block_ref.number == safe.number) {
            if b.block_ref.hash != safe.hash {
                warn!(
                    target: "opcore::batcher",
                    number = safe.number,
                    queued = %b.block_ref.hash,
                    safe = %safe.hash,
                    "safe head does not match queued block, clearing state"
                );
                self.clear(safe.l1_origin.number);
                return;
            }
        }

        let mut removed = 0;
        while self.blocks.front().is_some_and(|b| b.block_ref.number <= safe.number) {
            self.blocks.pop_front();
            removed += 1;
        }
        if removed > self.cursor {
            warn!(
                target: "opcore::batcher",
                safe = safe.number,
                skipped = removed - self.cursor,
                "safe head passed blocks that were never batched"
            );
        }
        self.cursor = self.cursor.saturating_sub(removed);
        if self.blocks.is_empty() {
            // The next block to load builds on the safe head.
            self.tip = Some(safe.hash);
        }

        while self
            .channels
            .front()
            .is_some_and(|ch| ch.out().is_closed() && ch.last_block <= safe.number)
        {
            self.channels.pop_front();
        }
        self.update_gauges();
    }

    /// Drop all state, e.g. after an L2 reorg. The duration limit restarts from `safe_l1_origin`.
    pub fn clear(&mut self, safe_l1_origin: u64) {
        info!(target: "opcore::batcher", safe_l1_origin, "clearing channel manager");
        self.blocks.clear();
        self.cursor = 0;
        self.tip = None;
        self.channels.clear();
        self.l1_origin_last_closed = safe_l1_origin;
        self.closed = false;
        self.update_gauges();
    }

    /// Stop taking blocks: put every queued block into channels and close the last one.
    pub fn close(&mut self) -> Result<(), ChannelManagerError> {
        if self.closed {
            return Ok(());
        }
        while self.pending_blocks() > 0 {
            self.process_blocks()?;
        }
        if let Some(ch) = self.channels.back_mut() {
            if !ch.out().is_closed() {
                if ch.block_count() == 0 {
                    self.channels.pop_back();
                } else {
                    ch.out_mut().close(CloseReason::ForceClose)?;
                    self.on_closed();
                }
            }
        }
        self.output_frames()?;
        self.closed = true;
        self.update_gauges();
        Ok(())
    }

    /// Every frame is confirmed on L1, or there never were any.
    pub fn is_drained(&self) -> bool {
        self.pending_blocks() == 0 && self.channels.iter().all(PendingChannel::is_confirmed)
    }

    /// Confirmed transactions and their inclusion blocks, for L1 reorg checks.
    pub fn confirmed_inclusions(&self) -> Vec<(TxId, BlockId)> {
        self.channels.iter().flat_map(PendingChannel::confirmed_inclusions).collect()
    }

    fn update_gauges(&self) {
        self.metrics.set_pending_blocks(self.pending_blocks() as u64);
        self.metrics.set_channel_queue_length(self.channels.len() as u64);
        self.metrics.set_pending_da_bytes(self.pending_da_bytes());
    }
}
