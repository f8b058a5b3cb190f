//! A channel in flight: its frames and the L1 transactions carrying them.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
};

use alloy_eips::eip4844::Blob;
use alloy_primitives::Bytes;
use opcore_pipeline::{encode_blob, encode_frames, BlobError, ChannelId, Frame, FrameError};
use opcore_types::BlockId;

use crate::channel_out::{hex_id, ChannelOut, ChannelOutError};

/// Identifies one batcher transaction: a run of consecutive frames of a single channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxId {
    pub channel: ChannelId,
    pub first_frame: u16,
    pub last_frame: u16,
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", hex_id(&self.channel), self.first_frame, self.last_frame)
    }
}

/// Frames to be sent in one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxData {
    pub frames: Vec<Frame>,
    pub as_blob: bool,
}

impl TxData {
    pub fn id(&self) -> TxId {
        let first = self.frames.first().map_or(0, |f| f.number);
        let last = self.frames.last().map_or(0, |f| f.number);
        let channel = self.frames.first().map_or([0; 16], |f| f.id);
        TxId { channel, first_frame: first, last_frame: last }
    }

    /// Calldata form: the version byte followed by every frame.
    pub fn call_data(&self) -> Result<Bytes, FrameError> {
        encode_frames(&self.frames).map(Bytes::from)
    }

    /// Blob form: one blob per frame, each holding `version ‖ frame`.
    pub fn blobs(&self) -> Result<Vec<Box<Blob>>, TxDataError> {
        self.frames
            .iter()
            .map(|frame| {
                let data = encode_frames(std::slice::from_ref(frame))?;
                Ok(encode_blob(&data)?)
            })
            .collect()
    }

    /// Bytes of frame data, framing included.
    pub fn len(&self) -> usize {
        self.frames.iter().map(Frame::encoded_len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TxDataError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Blob(#[from] BlobError),
}

/// A [`ChannelOut`] plus the state of its frames on L1.
#[derive(Debug)]
pub struct PendingChannel {
    out: ChannelOut,
    /// Frames cut from the channel but not handed to a transaction, in frame order.
    frames: VecDeque<Frame>,
    pending_txs: HashMap<TxId, Vec<Frame>>,
    confirmed_txs: HashMap<TxId, (BlockId, Vec<Frame>)>,
    /// L1 head when the channel was opened.
    pub(crate) opened_at: u64,
    /// L2 block numbers in the channel, inclusive.
    pub(crate) first_block: Option<u64>,
    pub(crate) last_block: u64,
    /// Oldest and newest L1 origin of the blocks in the channel.
    pub(crate) oldest_origin: u64,
    pub(crate) latest_origin: u64,
}

impl PendingChannel {
    pub fn new(out: ChannelOut, opened_at: u64) -> Self {
        Self {
            out,
            frames: VecDeque::new(),
            pending_txs: HashMap::new(),
            confirmed_txs: HashMap::new(),
            opened_at,
            first_block: None,
            last_block: 0,
            oldest_origin: u64::MAX,
            latest_origin: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> ChannelId {
        self.out.id()
    }

    #[inline]
    pub fn out(&self) -> &ChannelOut {
        &self.out
    }

    #[inline]
    pub fn out_mut(&mut self) -> &mut ChannelOut {
        &mut self.out
    }

    pub fn block_count(&self) -> u64 {
        self.first_block.map_or(0, |first| self.last_block - first + 1)
    }

    pub(crate) fn record_block(&mut self, number: u64, origin: u64) {
        self.first_block.get_or_insert(number);
        self.last_block = number;
        self.oldest_origin = self.oldest_origin.min(origin);
        self.latest_origin = self.latest_origin.max(origin);
    }

    /// Cut every remaining frame from a closed channel.
    pub fn output_frames(&mut self) -> Result<usize, ChannelOutError> {
        let mut count = 0;
        while self.out.is_closed() && !self.out.is_drained() {
            self.frames.push_back(self.out.output_frame()?);
            count += 1;
        }
        Ok(count)
    }

    #[inline]
    pub fn has_tx_data(&self) -> bool {
        !self.frames.is_empty()
    }

    /// Hand out the next `max_frames` frames, in order.
    pub fn next_tx_data(&mut self, max_frames: usize, as_blob: bool) -> Option<TxData> {
        let n = max_frames.max(1).min(self.frames.len());
        if n == 0 {
            return None;
        }
        let frames: Vec<Frame> = self.frames.drain(..n).collect();
        let data = TxData { frames, as_blob };
        self.pending_txs.insert(data.id(), data.frames.clone());
        Some(data)
    }

    fn requeue(&mut self, frames: Vec<Frame>) {
        self.frames.extend(frames);
        self.frames.make_contiguous().sort_by_key(|f| f.number);
    }

    /// The transaction failed: its frames go back to the front of the line.
    pub fn tx_failed(&mut self, id: &TxId) {
        if let Some(frames) = self.pending_txs.remove(id) {
            self.requeue(frames);
        }
    }

    pub fn tx_confirmed(&mut self, id: &TxId, inclusion: BlockId) {
        if let Some(frames) = self.pending_txs.remove(id) {
            self.confirmed_txs.insert(*id, (inclusion, frames));
        }
    }

    /// An included transaction was reorged out of L1: send its frames again.
    pub fn tx_reorged(&mut self, id: &TxId) -> bool {
        match self.confirmed_txs.remove(id) {
            Some((_, frames)) => {
                self.requeue(frames);
                true
            }
            None => false,
        }
    }

    /// L1 blocks the channel's transactions were included in, lowest and highest.
    pub fn inclusion_span(&self) -> Option<(u64, u64)> {
        let numbers = self.confirmed_txs.values().map(|(block, _)| block.number);
        let min = numbers.clone().min()?;
        let max = numbers.max()?;
        Some((min, max))
    }

    /// The span between first and last inclusion is past what derivation tolerates.
    pub fn is_timed_out(&self, timeout: u64) -> bool {
        self.inclusion_span().is_some_and(|(min, max)| max - min > timeout)
    }

    /// All frames have been handed to transactions.
    pub fn is_fully_submitted(&self) -> bool {
        self.out.is_drained() && self.frames.is_empty()
    }

    /// All frames are included on L1.
    pub fn is_confirmed(&self) -> bool {
        self.is_fully_submitted() && self.pending_txs.is_empty()
    }

    pub fn pending_tx_count(&self) -> usize {
        self.pending_txs.len()
    }

    pub fn confirmed_inclusions(&self) -> impl Iterator<Item = (TxId, BlockId)> + '_ {
        self.confirmed_txs.iter().map(|(id, (block, _))| (*id, *block))
    }
}
