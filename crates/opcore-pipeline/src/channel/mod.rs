//! Channel assembly.
//!
//! - `Channel`: frames of one channel id, ordered by frame number. Ready once the last frame and
//!   every frame before it are present.
//! - `ChannelBank`: pre-Holocene buffer of many channels with size budget and timeouts.
//! - `ChannelAssembler`: Holocene buffer of one channel with strict in-order frames.
//! - `BatchReader`: decompresses a ready channel and yields its batches.

mod assembler;
mod bank;
mod reader;

pub use assembler::ChannelAssembler;
pub use bank::ChannelBank;
pub use reader::BatchReader;

use std::collections::BTreeMap;

use opcore_types::{BlockId, ChannelState, FrameState};

use crate::frame::{ChannelId, Frame};

/// Per-frame bookkeeping charged against the bank budget on top of the frame data.
pub const FRAME_BANK_OVERHEAD: usize = 200;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("frame belongs to another channel")]
    WrongChannel,
    #[error("duplicate frame {0}")]
    DuplicateFrame(u16),
    #[error("channel already closed")]
    AlreadyClosed,
    #[error("frame {number} past last frame {last}")]
    PastLastFrame { number: u16, last: u16 },
    #[error("frame {got} out of order, expected {expected}")]
    OutOfOrder { expected: u16, got: u16 },
    #[error("channel not ready")]
    NotReady,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    id: ChannelId,
    open_block: BlockId,
    frames: BTreeMap<u16, Frame>,
    /// Frame number of the closing frame, once seen.
    last_frame: Option<u16>,
    highest_frame: u16,
    size: usize,
    /// Highest L1 block a frame of this channel was seen in.
    highest_l1_inclusion: BlockId,
}

impl Channel {
    pub fn new(id: ChannelId, open_block: BlockId) -> Self {
        Self {
            id,
            open_block,
            frames: BTreeMap::new(),
            last_frame: None,
            highest_frame: 0,
            size: 0,
            highest_l1_inclusion: open_block,
        }
    }

    #[inline]
    pub const fn id(&self) -> ChannelId {
        self.id
    }

    #[inline]
    pub const fn open_block_number(&self) -> u64 {
        self.open_block.number
    }

    /// Bytes charged against the channel bank.
    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub const fn is_closed(&self) -> bool {
        self.last_frame.is_some()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[inline]
    pub const fn highest_l1_inclusion(&self) -> BlockId {
        self.highest_l1_inclusion
    }

    /// Add a frame seen in L1 block `l1_block`.
    pub fn add_frame(&mut self, frame: Frame, l1_block: BlockId) -> Result<(), ChannelError> {
        if frame.id != self.id {
            return Err(ChannelError::WrongChannel);
        }
        if frame.is_last && self.is_closed() {
            return Err(ChannelError::AlreadyClosed);
        }
        if self.frames.contains_key(&frame.number) {
            return Err(ChannelError::DuplicateFrame(frame.number));
        }
        if let Some(last) = self.last_frame {
            if frame.number > last {
                return Err(ChannelError::PastLastFrame { number: frame.number, last });
            }
        }

        if frame.is_last {
            self.last_frame = Some(frame.number);
            // Frames past the new end can never be part of the channel.
            let dropped: Vec<u16> =
                self.frames.range(frame.number + 1..).map(|(n, _)| *n).collect();
            for n in dropped {
                if let Some(f) = self.frames.remove(&n) {
                    self.size -= f.data.len() + FRAME_BANK_OVERHEAD;
                }
            }
            self.highest_frame = frame.number;
        } else {
            self.highest_frame = self.highest_frame.max(frame.number);
        }

        if l1_block.number > self.highest_l1_inclusion.number {
            self.highest_l1_inclusion = l1_block;
        }
        self.size += frame.data.len() + FRAME_BANK_OVERHEAD;
        self.frames.insert(frame.number, frame);
        Ok(())
    }

    /// Ready when the closing frame and every frame before it are present.
    pub fn is_ready(&self) -> bool {
        match self.last_frame {
            Some(last) => self.frames.len() == last as usize + 1,
            None => false,
        }
    }

    /// Timed out when `current_l1 > open_block + timeout`.
    #[inline]
    pub const fn is_timed_out(&self, current_l1: u64, timeout: u64) -> bool {
        self.open_block.number + timeout < current_l1
    }

    /// Concatenated frame data of a ready channel.
    pub fn frame_data(&self) -> Result<Vec<u8>, ChannelError> {
        if !self.is_ready() {
            return Err(ChannelError::NotReady);
        }
        let mut data = Vec::with_capacity(self.frames.values().map(|f| f.data.len()).sum());
        for frame in self.frames.values() {
            data.extend_from_slice(&frame.data);
        }
        Ok(data)
    }

    /// Snapshot for persistence.
    pub fn to_state(&self) -> ChannelState {
        ChannelState {
            id: self.id,
            frames: self
                .frames
                .values()
                .map(|f| FrameState { frame_number: f.number, data: f.data.clone(), is_last: f.is_last })
                .collect(),
            is_closed: self.is_closed(),
            highest_frame: self.highest_frame,
            opened_at_l1_block: self.open_block.number,
            size: self.size,
        }
    }

    /// Rebuild a channel from a snapshot. Block hashes are not persisted.
    pub fn from_state(state: ChannelState) -> Self {
        let open = BlockId::new(Default::default(), state.opened_at_l1_block);
        let mut channel = Self::new(state.id, open);
        for f in state.frames {
            let frame = Frame { id: state.id, number: f.frame_number, data: f.data, is_last: f.is_last };
            // Snapshots come from valid channels.
            let _ = channel.add_frame(frame, open);
        }
        channel
    }
}
