//! Frame codec.
//!
//! - `Frame`: a single chunk of channel data, identified by channel id and frame number.
//! - `decode_frames`: parses a batcher-tx payload (derivation version byte + frames).
//! - `encode_frames`: the inverse, used by the batcher.
//!
//! Layout (https://specs.optimism.io/protocol/derivation.html#frame-format):
//! `channel_id(16) ‖ frame_number(u16) ‖ frame_data_length(u32) ‖ frame_data ‖ is_last(u8)`
use std::{collections::HashSet, ops::Range};

use crate::config::{FRAME_OVERHEAD, MAX_FRAME_LEN};

pub type ChannelId = [u8; 16];

/// Version byte prefixed to every batcher payload.
pub const DERIVATION_VERSION_0: u8 = 0x00;

const CHANNEL_ID: Range<usize> = 0..16;
const FRAME_NUMBER: Range<usize> = 16..18;
const FRAME_DATA_LENGTH: Range<usize> = 18..22;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty payload")]
    Empty,
    #[error("unknown derivation version: {0}")]
    UnknownVersion(u8),
    #[error("incomplete frame: need {need} bytes, have {have}")]
    Incomplete { need: usize, have: usize },
    #[error("frame data too large: {0} > {MAX_FRAME_LEN}")]
    TooLarge(usize),
    #[error("invalid is_last byte: {0}")]
    InvalidIsLast(u8),
    #[error("duplicate frame {number} of channel {id}")]
    Duplicate { id: String, number: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: ChannelId,
    pub number: u16,
    pub data: Vec<u8>,
    pub is_last: bool,
}

impl Frame {
    /// Size of this frame on the wire.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        FRAME_OVERHEAD + self.data.len()
    }

    /// Append the wire encoding of this frame to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), FrameError> {
        if self.data.len() > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(self.data.len()));
        }
        out.reserve(self.encoded_len());
        out.extend_from_slice(&self.id);
        out.extend_from_slice(&self.number.to_be_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.data);
        out.push(self.is_last as u8);
        Ok(())
    }

    /// Decode one frame from the head of `data`, returning it and the bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), FrameError> {
        if data.len() < FRAME_OVERHEAD {
            return Err(FrameError::Incomplete { need: FRAME_OVERHEAD, have: data.len() });
        }

        let mut id = [0u8; 16];
        id.copy_from_slice(&data[CHANNEL_ID]);
        let number = u16::from_be_bytes([data[FRAME_NUMBER.start], data[FRAME_NUMBER.start + 1]]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&data[FRAME_DATA_LENGTH]);
        let data_len = u32::from_be_bytes(len) as usize;
        if data_len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(data_len));
        }

        let total = FRAME_OVERHEAD + data_len;
        if data.len() < total {
            return Err(FrameError::Incomplete { need: total, have: data.len() });
        }

        let is_last = match data[total - 1] {
            0 => false,
            1 => true,
            b => return Err(FrameError::InvalidIsLast(b)),
        };
        let body = data[FRAME_DATA_LENGTH.end..total - 1].to_vec();

        Ok((Self { id, number, data: body, is_last }, total))
    }
}

/// Parse a batcher payload into frames.
///
/// The whole payload is rejected if any frame is malformed or a `(channel_id, frame_number)`
/// pair repeats.
pub fn decode_frames(data: &[u8]) -> Result<Vec<Frame>, FrameError> {
    let (&version, mut rest) = data.split_first().ok_or(FrameError::Empty)?;
    if version != DERIVATION_VERSION_0 {
        return Err(FrameError::UnknownVersion(version));
    }
    if rest.is_empty() {
        return Err(FrameError::Empty);
    }

    let mut frames = Vec::new();
    let mut seen = HashSet::new();
    while !rest.is_empty() {
        let (frame, consumed) = Frame::decode(rest)?;
        if !seen.insert((frame.id, frame.number)) {
            return Err(FrameError::Duplicate { id: hex::encode(frame.id), number: frame.number });
        }
        frames.push(frame);
        rest = &rest[consumed..];
    }
    Ok(frames)
}

/// Build a batcher payload from frames.
pub fn encode_frames(frames: &[Frame]) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(1 + frames.iter().map(Frame::encoded_len).sum::<usize>());
    out.push(DERIVATION_VERSION_0);
    for frame in frames {
        frame.encode(&mut out)?;
    }
    Ok(out)
}
