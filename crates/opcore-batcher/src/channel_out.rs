//! Submitter side of a channel: batches go in, frames come out.
//!
//! A [`ChannelOut`] owns one size-bounded compressor. In singular mode every block is appended
//! as its own batch. In span mode the whole channel is a single span batch, so the compressor is
//! rewound and fed the re-encoded span on every block.
//!
//! Output only becomes readable once the channel is closed; frames are then cut from the
//! compressed stream in order, the last one flagged `is_last`.

use std::{fmt, sync::Arc};

use opcore_pipeline::{
    config::{FRAME_OVERHEAD, MAX_FRAME_LEN},
    new_compressor, Batch, BatchError, BatchType, ChannelId, CompressionError, CompressorConfig,
    CompressorWriter, Frame, RollupConfig, SingleBatch, SpanBatch,
};

/// Frame numbers are `u16`; a channel may not need more frames than that.
pub const MAX_FRAMES_PER_CHANNEL: usize = u16::MAX as usize;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ChannelOutError {
    #[error("channel is closed")]
    Closed,
    #[error("channel is not closed, no frames to output")]
    NotClosed,
    /// The block was not accepted, the channel has been closed.
    #[error("channel is full")]
    Full,
    #[error("batch of {0} bytes exceeds the channel RLP limit")]
    BatchTooLarge(usize),
    #[error("max frame size {0} leaves no room for data")]
    MaxFrameSizeTooSmall(usize),
    #[error("compression: {0}")]
    Compression(#[from] CompressionError),
    #[error("batch encoding: {0}")]
    Batch(#[from] BatchError),
}

/// Why a channel stopped accepting blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The compressor reached its output target.
    Full,
    /// The channel stayed open for the configured number of L1 blocks.
    MaxDuration,
    /// The sequencing window of its oldest block was about to expire.
    Timeout,
    /// Closed on shutdown or by the operator.
    ForceClose,
    /// The compressed data would not fit in `u16` frames.
    TooManyFrames,
}

impl CloseReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::MaxDuration => "max_duration",
            Self::Timeout => "timeout",
            Self::ForceClose => "force_close",
            Self::TooManyFrames => "too_many_frames",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct ChannelOut {
    id: ChannelId,
    cfg: Arc<RollupConfig>,
    batch_type: BatchType,
    max_frame_size: usize,
    compressor: Box<dyn CompressorWriter + Send>,
    /// Span mode only: the blocks of the span batch being built.
    span: Vec<SingleBatch>,
    first_origin_changed: bool,
    rlp_length: u64,
    output_bytes: u64,
    frame_number: u16,
    close_reason: Option<CloseReason>,
}

impl fmt::Debug for ChannelOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelOut")
            .field("id", &hex_id(&self.id))
            .field("batch_type", &self.batch_type)
            .field("rlp_length", &self.rlp_length)
            .field("frame_number", &self.frame_number)
            .field("close_reason", &self.close_reason)
            .finish_non_exhaustive()
    }
}

impl ChannelOut {
    pub fn new(
        id: ChannelId,
        cfg: Arc<RollupConfig>,
        batch_type: BatchType,
        compressor: CompressorConfig,
        max_frame_size: usize,
    ) -> Result<Self, ChannelOutError> {
        if max_frame_size <= FRAME_OVERHEAD {
            return Err(ChannelOutError::MaxFrameSizeTooSmall(max_frame_size));
        }
        Ok(Self {
            id,
            cfg,
            batch_type,
            max_frame_size,
            compressor: new_compressor(compressor),
            span: Vec::new(),
            first_origin_changed: false,
            rlp_length: 0,
            output_bytes: 0,
            frame_number: 0,
            close_reason: None,
        })
    }

    /// A channel with a fresh random id.
    pub fn random(
        cfg: Arc<RollupConfig>,
        batch_type: BatchType,
        compressor: CompressorConfig,
        max_frame_size: usize,
    ) -> Result<Self, ChannelOutError> {
        Self::new(rand::random(), cfg, batch_type, compressor, max_frame_size)
    }

    #[inline]
    pub const fn id(&self) -> ChannelId {
        self.id
    }

    #[inline]
    pub const fn is_closed(&self) -> bool {
        self.close_reason.is_some()
    }

    #[inline]
    pub const fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    /// RLP bytes fed to the compressor.
    #[inline]
    pub const fn input_bytes(&self) -> u64 {
        self.rlp_length
    }

    /// Bytes of frames output so far, framing included.
    #[inline]
    pub const fn output_bytes(&self) -> u64 {
        self.output_bytes
    }

    #[inline]
    pub const fn frames_output(&self) -> u16 {
        self.frame_number
    }

    /// Compressed bytes not yet cut into frames. Zero while the channel is open.
    pub fn ready_bytes(&self) -> usize {
        if self.is_closed() {
            self.compressor.len()
        } else {
            0
        }
    }

    /// Closed and every compressed byte has been put into a frame.
    pub fn is_drained(&self) -> bool {
        self.is_closed() && self.frame_number > 0 && self.compressor.len() == 0
    }

    #[inline]
    fn frame_capacity(&self) -> usize {
        (self.max_frame_size - FRAME_OVERHEAD).min(MAX_FRAME_LEN)
    }

    /// Add the batch of one L2 block. `first_in_epoch` is whether its sequence number is 0.
    ///
    /// Returns [`ChannelOutError::Full`] if the block was refused; the channel is closed then and
    /// the block belongs in the next channel. A block may also be accepted and close the channel,
    /// check [`is_closed`](Self::is_closed) afterwards.
    pub fn add_block(
        &mut self,
        batch: &SingleBatch,
        first_in_epoch: bool,
    ) -> Result<(), ChannelOutError> {
        if self.is_closed() {
            return Err(ChannelOutError::Closed);
        }
        match self.batch_type {
            BatchType::Single => self.add_single(batch)?,
            BatchType::Span => self.add_to_span(batch, first_in_epoch)?,
        }

        if self.compressor.is_full() {
            self.close(CloseReason::Full)?;
        } else if self.compressor.len().div_ceil(self.frame_capacity()) >= MAX_FRAMES_PER_CHANNEL {
            self.close(CloseReason::TooManyFrames)?;
        }
        Ok(())
    }

    fn add_single(&mut self, batch: &SingleBatch) -> Result<(), ChannelOutError> {
        let encoded = Batch::Single(batch.clone()).encode_for_channel(&self.cfg)?;
        let max = self.cfg.max_rlp_bytes_per_channel(batch.timestamp);
        if self.rlp_length + encoded.len() as u64 > max {
            return self.refuse(encoded.len());
        }

        match self.compressor.write(&encoded) {
            Ok(_) => {
                self.rlp_length += encoded.len() as u64;
                Ok(())
            }
            Err(CompressionError::ChannelFull) => {
                self.close(CloseReason::Full)?;
                Err(ChannelOutError::Full)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn add_to_span(
        &mut self,
        batch: &SingleBatch,
        first_in_epoch: bool,
    ) -> Result<(), ChannelOutError> {
        if self.span.is_empty() {
            self.first_origin_changed = first_in_epoch;
        }
        self.span.push(batch.clone());

        let encoded = self.encode_span()?;
        if encoded.len() as u64 > self.cfg.max_rlp_bytes_per_channel(batch.timestamp) {
            self.span.pop();
            return self.refuse(encoded.len());
        }
        self.rewrite(&encoded)?;

        if self.compressor.is_full() && self.span.len() > 1 {
            // The last block pushed the span past the target: take it back out.
            self.span.pop();
            let encoded = self.encode_span()?;
            self.rewrite(&encoded)?;
            self.close(CloseReason::Full)?;
            return Err(ChannelOutError::Full);
        }
        Ok(())
    }

    fn encode_span(&self) -> Result<Vec<u8>, ChannelOutError> {
        let span = SpanBatch::from_singles(&self.span, self.first_origin_changed)?;
        Ok(Batch::Span(span).encode_for_channel(&self.cfg)?)
    }

    fn rewrite(&mut self, encoded: &[u8]) -> Result<(), ChannelOutError> {
        self.compressor.reset();
        self.compressor.write(encoded)?;
        self.rlp_length = encoded.len() as u64;
        Ok(())
    }

    /// A batch over the RLP limit: an error if the channel is empty, otherwise close and refuse.
    fn refuse(&mut self, len: usize) -> Result<(), ChannelOutError> {
        if self.rlp_length == 0 {
            return Err(ChannelOutError::BatchTooLarge(len));
        }
        self.close(CloseReason::Full)?;
        Err(ChannelOutError::Full)
    }

    /// Close the channel. Closing twice keeps the first reason.
    pub fn close(&mut self, reason: CloseReason) -> Result<(), ChannelOutError> {
        if self.is_closed() {
            return Ok(());
        }
        self.compressor.close()?;
        self.close_reason = Some(reason);
        Ok(())
    }

    /// Cut the next frame from the compressed stream.
    pub fn output_frame(&mut self) -> Result<Frame, ChannelOutError> {
        if !self.is_closed() {
            return Err(ChannelOutError::NotClosed);
        }
        let mut data = vec![0u8; self.frame_capacity().min(self.compressor.len())];
        let n = self.compressor.read_output(&mut data);
        data.truncate(n);

        let frame = Frame {
            id: self.id,
            number: self.frame_number,
            is_last: self.compressor.len() == 0,
            data,
        };
        self.frame_number += 1;
        self.output_bytes += frame.encoded_len() as u64;
        Ok(frame)
    }
}

pub(crate) fn hex_id(id: &ChannelId) -> String {
    alloy_primitives::hex::encode(id)
}

/// Compressed bytes that fit in `num_frames` frames of `max_frame_size`.
pub const fn max_data_size(num_frames: usize, max_frame_size: usize) -> u64 {
    (num_frames * (max_frame_size - FRAME_OVERHEAD)) as u64
}

#[cfg(test)]
mod tests {
    use opcore_pipeline::{decode_frames, decompress, encode_frames, CompressorType};

    use super::*;
    use crate::tests::fixtures::{mock_config, single_batch};

    fn cfg() -> Arc<RollupConfig> {
        Arc::new(mock_config())
    }

    fn compressor(target: u64, kind: CompressorType) -> CompressorConfig {
        CompressorConfig::builder().target_output_size(target).kind(kind).build()
    }

    fn batch(number: u64, tx_len: usize) -> SingleBatch {
        single_batch(number, 0, tx_len)
    }

    #[test]
    fn test_frames_only_after_close() {
        let mut ch =
            ChannelOut::random(cfg(), BatchType::Single, compressor(10_000, CompressorType::Shadow), 1000)
                .unwrap();
        ch.add_block(&batch(1, 100), true).unwrap();
        assert_eq!(ch.ready_bytes(), 0);
        assert_eq!(ch.output_frame(), Err(ChannelOutError::NotClosed));

        ch.close(CloseReason::ForceClose).unwrap();
        assert_eq!(ch.close_reason(), Some(CloseReason::ForceClose));
        let frame = ch.output_frame().unwrap();
        assert!(frame.is_last);
        assert_eq!(frame.number, 0);
        assert!(ch.is_drained());
        assert_eq!(ch.add_block(&batch(2, 10), false), Err(ChannelOutError::Closed));
    }

    #[test]
    fn test_frames_respect_max_size_and_reassemble() {
        let max_frame = 200;
        let mut ch =
            ChannelOut::random(cfg(), BatchType::Single, compressor(100_000, CompressorType::Ratio), max_frame)
                .unwrap();
        let batches: Vec<_> = (1..=5).map(|n| batch(n, 300)).collect();
        for b in &batches {
            ch.add_block(b, false).unwrap();
        }
        ch.close(CloseReason::ForceClose).unwrap();

        let mut frames = Vec::new();
        while !ch.is_drained() {
            frames.push(ch.output_frame().unwrap());
        }
        assert!(frames.len() > 1);
        for (i, f) in frames.iter().enumerate() {
            assert_eq!(f.number as usize, i);
            assert!(f.encoded_len() <= max_frame);
            assert_eq!(f.is_last, i == frames.len() - 1);
        }
        assert_eq!(decode_frames(&encode_frames(&frames).unwrap()).unwrap(), frames);

        let data: Vec<u8> = frames.iter().flat_map(|f| f.data.clone()).collect();
        let raw = decompress(&data, usize::MAX, false).unwrap();
        let mut expected = Vec::new();
        for b in &batches {
            expected.extend(Batch::Single(b.clone()).encode_for_channel(&cfg()).unwrap());
        }
        assert_eq!(raw, expected);
        assert_eq!(ch.input_bytes(), expected.len() as u64);
    }

    #[test]
    fn test_full_channel_refuses_block() {
        let mut ch =
            ChannelOut::random(cfg(), BatchType::Single, compressor(1_000, CompressorType::Ratio), 1000)
                .unwrap();
        // Ratio 0.4: full once 2_500 input bytes are in, a handful of blocks.
        let mut accepted = 0;
        loop {
            match ch.add_block(&batch(accepted + 1, 400), false) {
                Ok(()) if ch.is_closed() => {
                    accepted += 1;
                    break;
                }
                Ok(()) => accepted += 1,
                Err(ChannelOutError::Full) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(accepted > 1);
        assert_eq!(ch.close_reason(), Some(CloseReason::Full));
    }

    #[test]
    fn test_span_channel_holds_one_span_batch() {
        let mut ch =
            ChannelOut::random(cfg(), BatchType::Span, compressor(100_000, CompressorType::Shadow), 10_000)
                .unwrap();
        let batches: Vec<_> = (1..=3).map(|n| batch(n, 50)).collect();
        for (i, b) in batches.iter().enumerate() {
            ch.add_block(b, i == 0).unwrap();
        }
        ch.close(CloseReason::ForceClose).unwrap();
        let frame = ch.output_frame().unwrap();
        let raw = decompress(&frame.data, usize::MAX, false).unwrap();

        let span = SpanBatch::from_singles(&batches, true).unwrap();
        assert_eq!(raw, Batch::Span(span).encode_for_channel(&cfg()).unwrap());
    }

    #[test]
    fn test_span_channel_drops_overflowing_block() {
        let mut ch =
            ChannelOut::random(cfg(), BatchType::Span, compressor(2_000, CompressorType::Ratio), 10_000)
                .unwrap();
        ch.add_block(&batch(1, 500), true).unwrap();
        // 0.4 ratio: 5_000 input bytes fill the channel.
        let mut n = 2;
        let err = loop {
            match ch.add_block(&batch(n, 500), false) {
                Ok(()) => n += 1,
                Err(e) => break e,
            }
        };
        assert_eq!(err, ChannelOutError::Full);
        assert_eq!(ch.close_reason(), Some(CloseReason::Full));

        let frame = ch.output_frame().unwrap();
        let raw = decompress(&frame.data, usize::MAX, false).unwrap();
        let kept: Vec<_> = (1..n).map(|i| batch(i, 500)).collect();
        let span = SpanBatch::from_singles(&kept, true).unwrap();
        assert_eq!(raw, Batch::Span(span).encode_for_channel(&cfg()).unwrap());
    }

    #[test]
    fn test_tiny_frame_size_rejected() {
        let err = ChannelOut::random(
            cfg(),
            BatchType::Single,
            compressor(1_000, CompressorType::Shadow),
            FRAME_OVERHEAD,
        )
        .unwrap_err();
        assert_eq!(err, ChannelOutError::MaxFrameSizeTooSmall(FRAME_OVERHEAD));
    }

    #[test]
    fn test_max_data_size() {
        assert_eq!(max_data_size(6, 130_043), 6 * 130_020);
    }
}
