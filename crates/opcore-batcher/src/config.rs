//! Batcher configuration.

use std::time::Duration;

use bon::Builder;
use opcore_pipeline::{
    config::FRAME_OVERHEAD, BatchType, CompressionAlgo, CompressorConfig, CompressorType,
    BLOB_MAX_DATA_SIZE,
};

use crate::{channel_out::max_data_size, throttle::ThrottleConfig};

/// Blobs per L1 block before Prague.
pub const MAX_BLOBS_PER_BLOCK_CANCUN: usize = 6;

/// Blobs per L1 block from Prague.
pub const MAX_BLOBS_PER_BLOCK_PRAGUE: usize = 9;

/// Largest frame a blob can carry, after the version byte.
pub const MAX_BLOB_FRAME_SIZE: usize = BLOB_MAX_DATA_SIZE - 1;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max frame size {0} must exceed the {FRAME_OVERHEAD} byte frame overhead")]
    FrameSizeTooSmall(usize),
    #[error("max frame size {0} does not fit in a blob")]
    FrameSizeTooLarge(usize),
    #[error("target number of frames must be at least 1")]
    NoFrames,
    #[error("{frames} frames per blob transaction, at most {max} allowed")]
    TooManyBlobs { frames: usize, max: usize },
    #[error("sub safety margin {margin} must be below the channel timeout {timeout}")]
    SafetyMargin { margin: u64, timeout: u64 },
}

/// How channels are built and cut into frames.
#[derive(Debug, Clone, Builder)]
pub struct ChannelConfig {
    /// Frame size limit, framing included.
    #[builder(default = 120_000)]
    pub max_frame_size: usize,
    /// Frames a full channel should produce; also the blobs per transaction in blob mode.
    #[builder(default = 1)]
    pub target_num_frames: usize,
    /// L1 origins a channel may span before it is closed. Zero disables the limit.
    #[builder(default = 0)]
    pub max_channel_duration: u64,
    /// L1 blocks of headroom kept before the channel and sequencing-window deadlines.
    #[builder(default = 10)]
    pub sub_safety_margin: u64,
    /// Channel timeout of the rollup, in L1 blocks.
    #[builder(default = 300)]
    pub channel_timeout: u64,
    #[builder(default = BatchType::Single)]
    pub batch_type: BatchType,
    #[builder(default)]
    pub compressor: CompressorType,
    #[builder(default)]
    pub compression_algo: CompressionAlgo,
    #[builder(default = 0.4)]
    pub approx_compr_ratio: f64,
    #[builder(default)]
    pub use_blobs: bool,
    /// L1 runs Prague: up to nine blobs per block.
    #[builder(default)]
    pub l1_prague: bool,
    /// Estimated DA bytes the manager holds before refusing new blocks. Zero disables the limit.
    #[builder(default = 0)]
    pub max_pending_da: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ChannelConfig {
    /// Switch to blob transactions carrying `num_blobs` full-blob frames each.
    pub fn with_blobs(mut self, num_blobs: usize) -> Self {
        self.use_blobs = true;
        self.max_frame_size = MAX_BLOB_FRAME_SIZE;
        self.target_num_frames = num_blobs;
        self
    }

    pub const fn max_blobs_per_tx(&self) -> usize {
        if self.l1_prague {
            MAX_BLOBS_PER_BLOCK_PRAGUE
        } else {
            MAX_BLOBS_PER_BLOCK_CANCUN
        }
    }

    /// Frames per transaction: one for calldata, the blob count for blobs.
    pub const fn max_frames_per_tx(&self) -> usize {
        if self.use_blobs {
            self.target_num_frames
        } else {
            1
        }
    }

    /// Inclusion span after which a channel is considered timed out.
    pub const fn inclusion_timeout(&self) -> u64 {
        self.channel_timeout.saturating_sub(self.sub_safety_margin)
    }

    pub fn compressor_config(&self) -> CompressorConfig {
        CompressorConfig::builder()
            .target_output_size(max_data_size(self.target_num_frames, self.max_frame_size))
            .approx_compr_ratio(self.approx_compr_ratio)
            .kind(self.compressor)
            .algo(self.compression_algo)
            .build()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_size <= FRAME_OVERHEAD {
            return Err(ConfigError::FrameSizeTooSmall(self.max_frame_size));
        }
        if self.target_num_frames == 0 {
            return Err(ConfigError::NoFrames);
        }
        if self.use_blobs {
            if self.max_frame_size > MAX_BLOB_FRAME_SIZE {
                return Err(ConfigError::FrameSizeTooLarge(self.max_frame_size));
            }
            let max = self.max_blobs_per_tx();
            if self.target_num_frames > max {
                return Err(ConfigError::TooManyBlobs { frames: self.target_num_frames, max });
            }
        }
        if self.sub_safety_margin >= self.channel_timeout {
            return Err(ConfigError::SafetyMargin {
                margin: self.sub_safety_margin,
                timeout: self.channel_timeout,
            });
        }
        Ok(())
    }
}

/// Submission loop settings.
#[derive(Debug, Clone, Builder)]
pub struct BatcherConfig {
    #[builder(default)]
    pub channel: ChannelConfig,
    /// Interval between polls of the rollup node.
    #[builder(default = Duration::from_secs(6))]
    pub poll_interval: Duration,
    /// Transactions in flight at once.
    #[builder(default = 1)]
    pub max_pending_transactions: usize,
    #[builder(default = Duration::from_secs(60))]
    pub metrics_interval: Duration,
    /// How long shutdown waits for the last frames to land.
    #[builder(default = Duration::from_secs(60))]
    pub drain_timeout: Duration,
    /// DA throttling; `None` leaves the sequencer alone.
    pub throttle: Option<ThrottleConfig>,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
