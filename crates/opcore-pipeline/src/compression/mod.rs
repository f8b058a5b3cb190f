//! Channel compression.
//!
//! - zlib streams are recognised by the deflate method in the low nibble of the first byte.
//! - brotli streams carry a one-byte `0x01` tag (brotli has no self-describing header).
//!
//! Two size-bounded writers feed the batcher: [`ShadowCompressor`] measures real output,
//! [`RatioCompressor`] assumes a fixed compression ratio.

mod ratio;
mod shadow;

pub use ratio::RatioCompressor;
pub use shadow::ShadowCompressor;

use std::io::{Read, Write};

/// zlib CMF low nibble for DEFLATE.
pub const ZLIB_DEFLATE_METHOD: u8 = 8;

/// Channel version byte for brotli-compressed channels.
pub const BROTLI_VERSION: u8 = 0x01;

const BEST_ZLIB_COMPRESSION: u8 = 9;
const BROTLI_WINDOW: u32 = 22;
const BROTLI_BUFFER: usize = 4096;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CompressionError {
    #[error("compressor is full")]
    ChannelFull,
    #[error("compressor already closed")]
    Closed,
    #[error("empty channel data")]
    Empty,
    #[error("unknown compression type: {0:#04x}")]
    UnknownType(u8),
    #[error("brotli channel before Fjord")]
    BrotliNotActive,
    #[error("decompression failed: {0}")]
    Decompression(String),
    #[error("compression failed: {0}")]
    Compression(String),
}

/// Compression algorithm used for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionAlgo {
    #[default]
    Zlib,
    Brotli9,
    Brotli10,
    Brotli11,
}

impl CompressionAlgo {
    #[inline]
    pub const fn is_brotli(&self) -> bool {
        !matches!(self, Self::Zlib)
    }

    /// Compress `data` into a self-describing channel stream.
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        match self {
            Self::Zlib => Ok(miniz_oxide::deflate::compress_to_vec_zlib(data, BEST_ZLIB_COMPRESSION)),
            Self::Brotli9 => compress_brotli(data, 9),
            Self::Brotli10 => compress_brotli(data, 10),
            Self::Brotli11 => compress_brotli(data, 11),
        }
    }
}

impl std::str::FromStr for CompressionAlgo {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "zlib" => Ok(Self::Zlib),
            "brotli" | "brotli-10" => Ok(Self::Brotli10),
            "brotli-9" => Ok(Self::Brotli9),
            "brotli-11" => Ok(Self::Brotli11),
            other => Err(format!("unknown compression algo: {other}")),
        }
    }
}

/// Kind of size-bounded compressor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressorType {
    #[default]
    Shadow,
    Ratio,
    /// Ratio compressor with a ratio of 1.0.
    None,
}

impl std::str::FromStr for CompressorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shadow" => Ok(Self::Shadow),
            "ratio" => Ok(Self::Ratio),
            "none" => Ok(Self::None),
            other => Err(format!("unknown compressor type: {other}")),
        }
    }
}

fn compress_brotli(data: &[u8], quality: u32) -> Result<Vec<u8>, CompressionError> {
    let mut out = vec![BROTLI_VERSION];
    {
        let mut writer =
            brotli::CompressorWriter::new(&mut out, BROTLI_BUFFER, quality, BROTLI_WINDOW);
        writer.write_all(data).map_err(|e| CompressionError::Compression(e.to_string()))?;
    }
    Ok(out)
}

/// Decompress a channel stream, reading at most `max_len` bytes of output.
///
/// Output beyond `max_len` is cut off; the batch reader then fails on the truncated tail.
pub fn decompress(
    data: &[u8],
    max_len: usize,
    allow_brotli: bool,
) -> Result<Vec<u8>, CompressionError> {
    let first = *data.first().ok_or(CompressionError::Empty)?;

    if first & 0x0F == ZLIB_DEFLATE_METHOD {
        match miniz_oxide::inflate::decompress_to_vec_zlib_with_limit(data, max_len) {
            Ok(out) => Ok(out),
            Err(e) if e.status == miniz_oxide::inflate::TINFLStatus::HasMoreOutput => {
                Ok(e.output)
            }
            Err(e) => Err(CompressionError::Decompression(format!("zlib: {:?}", e.status))),
        }
    } else if first == BROTLI_VERSION {
        if !allow_brotli {
            return Err(CompressionError::BrotliNotActive);
        }
        let mut out = Vec::new();
        brotli::Decompressor::new(&data[1..], BROTLI_BUFFER)
            .take(max_len as u64)
            .read_to_end(&mut out)
            .map_err(|e| CompressionError::Decompression(format!("brotli: {e}")))?;
        Ok(out)
    } else {
        Err(CompressionError::UnknownType(first))
    }
}

/// Compressor configuration shared by the batcher's channel outs.
#[derive(Debug, Clone, Copy, PartialEq, bon::Builder)]
pub struct CompressorConfig {
    /// Size the compressed channel should reach but not exceed.
    pub target_output_size: u64,
    /// Assumed ratio for the ratio compressor.
    #[builder(default = 0.4)]
    pub approx_compr_ratio: f64,
    #[builder(default)]
    pub kind: CompressorType,
    #[builder(default)]
    pub algo: CompressionAlgo,
}

/// A writer that accepts input until it estimates its output would exceed a budget.
#[allow(clippy::len_without_is_empty)]
pub trait CompressorWriter {
    /// Write `data`. Returns [`CompressionError::ChannelFull`] if the data was not accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize, CompressionError>;

    /// Flush pending input. Output only becomes readable after [`close`](Self::close).
    fn flush(&mut self) -> Result<(), CompressionError>;

    /// Finish the stream.
    fn close(&mut self) -> Result<(), CompressionError>;

    /// Reset to an empty, open state.
    fn reset(&mut self);

    /// Compressed bytes available (exact after close, an estimate before).
    fn len(&self) -> usize;

    /// Read compressed output into `buf`, returning the number of bytes copied.
    fn read_output(&mut self, buf: &mut [u8]) -> usize;

    /// Whether the compressor refuses further input.
    fn is_full(&self) -> bool;
}

/// Build the writer selected by `config`.
pub fn new_compressor(config: CompressorConfig) -> Box<dyn CompressorWriter + Send> {
    match config.kind {
        CompressorType::Shadow => Box::new(ShadowCompressor::new(config)),
        CompressorType::Ratio => Box::new(RatioCompressor::new(config)),
        CompressorType::None => {
            Box::new(RatioCompressor::new(CompressorConfig { approx_compr_ratio: 1.0, ..config }))
        }
    }
}

/// Accepted input plus the output produced on close. Shared by both writers.
#[derive(Debug, Default, Clone)]
pub(crate) struct Stream {
    pub(crate) input: Vec<u8>,
    pub(crate) output: Vec<u8>,
    pub(crate) read_pos: usize,
    pub(crate) closed: bool,
}

impl Stream {
    pub(crate) fn close(&mut self, algo: CompressionAlgo) -> Result<(), CompressionError> {
        if !self.closed {
            self.output = algo.compress(&self.input)?;
            self.closed = true;
        }
        Ok(())
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> usize {
        let rest = &self.output[self.read_pos..];
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.read_pos += n;
        n
    }

    pub(crate) fn unread(&self) -> usize {
        self.output.len() - self.read_pos
    }
}
