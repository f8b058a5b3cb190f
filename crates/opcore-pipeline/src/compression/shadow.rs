//! Shadow compressor.
//!
//! Keeps a running upper bound on the output size. Once the bound crosses the target the
//! accepted input plus the new write is compressed for real, and the write is refused if the
//! result would not fit. The first write is always accepted so that a single block larger than
//! the target can still be sent across several frames.

use super::{CompressionError, CompressorConfig, CompressorWriter, Stream};

/// Worst-case zlib blow-up on incompressible data: 2 byte header, 4 byte digest, 5 byte eof and
/// a 5 byte block header per 16k over a 128k frame.
pub const SAFE_COMPRESSION_OVERHEAD: u64 = 51;

/// Bytes the zlib writer emits on close.
pub const CLOSE_OVERHEAD_ZLIB: u64 = 9;

#[derive(Debug, Clone)]
pub struct ShadowCompressor {
    config: CompressorConfig,
    stream: Stream,
    /// Upper bound on the compressed size of the accepted input.
    bound: u64,
    is_full: bool,
}

impl ShadowCompressor {
    pub fn new(config: CompressorConfig) -> Self {
        Self { config, stream: Stream::default(), bound: SAFE_COMPRESSION_OVERHEAD, is_full: false }
    }

    fn shadow_len(&self, extra: &[u8]) -> Result<u64, CompressionError> {
        let mut candidate = Vec::with_capacity(self.stream.input.len() + extra.len());
        candidate.extend_from_slice(&self.stream.input);
        candidate.extend_from_slice(extra);
        Ok(self.config.algo.compress(&candidate)?.len() as u64)
    }
}

impl CompressorWriter for ShadowCompressor {
    fn write(&mut self, data: &[u8]) -> Result<usize, CompressionError> {
        if self.stream.closed {
            return Err(CompressionError::Closed);
        }
        if self.is_full {
            return Err(CompressionError::ChannelFull);
        }

        let target = self.config.target_output_size;
        let mut new_bound = self.bound + data.len() as u64;
        if new_bound > target {
            // The estimate is no longer safe, measure.
            let measured = self.shadow_len(data)?;
            new_bound = measured + CLOSE_OVERHEAD_ZLIB;
            if measured > target && !self.stream.input.is_empty() {
                self.is_full = true;
                return Err(CompressionError::ChannelFull);
            }
            if new_bound > target {
                self.is_full = true;
            }
        }

        self.bound = new_bound;
        self.stream.input.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> Result<(), CompressionError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), CompressionError> {
        self.stream.close(self.config.algo)
    }

    fn reset(&mut self) {
        self.stream = Stream::default();
        self.bound = SAFE_COMPRESSION_OVERHEAD;
        self.is_full = false;
    }

    fn len(&self) -> usize {
        if self.stream.closed {
            self.stream.unread()
        } else {
            self.bound.min(self.config.target_output_size) as usize
        }
    }

    fn read_output(&mut self, buf: &mut [u8]) -> usize {
        self.stream.read(buf)
    }

    fn is_full(&self) -> bool {
        self.is_full
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, RngCore, SeedableRng};

    use super::*;
    use crate::compression::{decompress, CompressionAlgo};

    fn config(target: u64, algo: CompressionAlgo) -> CompressorConfig {
        CompressorConfig::builder().target_output_size(target).algo(algo).build()
    }

    fn fill_random(c: &mut ShadowCompressor, seed: u64) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut accepted = Vec::new();
        loop {
            let mut chunk = vec![0u8; 700];
            rng.fill_bytes(&mut chunk);
            match c.write(&chunk) {
                Ok(_) => accepted.extend_from_slice(&chunk),
                Err(CompressionError::ChannelFull) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        accepted
    }

    #[test]
    fn test_output_never_exceeds_target() {
        for algo in [CompressionAlgo::Zlib, CompressionAlgo::Brotli10] {
            for target in [2_000u64, 10_000, 50_000] {
                let mut c = ShadowCompressor::new(config(target, algo));
                let accepted = fill_random(&mut c, target);
                c.close().unwrap();
                let mut out = vec![0u8; c.len()];
                assert_eq!(c.read_output(&mut out), out.len());
                assert!(out.len() as u64 <= target, "{algo:?} {target}: {}", out.len());
                assert_eq!(decompress(&out, usize::MAX, true).unwrap(), accepted);
            }
        }
    }

    #[test]
    fn test_first_write_always_accepted() {
        let mut c = ShadowCompressor::new(config(100, CompressionAlgo::Zlib));
        let mut rng = StdRng::seed_from_u64(1);
        let mut big = vec![0u8; 1000];
        rng.fill_bytes(&mut big);
        assert_eq!(c.write(&big).unwrap(), 1000);
        assert!(c.is_full());
        assert_eq!(c.write(b"more"), Err(CompressionError::ChannelFull));
    }

    #[test]
    fn test_compressible_input_fills_past_target() {
        let mut c = ShadowCompressor::new(config(1_000, CompressionAlgo::Zlib));
        let block = vec![0xabu8; 500];
        for _ in 0..20 {
            c.write(&block).unwrap();
        }
        assert!(!c.is_full());
    }

    #[test]
    fn test_reset() {
        let mut c = ShadowCompressor::new(config(1_000, CompressionAlgo::Zlib));
        fill_random(&mut c, 7);
        assert!(c.is_full());
        c.reset();
        assert!(!c.is_full());
        assert!(c.write(b"abc").is_ok());
    }
}
