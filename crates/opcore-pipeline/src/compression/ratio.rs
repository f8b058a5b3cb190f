//! Ratio compressor: assumes a fixed compression ratio and never measures.

use super::{CompressionError, CompressorConfig, CompressorWriter, Stream};

#[derive(Debug, Clone)]
pub struct RatioCompressor {
    config: CompressorConfig,
    stream: Stream,
}

impl RatioCompressor {
    pub fn new(config: CompressorConfig) -> Self {
        Self { config, stream: Stream::default() }
    }

    /// Input budget implied by the target and the assumed ratio.
    #[inline]
    pub fn input_threshold(&self) -> u64 {
        (self.config.target_output_size as f64 / self.config.approx_compr_ratio) as u64
    }
}

impl CompressorWriter for RatioCompressor {
    fn write(&mut self, data: &[u8]) -> Result<usize, CompressionError> {
        if self.stream.closed {
            return Err(CompressionError::Closed);
        }
        if self.is_full() {
            return Err(CompressionError::ChannelFull);
        }
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
    }

    fn len(&self) -> usize {
        if self.stream.closed {
            self.stream.unread()
        } else {
            (self.stream.input.len() as f64 * self.config.approx_compr_ratio) as usize
        }
    }

    fn read_output(&mut self, buf: &mut [u8]) -> usize {
        self.stream.read(buf)
    }

    fn is_full(&self) -> bool {
        self.stream.input.len() as u64 >= self.input_threshold()
    }
}
