//! Reads batches out of a ready channel.

use alloy_primitives::Bytes;
use alloy_rlp::Decodable;

use crate::{
    batch::{Batch, BatchError},
    compression::{self, CompressionError},
    config::RollupConfig,
};

/// Decompresses channel data lazily and yields the RLP-framed batches it contains.
#[derive(Debug, Clone)]
pub struct BatchReader {
    compressed: Vec<u8>,
    decompressed: Option<Vec<u8>>,
    cursor: usize,
    max_rlp_bytes: usize,
}

impl BatchReader {
    pub fn new(data: Vec<u8>, max_rlp_bytes: usize) -> Self {
        Self { compressed: data, decompressed: None, cursor: 0, max_rlp_bytes }
    }

    /// Decompress the channel if not done yet.
    pub fn decompress(&mut self, allow_brotli: bool) -> Result<(), CompressionError> {
        if self.decompressed.is_none() {
            let out = compression::decompress(&self.compressed, self.max_rlp_bytes, allow_brotli)?;
            self.decompressed = Some(out);
        }
        Ok(())
    }

    /// Raw bytes of the next batch, or `None` once the channel is exhausted or corrupt.
    pub fn next_batch_data(&mut self) -> Option<Bytes> {
        let data = self.decompressed.as_ref()?;
        let mut rest = data.get(self.cursor..)?;
        if rest.is_empty() {
            return None;
        }
        let before = rest.len();
        let item = Bytes::decode(&mut rest).ok()?;
        self.cursor += before - rest.len();
        Some(item)
    }

    /// Decode the next batch of the channel.
    pub fn next_batch(&mut self, cfg: &RollupConfig) -> Option<Result<Batch, BatchError>> {
        let data = self.next_batch_data()?;
        Some(Batch::decode(&data, cfg))
    }
}
