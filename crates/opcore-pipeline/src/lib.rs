//! OP Stack derivation primitives.
//!
//! Everything here is synchronous and I/O free:
//! - Frame and channel codecs, channel bank and Holocene channel assembler
//! - Channel compression (zlib, brotli) with ratio and shadow size estimators
//! - Blob data encoding (OP v0 field element layout)
//! - Single and span batches, with batch validity checks
//! - Deposits, L1 info transactions, system config replay and payload attributes
//! - Output roots and withdrawal hashes

pub mod attributes;
pub mod batch;
pub mod blob;
pub mod channel;
pub mod compression;
pub mod config;
pub mod deposits;
pub mod frame;
pub mod l1_info;
pub mod output;
pub mod system_config;

#[cfg(test)]
mod tests;

pub use attributes::{l1_block_info, with_batch_transactions, AttributesBuilder, AttributesError};
pub use batch::{
    Batch, BatchError, BatchType, BatchValidity, SingleBatch, SpanBatch, SpanBatchElement,
};
pub use blob::{decode_blob, encode_blob, encode_blobs, BlobError, BLOB_MAX_DATA_SIZE};
pub use channel::{BatchReader, Channel, ChannelAssembler, ChannelBank, ChannelError};
pub use compression::{
    decompress, new_compressor, CompressionAlgo, CompressionError, CompressorConfig,
    CompressorType, CompressorWriter,
};
pub use config::{GenesisSystemConfig, RollupConfig};
pub use deposits::{
    deposits_from_receipts, DepositError, DepositedTransaction, DEPOSIT_TX_TYPE,
    TRANSACTION_DEPOSITED_TOPIC,
};
pub use frame::{decode_frames, encode_frames, ChannelId, Frame, FrameError};
pub use l1_info::{
    compute_l1_info_source_hash, Hardfork, L1BlockInfo, L1InfoError,
    BEDROCK_L1_INFO_TX_CALLDATA_LEN, ECOTONE_L1_INFO_TX_CALLDATA_LEN,
    ISTHMUS_L1_INFO_TX_CALLDATA_LEN, L1_ATTRIBUTES_DEPOSITOR, L1_BLOCK_ADDRESS, L1_INFO_TX_GAS,
};
pub use output::{output_root, withdrawal_hash, OutputRootProof};
pub use system_config::{SystemConfig, SystemConfigError};
