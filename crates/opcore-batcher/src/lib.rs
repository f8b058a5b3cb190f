//! Batch submission for the opcore batcher.
//!
//! Unsafe L2 blocks are turned into batches, compressed into channels, cut into frames and posted
//! to the batch inbox on L1, as calldata or blobs.
//!
//! ```text
//! L2Provider -> ChannelManager -> TxData -> TxManager -> L1
//!                     ^                          |
//!                     +---- confirmed / failed --+
//! ```

mod channel;
mod channel_manager;
mod channel_out;
mod config;
mod driver;
mod metrics;
mod throttle;
mod tx_manager;


pub use channel::{PendingChannel, TxData, TxDataError, TxId};
pub use channel_manager::{ChannelManager, ChannelManagerError, QueuedBlock};
pub use channel_out::{max_data_size, ChannelOut, ChannelOutError, CloseReason, MAX_FRAMES_PER_CHANNEL};
pub use config::{
    BatcherConfig, ChannelConfig, ConfigError, MAX_BLOBS_PER_BLOCK_CANCUN,
    MAX_BLOBS_PER_BLOCK_PRAGUE, MAX_BLOB_FRAME_SIZE,
};
pub use driver::{BatchSubmitter, BatcherError, TickSummary};
pub use metrics::{BatcherMetrics, MetricsSnapshot};
pub use throttle::{SequencerThrottleClient, ThrottleClient, ThrottleConfig, ThrottleController};
pub use tx_manager::{
    bump_fees, initial_fees, intrinsic_gas, FeeInfo, Fees, RpcTransactor, SignerConfig, Transactor,
    TxCandidate, TxManager, TxManagerConfig, TxManagerError, TxReceipt, UnsignedTx, GAS_TIP_CAP, TX_GAS,
};
