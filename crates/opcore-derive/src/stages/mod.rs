//! Pipeline stages, bottom to top:
//!
//! ```text
//! L1Traversal -> L1Retrieval -> FrameQueue -> ChannelMux -> ChannelReader -> BatchMux -> AttributesQueue
//! ```

mod attributes_queue;
mod batch;
mod channel_mux;
mod channel_reader;
mod frame_queue;
mod retrieval;
mod traversal;

pub use attributes_queue::{AttributesQueue, AttributesWithParent};
pub use batch::{BatchMux, BatchQueue, BatchStage, BatchWindow, BatchWithInclusion};
pub use channel_mux::ChannelMux;
pub use channel_reader::ChannelReader;
pub use frame_queue::FrameQueue;
pub use retrieval::{EthereumDataSource, L1Retrieval};
pub use traversal::L1Traversal;
