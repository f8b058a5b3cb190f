//! L2 derivation for the opcore node.
//!
//! A pull-based stage stack turns L1 blocks into payload attributes; the [`EngineController`]
//! turns attributes into safe L2 blocks, and the [`Driver`] ties the two together, resetting the
//! pipeline when L1 or the engine disagrees with what was derived.
//!
//! ```text
//! L1Provider/BlobProvider -> DerivationPipeline -> AttributesWithParent -> EngineController
//! ```

mod driver;
mod engine;
mod errors;
mod pipeline;
mod reset;
mod stages;
mod traits;

#[cfg(test)]
mod tests;

pub use driver::{Driver, DriverConfig, DriverError, Tick};
pub use engine::{
    check_payload_shape, engine_version, payload_to_block_ref, payload_version, EngineController,
    EngineError, EngineHeads,
};
pub use errors::{PipelineError, PipelineErrorKind, PipelineResult, ResetError};
pub use pipeline::{
    AttributesQueueStage, BatchMuxStage, ChannelMuxStage, ChannelReaderStage, DerivationPipeline,
    FrameQueueStage, RetrievalStage, StepResult, TraversalStage,
};
pub use reset::{find_reset_origin, system_config_from_l2_block, ResetTarget};
pub use stages::{
    AttributesQueue, AttributesWithParent, BatchMux, BatchQueue, BatchStage, BatchWindow,
    BatchWithInclusion, ChannelMux, ChannelReader, EthereumDataSource, FrameQueue, L1Retrieval,
    L1Traversal,
};
pub use traits::{
    AttributesProvider, BatchStreamProvider, ChannelMuxProvider, ChannelReaderProvider,
    FrameQueueProvider, L1RetrievalProvider, OriginAdvancer, OriginProvider, ResettableStage,
};
