//! Shared types for the opcore crate family.
//!
//! Everything here is plain data: block references, sync status, engine API payloads and the
//! serialized channel state used for introspection. Codecs that several services agree on (the
//! replicated payload envelope) live here too so the conductor and the engine client share them.

mod channel;
mod payload;
mod refs;

pub use channel::{ChannelState, FrameState};
pub use payload::{
    ExecutionPayload, ExecutionPayloadEnvelope, ForkchoiceState, ForkchoiceUpdated,
    PayloadAttributes, PayloadCodecError, PayloadStatus, PayloadStatusKind, PayloadVersion,
    Withdrawal,
};
pub use refs::{BlockId, L1BlockRef, L2BlockRef, OutputResponse, SyncStatus};
