//! The replicated state machine: the latest unsafe payload.

use alloy_primitives::{Bytes, B256};
use opcore_types::{ExecutionPayloadEnvelope, PayloadCodecError};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::raft::ClusterMembership;

/// What a log entry asks of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Command {
    /// Appended by every new leader so entries from earlier terms can commit.
    Noop,
    /// An envelope in its versioned wire format.
    Payload(Bytes),
    /// The full membership from this entry on.
    Membership(ClusterMembership),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command: Command,
}

impl LogEntry {
    pub fn payload(index: u64, term: u64, data: impl Into<Bytes>) -> Self {
        Self { index, term, command: Command::Payload(data.into()) }
    }
}

/// What applying an entry did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Stored { number: u64, hash: B256 },
    /// Same payload as the current one, or not a payload at all.
    Unchanged,
    /// The entry did not decode and was skipped.
    Dropped(PayloadCodecError),
}

/// Serialized form of [`UnsafeHeadFsm`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsmSnapshot {
    pub payload: Option<Bytes>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FsmError {
    #[error("snapshot payload: {0}")]
    Codec(#[from] PayloadCodecError),
}

#[derive(Debug)]
pub struct UnsafeHeadFsm {
    latest: Option<ExecutionPayloadEnvelope>,
    dropped: watch::Sender<u64>,
}

impl Default for UnsafeHeadFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl UnsafeHeadFsm {
    pub fn new() -> Self {
        Self { latest: None, dropped: watch::Sender::new(0) }
    }

    pub const fn latest(&self) -> Option<&ExecutionPayloadEnvelope> {
        self.latest.as_ref()
    }

    /// Entries skipped because they failed to decode.
    pub fn dropped(&self) -> u64 {
        *self.dropped.borrow()
    }

    /// Ticks every time an entry is dropped.
    pub fn subscribe_dropped(&self) -> watch::Receiver<u64> {
        self.dropped.subscribe()
    }

    pub fn apply(&mut self, entry: &LogEntry) -> Applied {
        let Command::Payload(data) = &entry.command else {
            return Applied::Unchanged;
        };
        let envelope = match ExecutionPayloadEnvelope::decode(data) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.dropped.send_modify(|n| *n += 1);
                warn!(
                    target: "opcore::conductor",
                    index = entry.index,
                    term = entry.term,
                    %err,
                    "dropping undecodable unsafe payload"
                );
                return Applied::Dropped(err);
            }
        };
        if self.latest.as_ref() == Some(&envelope) {
            return Applied::Unchanged;
        }
        let (number, hash) = (envelope.block_number(), envelope.block_hash());
        debug!(target: "opcore::conductor", index = entry.index, number, %hash, "applied unsafe payload");
        self.latest = Some(envelope);
        Applied::Stored { number, hash }
    }

    pub fn snapshot(&self) -> Result<FsmSnapshot, FsmError> {
        let payload = self.latest.as_ref().map(|p| p.encode()).transpose()?;
        Ok(FsmSnapshot { payload: payload.map(Bytes::from) })
    }

    pub fn restore(&mut self, snapshot: &FsmSnapshot) -> Result<(), FsmError> {
        self.latest =
            snapshot.payload.as_ref().map(|p| ExecutionPayloadEnvelope::decode(p)).transpose()?;
        Ok(())
    }
}
