//! Batch codec and validity rules.
//!
//! Supports SingleBatch (type 0) and SpanBatch (type 1, introduced in Delta). A batch is stored in
//! a channel as an RLP string of `type_byte ‖ payload`.

mod single;
mod span;
mod span_txs;

pub use single::SingleBatch;
pub use span::{SpanBatch, SpanBatchElement};

use alloy_primitives::Bytes;
use alloy_rlp::Encodable;

use crate::{config::RollupConfig, deposits::DEPOSIT_TX_TYPE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BatchType {
    Single = 0,
    Span = 1,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("empty buffer")]
    EmptyBuffer,
    #[error("unknown batch type {0}")]
    UnknownType(u8),
    #[error("rlp: {0}")]
    Rlp(#[from] alloy_rlp::Error),
    #[error("buffer too short reading {0}")]
    BufferTooShort(&'static str),
    #[error("invalid varint in {0}")]
    Varint(&'static str),
    #[error("span batch has no blocks")]
    EmptySpanBatch,
    #[error("too many span batch elements: {0}")]
    TooManyElements(u64),
    #[error("bitlist {0} has bits past its length")]
    BitlistOverflow(&'static str),
    #[error("unsupported transaction type {0:#04x}")]
    UnsupportedTxType(u8),
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("span batch requires a parent timestamp after genesis")]
    TimestampBeforeGenesis,
    #[error("span batch blocks are not contiguous")]
    NotContiguous,
    #[error("trailing bytes after batch")]
    TrailingBytes,
}

/// A decoded batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Batch {
    Single(SingleBatch),
    Span(SpanBatch),
}

impl Batch {
    /// Decode `type_byte ‖ payload`.
    pub fn decode(data: &[u8], cfg: &RollupConfig) -> Result<Self, BatchError> {
        let (&ty, rest) = data.split_first().ok_or(BatchError::EmptyBuffer)?;
        match ty {
            0 => Ok(Self::Single(SingleBatch::decode(rest)?)),
            1 => Ok(Self::Span(SpanBatch::decode(rest, cfg)?)),
            other => Err(BatchError::UnknownType(other)),
        }
    }

    /// Encode as `type_byte ‖ payload`.
    pub fn encode(&self, cfg: &RollupConfig) -> Result<Vec<u8>, BatchError> {
        let mut out = Vec::new();
        match self {
            Self::Single(b) => {
                out.push(BatchType::Single as u8);
                b.encode(&mut out);
            }
            Self::Span(b) => {
                out.push(BatchType::Span as u8);
                b.encode(cfg, &mut out)?;
            }
        }
        Ok(out)
    }

    /// Encode as the RLP string stored in a channel.
    pub fn encode_for_channel(&self, cfg: &RollupConfig) -> Result<Vec<u8>, BatchError> {
        let raw = Bytes::from(self.encode(cfg)?);
        let mut out = Vec::with_capacity(raw.length());
        raw.encode(&mut out);
        Ok(out)
    }

    pub const fn batch_type(&self) -> BatchType {
        match self {
            Self::Single(_) => BatchType::Single,
            Self::Span(_) => BatchType::Span,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Self::Single(b) => b.timestamp,
            Self::Span(b) => b.starting_timestamp(),
        }
    }
}

/// Outcome of checking a batch against the current safe head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchValidity {
    /// Invalid now and in the future, unless we reorg.
    Drop,
    /// Valid, process it.
    Accept,
    /// Lacking L1 information to decide.
    Undecided,
    /// May become valid, check again later.
    Future,
    /// Holocene: an old batch, skip it without flushing the channel.
    Past,
}

impl BatchValidity {
    #[inline]
    pub const fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }

    #[inline]
    pub const fn is_drop(&self) -> bool {
        matches!(self, Self::Drop)
    }
}

/// Returns true if any transaction is empty or a deposit.
pub(crate) fn has_invalid_transactions(txs: &[Bytes]) -> bool {
    txs.iter().any(|tx| tx.first().is_none_or(|b| *b == DEPOSIT_TX_TYPE))
}
