//! Derivation errors, classified by how the driver must react.

use alloy_primitives::B256;
use opcore_pipeline::{AttributesError, SystemConfigError};
use opcore_stream::L1SourceError;
use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineErrorKind>;

/// Severity of a pipeline error.
///
/// ```text
/// Temporary -> step again, possibly after waiting for L1 to extend
/// Reset     -> walk back to a safe point and reset every stage
/// Critical  -> stop derivation
/// ```
#[derive(Debug, Error)]
pub enum PipelineErrorKind {
    #[error("temporary: {0}")]
    Temporary(#[source] PipelineError),
    #[error("reset: {0}")]
    Reset(#[from] ResetError),
    #[error("critical: {0}")]
    Critical(#[source] PipelineError),
}

impl PipelineErrorKind {
    /// End-of-stream, the sentinel that makes the pipeline advance its origin.
    pub const fn is_eof(&self) -> bool {
        matches!(self, Self::Temporary(PipelineError::Eof))
    }

    pub const fn is_not_enough_data(&self) -> bool {
        matches!(self, Self::Temporary(PipelineError::NotEnoughData))
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The stage has nothing more for the current L1 origin.
    #[error("end of stream")]
    Eof,
    /// Progress was made but there is no output yet. Step again right away.
    #[error("not enough data")]
    NotEnoughData,
    #[error("pipeline has no L1 origin")]
    MissingOrigin,
    #[error("L1 block {0} is not in the batch window")]
    MissingL1Block(u64),
    #[error(transparent)]
    Provider(#[from] L1SourceError),
    #[error(transparent)]
    SystemConfig(#[from] SystemConfigError),
    #[error(transparent)]
    Attributes(#[from] AttributesError),
}

impl PipelineError {
    #[inline]
    pub const fn temp(self) -> PipelineErrorKind {
        PipelineErrorKind::Temporary(self)
    }

    #[inline]
    pub const fn crit(self) -> PipelineErrorKind {
        PipelineErrorKind::Critical(self)
    }
}

/// Conditions that invalidate the pipeline state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResetError {
    #[error("L1 reorg: expected parent {expected}, got {got}")]
    ReorgDetected { expected: B256, got: B256 },
    #[error("batch parent {parent} does not match L1 origin {origin}")]
    OriginMismatch { parent: u64, origin: u64 },
    #[error("attributes do not fit the parent: {0}")]
    BadAttributes(String),
    #[error("no canonical L1 origin within {0} blocks of the safe head")]
    NoResetOrigin(u64),
}

impl From<L1SourceError> for PipelineErrorKind {
    fn from(err: L1SourceError) -> Self {
        match err {
            // Not there yet: the origin cannot advance until L1 extends.
            L1SourceError::NotFound(_) | L1SourceError::NotConfirmed { .. } => {
                PipelineError::Eof.temp()
            }
            L1SourceError::Decode(_) | L1SourceError::Jwt(_) | L1SourceError::Config(_) => {
                PipelineError::Provider(err).crit()
            }
            _ => PipelineError::Provider(err).temp(),
        }
    }
}

impl From<AttributesError> for PipelineErrorKind {
    fn from(err: AttributesError) -> Self {
        match err {
            AttributesError::BrokenOrigin { .. }
            | AttributesError::OriginHashMismatch { .. }
            | AttributesError::OriginInFuture { .. } => {
                ResetError::BadAttributes(err.to_string()).into()
            }
            other => PipelineError::Attributes(other).crit(),
        }
    }
}
