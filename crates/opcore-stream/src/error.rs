//! Error types for the L1, beacon and L2 RPC clients.

use thiserror::Error;

/// Errors raised by the RPC-backed sources.
#[derive(Debug, Error)]
pub enum L1SourceError {
    /// The block is unknown to the node, or not yet past the confirmation depth.
    #[error("not found: {0}")]
    NotFound(String),

    /// The block sits above the confirmation depth. Not retried.
    #[error("block {number} is above confirmation depth (head {head}, depth {depth})")]
    NotConfirmed { number: u64, head: u64, depth: u64 },

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(String),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(String),

    /// JSON-RPC error object returned by the node.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Beacon API request error.
    #[error("beacon API error: {0}")]
    Beacon(String),

    /// Blob not found for the given slot and versioned hash.
    #[error("blob not found: slot={0}, hash={1}")]
    BlobNotFound(u64, String),

    /// A sidecar failed KZG proof verification against its versioned hash.
    #[error("blob sidecar failed KZG verification: {0}")]
    Kzg(String),

    /// RLP or payload decoding error.
    #[error("decode error: {0}")]
    Decode(String),

    /// Engine API authentication failure.
    #[error("engine JWT error: {0}")]
    Jwt(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl L1SourceError {
    /// Returns true if the call should be retried.
    ///
    /// A plain `NotFound` is a tip-chasing miss and is retried; a confirmation depth miss is not.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Http(_) | Self::NotFound(_) | Self::Beacon(_))
    }
}

impl From<reqwest::Error> for L1SourceError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<serde_json::Error> for L1SourceError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e.to_string())
    }
}

impl From<alloy_rlp::Error> for L1SourceError {
    fn from(e: alloy_rlp::Error) -> Self {
        Self::Decode(e.to_string())
    }
}
