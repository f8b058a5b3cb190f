//! Engine API client.

use std::{fmt, path::Path, time::Duration};

use alloy_primitives::{B256, B64};
use alloy_rpc_types_engine::JwtSecret;
use async_trait::async_trait;
use opcore_types::{
    ExecutionPayloadEnvelope, ForkchoiceState, ForkchoiceUpdated, PayloadAttributes,
    PayloadStatus,
};
use serde_json::json;
use tracing::trace;

use super::{rpc::RpcClient, L1SourceError};

/// Engine API method generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EngineVersion {
    V2,
    V3,
    V4,
}

impl EngineVersion {
    pub const fn new_payload_method(self) -> &'static str {
        match self {
            Self::V2 => "engine_newPayloadV2",
            Self::V3 => "engine_newPayloadV3",
            Self::V4 => "engine_newPayloadV4",
        }
    }

    /// `forkchoiceUpdated` stops at V3.
    pub const fn forkchoice_updated_method(self) -> &'static str {
        match self {
            Self::V2 => "engine_forkchoiceUpdatedV2",
            Self::V3 | Self::V4 => "engine_forkchoiceUpdatedV3",
        }
    }

    pub const fn get_payload_method(self) -> &'static str {
        match self {
            Self::V2 => "engine_getPayloadV2",
            Self::V3 => "engine_getPayloadV3",
            Self::V4 => "engine_getPayloadV4",
        }
    }
}

/// The engine API conversation used to build and canonicalize L2 blocks.
#[async_trait]
pub trait EngineApi: Send + Sync {
    async fn new_payload(
        &self,
        version: EngineVersion,
        envelope: &ExecutionPayloadEnvelope,
    ) -> Result<PayloadStatus, L1SourceError>;

    async fn forkchoice_updated(
        &self,
        version: EngineVersion,
        state: ForkchoiceState,
        attributes: Option<&PayloadAttributes>,
    ) -> Result<ForkchoiceUpdated, L1SourceError>;

    async fn get_payload(
        &self,
        version: EngineVersion,
        payload_id: B64,
    ) -> Result<ExecutionPayloadEnvelope, L1SourceError>;
}

/// JWT-authenticated engine API client.
pub struct EngineClient {
    rpc: RpcClient,
}

impl fmt::Debug for EngineClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineClient").field("url", &self.rpc.url()).finish_non_exhaustive()
    }
}

impl EngineClient {
    pub fn new(url: impl Into<String>, secret: JwtSecret) -> Result<Self, L1SourceError> {
        Ok(Self { rpc: RpcClient::new(url, Duration::from_secs(10))?.with_jwt(secret) })
    }

    /// Read a hex-encoded JWT secret from disk.
    pub fn load_secret(path: &Path) -> Result<JwtSecret, L1SourceError> {
        let hex = std::fs::read_to_string(path)
            .map_err(|e| L1SourceError::Config(format!("{}: {e}", path.display())))?;
        JwtSecret::from_hex(hex.trim()).map_err(|e| L1SourceError::Jwt(e.to_string()))
    }
}

#[async_trait]
impl EngineApi for EngineClient {
    async fn new_payload(
        &self,
        version: EngineVersion,
        envelope: &ExecutionPayloadEnvelope,
    ) -> Result<PayloadStatus, L1SourceError> {
        let payload = &envelope.execution_payload;
        let beacon_root = envelope.parent_beacon_block_root.unwrap_or(B256::ZERO);
        let params = match version {
            EngineVersion::V2 => json!([payload]),
            EngineVersion::V3 => json!([payload, [], beacon_root]),
            EngineVersion::V4 => json!([payload, [], beacon_root, []]),
        };
        trace!(
            target: "opcore::derive",
            method = version.new_payload_method(),
            number = payload.block_number,
            hash = %payload.block_hash,
            "engine call"
        );
        self.rpc.request(version.new_payload_method(), params).await
    }

    async fn forkchoice_updated(
        &self,
        version: EngineVersion,
        state: ForkchoiceState,
        attributes: Option<&PayloadAttributes>,
    ) -> Result<ForkchoiceUpdated, L1SourceError> {
        self.rpc.request(version.forkchoice_updated_method(), json!([state, attributes])).await
    }

    async fn get_payload(
        &self,
        version: EngineVersion,
        payload_id: B64,
    ) -> Result<ExecutionPayloadEnvelope, L1SourceError> {
        self.rpc.request(version.get_payload_method(), json!([payload_id])).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_names_follow_version() {
        assert_eq!(EngineVersion::V2.new_payload_method(), "engine_newPayloadV2");
        assert_eq!(EngineVersion::V4.new_payload_method(), "engine_newPayloadV4");
        assert_eq!(EngineVersion::V4.forkchoice_updated_method(), "engine_forkchoiceUpdatedV3");
        assert_eq!(EngineVersion::V3.get_payload_method(), "engine_getPayloadV3");
    }
}
