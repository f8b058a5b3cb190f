//! Engine API conversation with the L2 execution client.
//!
//! The controller owns the `{unsafe, safe, finalized}` head triple and is the only writer of
//! forkchoice. Derived attributes either confirm an unsafe block already in the engine
//! (consolidation) or are built into a new block with the four-call sequence:
//!
//! ```text
//! forkchoiceUpdated(parent, attrs) -> payload id
//! getPayload(id)                   -> envelope
//! newPayload(envelope)             -> status
//! forkchoiceUpdated(new head)
//! ```

use std::sync::Arc;

use alloy_eips::eip2718::Decodable2718;
use alloy_primitives::B256;
use op_alloy_consensus::OpTxEnvelope;
use opcore_pipeline::{L1BlockInfo, RollupConfig};
use opcore_stream::{l2_block_ref, raw_transactions, EngineApi, EngineVersion, L1SourceError, L2Provider};
use opcore_types::{
    BlockId, ExecutionPayloadEnvelope, ForkchoiceState, L2BlockRef, PayloadStatus,
    PayloadStatusKind, PayloadVersion,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::stages::AttributesWithParent;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Api(#[from] L1SourceError),
    #[error("engine rejected payload: {0:?}")]
    InvalidPayload(PayloadStatus),
    #[error("payload shape {got:?} does not match fork version {expected:?}")]
    ShapeMismatch { expected: PayloadVersion, got: PayloadVersion },
    #[error("pre-Ecotone payload at {0} carries a parent beacon root")]
    UnexpectedBeaconRoot(u64),
    #[error("forkchoiceUpdated returned no payload id")]
    MissingPayloadId,
    #[error("block {number} ({hash}) is not on the canonical unsafe chain")]
    NotAncestor { number: u64, hash: B256 },
    #[error("payload decode error: {0}")]
    Decode(String),
}

/// Engine API method generation for a block at `timestamp`.
pub fn engine_version(cfg: &RollupConfig, timestamp: u64) -> EngineVersion {
    if cfg.is_isthmus_active(timestamp) {
        EngineVersion::V4
    } else if cfg.is_ecotone_active(timestamp) {
        EngineVersion::V3
    } else {
        EngineVersion::V2
    }
}

/// Payload shape the engine must return for a block at `timestamp`.
pub fn payload_version(cfg: &RollupConfig, timestamp: u64) -> PayloadVersion {
    if cfg.is_isthmus_active(timestamp) {
        PayloadVersion::V4
    } else if cfg.is_ecotone_active(timestamp) {
        PayloadVersion::V3
    } else if cfg.is_canyon_active(timestamp) {
        PayloadVersion::V2
    } else {
        PayloadVersion::V1
    }
}

/// Reject envelopes whose fields do not match the fork active at their timestamp.
pub fn check_payload_shape(
    cfg: &RollupConfig,
    envelope: &ExecutionPayloadEnvelope,
) -> Result<(), EngineError> {
    let payload = &envelope.execution_payload;
    let expected = payload_version(cfg, payload.timestamp);
    if !payload.matches_version(expected) {
        return Err(EngineError::ShapeMismatch { expected, got: payload.version() });
    }
    if envelope.parent_beacon_block_root.is_some() && !cfg.is_ecotone_active(payload.timestamp) {
        return Err(EngineError::UnexpectedBeaconRoot(payload.timestamp));
    }
    Ok(())
}

/// Block reference of an execution payload, reading the L1 origin from its first transaction.
pub fn payload_to_block_ref(
    cfg: &RollupConfig,
    envelope: &ExecutionPayloadEnvelope,
) -> Result<L2BlockRef, EngineError> {
    let payload = &envelope.execution_payload;
    let (l1_origin, sequence_number) = if payload.block_number == cfg.genesis.l2.number {
        (cfg.genesis.l1, 0)
    } else {
        let first = payload
            .transactions
            .first()
            .ok_or_else(|| EngineError::Decode("payload has no transactions".into()))?;
        let tx = OpTxEnvelope::decode_2718(&mut first.as_ref())
            .map_err(|e| EngineError::Decode(e.to_string()))?;
        let OpTxEnvelope::Deposit(deposit) = tx else {
            return Err(EngineError::Decode("first transaction is not the L1 info deposit".into()));
        };
        let (_, info) = L1BlockInfo::decode_calldata(&deposit.inner().input)
            .map_err(|e| EngineError::Decode(e.to_string()))?;
        (BlockId::new(info.hash, info.number), info.sequence_number)
    };
    Ok(L2BlockRef {
        hash: payload.block_hash,
        number: payload.block_number,
        parent_hash: payload.parent_hash,
        timestamp: payload.timestamp,
        l1_origin,
        sequence_number,
    })
}

/// The L2 head triple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineHeads {
    pub unsafe_head: L2BlockRef,
    pub safe_head: L2BlockRef,
    pub finalized_head: L2BlockRef,
}

impl EngineHeads {
    /// All three heads at the same block, as after genesis.
    pub const fn at(block: L2BlockRef) -> Self {
        Self { unsafe_head: block, safe_head: block, finalized_head: block }
    }

    pub const fn forkchoice(&self) -> ForkchoiceState {
        ForkchoiceState {
            head_block_hash: self.unsafe_head.hash,
            safe_block_hash: self.safe_head.hash,
            finalized_block_hash: self.finalized_head.hash,
        }
    }
}

/// Serialized engine conversation for one chain.
#[derive(Debug)]
pub struct EngineController<E, L2> {
    engine: E,
    l2: L2,
    cfg: Arc<RollupConfig>,
    heads: EngineHeads,
}

impl<E: EngineApi, L2: L2Provider> EngineController<E, L2> {
    pub fn new(engine: E, l2: L2, cfg: Arc<RollupConfig>, heads: EngineHeads) -> Self {
        Self { engine, l2, cfg, heads }
    }

    pub const fn heads(&self) -> &EngineHeads {
        &self.heads
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Move the safe head back after a pipeline reset. Forkchoice is sent with the next update.
    pub fn rewind_safe(&mut self, safe: L2BlockRef) {
        self.heads.safe_head = safe;
        if self.heads.finalized_head.number > safe.number {
            self.heads.finalized_head = safe;
        }
        if self.heads.unsafe_head.number < safe.number {
            self.heads.unsafe_head = safe;
        }
    }

    async fn update_forkchoice(&self, version: EngineVersion) -> Result<(), EngineError> {
        let updated = self.engine.forkchoice_updated(version, self.heads.forkchoice(), None).await?;
        match updated.payload_status.status {
            PayloadStatusKind::Valid | PayloadStatusKind::Syncing => Ok(()),
            _ => Err(EngineError::InvalidPayload(updated.payload_status)),
        }
    }

    /// Insert a gossiped or sequenced block as the new unsafe head.
    pub async fn insert_unsafe(
        &mut self,
        envelope: &ExecutionPayloadEnvelope,
    ) -> Result<L2BlockRef, EngineError> {
        check_payload_shape(&self.cfg, envelope)?;
        let timestamp = envelope.execution_payload.timestamp;
        let version = engine_version(&self.cfg, timestamp);

        let status = self.engine.new_payload(version, envelope).await?;
        if !matches!(
            status.status,
            PayloadStatusKind::Valid | PayloadStatusKind::Accepted | PayloadStatusKind::Syncing
        ) {
            return Err(EngineError::InvalidPayload(status));
        }

        let block = payload_to_block_ref(&self.cfg, envelope)?;
        let previous = self.heads.unsafe_head;
        self.heads.unsafe_head = block;
        if let Err(err) = self.update_forkchoice(version).await {
            self.heads.unsafe_head = previous;
            return Err(err);
        }
        debug!(target: "opcore::derive", number = block.number, hash = %block.hash, "inserted unsafe block");
        Ok(block)
    }

    /// Returns an error unless `block` is on the chain ending at the unsafe head.
    async fn ensure_canonical(&self, block: &L2BlockRef) -> Result<(), EngineError> {
        let not_ancestor = || EngineError::NotAncestor { number: block.number, hash: block.hash };
        if block.number > self.heads.unsafe_head.number {
            return Err(not_ancestor());
        }
        if block.number == self.heads.unsafe_head.number {
            return (block.hash == self.heads.unsafe_head.hash).then_some(()).ok_or_else(not_ancestor);
        }
        let canonical = self.l2.block_ref_by_number(Some(block.number)).await?;
        (canonical.hash == block.hash).then_some(()).ok_or_else(not_ancestor)
    }

    pub async fn promote_safe(&mut self, safe: L2BlockRef) -> Result<(), EngineError> {
        self.ensure_canonical(&safe).await?;
        self.heads.safe_head = safe;
        self.update_forkchoice(engine_version(&self.cfg, safe.timestamp)).await?;
        debug!(target: "opcore::derive", number = safe.number, "promoted safe head");
        Ok(())
    }

    pub async fn promote_finalized(&mut self, finalized: L2BlockRef) -> Result<(), EngineError> {
        if finalized.number > self.heads.safe_head.number {
            return Err(EngineError::NotAncestor { number: finalized.number, hash: finalized.hash });
        }
        self.ensure_canonical(&finalized).await?;
        self.heads.finalized_head = finalized;
        self.update_forkchoice(engine_version(&self.cfg, finalized.timestamp)).await?;
        info!(target: "opcore::derive", number = finalized.number, "finalized L2 block");
        Ok(())
    }

    /// Build a block from derived attributes and make it the new safe and unsafe head.
    pub async fn build_and_insert(
        &mut self,
        attrs: &AttributesWithParent,
    ) -> Result<L2BlockRef, EngineError> {
        let version = engine_version(&self.cfg, attrs.timestamp());
        let state = ForkchoiceState {
            head_block_hash: attrs.parent.hash,
            safe_block_hash: self.heads.safe_head.hash,
            finalized_block_hash: self.heads.finalized_head.hash,
        };

        let updated = self.engine.forkchoice_updated(version, state, Some(&attrs.attributes)).await?;
        if !updated.payload_status.is_valid() {
            return Err(EngineError::InvalidPayload(updated.payload_status));
        }
        let payload_id = updated.payload_id.ok_or(EngineError::MissingPayloadId)?;

        let envelope = self.engine.get_payload(version, payload_id).await?;
        check_payload_shape(&self.cfg, &envelope)?;
        let status = self.engine.new_payload(version, &envelope).await?;
        if !status.is_valid() {
            return Err(EngineError::InvalidPayload(status));
        }

        let block = payload_to_block_ref(&self.cfg, &envelope)?;
        self.heads.unsafe_head = block;
        self.heads.safe_head = block;
        self.update_forkchoice(version).await?;
        debug!(
            target: "opcore::derive",
            number = block.number,
            hash = %block.hash,
            txs = envelope.execution_payload.transactions.len(),
            "built safe block"
        );
        Ok(block)
    }

    /// Compare derived attributes with the unsafe block already at their height.
    async fn consolidate(
        &mut self,
        attrs: &AttributesWithParent,
    ) -> Result<Option<L2BlockRef>, EngineError> {
        let block = self.l2.block_by_number(Some(attrs.parent.number + 1)).await?;
        let header = &block.header;
        let a = &attrs.attributes;

        let mismatch = if header.parent_hash != attrs.parent.hash {
            Some("parent hash")
        } else if header.timestamp != a.timestamp {
            Some("timestamp")
        } else if header.mix_hash != a.prev_randao {
            Some("prev randao")
        } else if header.beneficiary != a.suggested_fee_recipient {
            Some("fee recipient")
        } else if a.gas_limit.is_some_and(|limit| limit != header.gas_limit) {
            Some("gas limit")
        } else if header.parent_beacon_block_root != a.parent_beacon_block_root {
            Some("parent beacon root")
        } else if block.body.withdrawals.as_ref().map(|w| w.is_empty())
            != a.withdrawals.as_ref().map(Vec::is_empty)
        {
            Some("withdrawals")
        } else if raw_transactions(&block).as_slice() != a.txs() {
            Some("transactions")
        } else {
            None
        };

        if let Some(field) = mismatch {
            warn!(
                target: "opcore::derive",
                number = header.number,
                field,
                "unsafe block does not match derived attributes, rebuilding"
            );
            return Ok(None);
        }

        let safe = l2_block_ref(&block, &self.cfg)?;
        self.heads.safe_head = safe;
        self.update_forkchoice(engine_version(&self.cfg, safe.timestamp)).await?;
        debug!(target: "opcore::derive", number = safe.number, "consolidated unsafe block");
        Ok(Some(safe))
    }

    /// Apply derived attributes: consolidate with the unsafe chain when possible, build
    /// otherwise.
    ///
    /// From Holocene a block the engine rejects is replaced by its deposits-only version.
    pub async fn process_attributes(
        &mut self,
        attrs: &AttributesWithParent,
    ) -> Result<L2BlockRef, EngineError> {
        if self.heads.unsafe_head.number > attrs.parent.number {
            if let Some(safe) = self.consolidate(attrs).await? {
                return Ok(safe);
            }
        }

        match self.build_and_insert(attrs).await {
            Err(EngineError::InvalidPayload(status))
                if self.cfg.is_holocene_active(attrs.timestamp()) =>
            {
                warn!(
                    target: "opcore::derive",
                    timestamp = attrs.timestamp(),
                    error = ?status.validation_error,
                    "invalid payload, retrying with deposits only"
                );
                self.build_and_insert(&attrs.deposits_only()).await
            }
            other => other,
        }
    }
}
