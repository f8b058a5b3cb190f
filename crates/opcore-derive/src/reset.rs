//! Where to restart derivation after a reorg or on startup.

use alloy_primitives::{B256, U256};
use opcore_pipeline::{Hardfork, RollupConfig, SystemConfig};
use opcore_stream::{l1_info_of, L1Provider, L2Block, L2Provider};
use opcore_types::{L1BlockRef, L2BlockRef};
use tracing::{debug, info};

use crate::errors::{PipelineError, PipelineResult, ResetError};

/// Safe head to derive on top of, and the L1 block to start reading from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetTarget {
    pub safe_head: L2BlockRef,
    pub l1_origin: L1BlockRef,
}

/// Walk back from `safe_head` to a point derivation can restart from.
///
/// The safe head becomes the newest L2 block whose L1 origin is still canonical. The L1 start is
/// the origin of an L2 block at least one channel timeout older, so channels that were open at
/// the safe head are read again in full.
pub async fn find_reset_origin<L1, L2>(
    l1: &L1,
    l2: &L2,
    cfg: &RollupConfig,
    safe_head: &L2BlockRef,
) -> PipelineResult<ResetTarget>
where
    L1: L1Provider,
    L2: L2Provider,
{
    let mut current = l2.block_ref_by_number(Some(safe_head.number)).await?;
    let mut new_safe: Option<L2BlockRef> = None;

    loop {
        if safe_head.l1_origin.number.saturating_sub(current.l1_origin.number) > cfg.seq_window_size
        {
            return Err(ResetError::NoResetOrigin(cfg.seq_window_size).into());
        }

        let origin = l1.block_ref_by_number(current.l1_origin.number).await?;
        if origin.hash == current.l1_origin.hash {
            let head = *new_safe.get_or_insert(current);
            let timeout = cfg.channel_timeout(origin.timestamp);
            if current.number <= cfg.genesis.l2.number
                || current.l1_origin.number + timeout <= head.l1_origin.number
            {
                info!(
                    target: "opcore::derive",
                    safe_head = head.number,
                    l1_origin = origin.number,
                    "found reset origin"
                );
                return Ok(ResetTarget { safe_head: head, l1_origin: origin });
            }
        } else {
            debug!(
                target: "opcore::derive",
                l2_block = current.number,
                l1_origin = current.l1_origin.number,
                "L1 origin no longer canonical"
            );
            new_safe = None;
        }

        if current.number <= cfg.genesis.l2.number {
            return Err(ResetError::NoResetOrigin(cfg.seq_window_size).into());
        }
        current = l2.block_ref_by_number(Some(current.number - 1)).await?;
    }
}

/// System config in force at an L2 block, recovered from the block itself.
///
/// The L1 info deposit carries the batcher and fee scalars, the header carries the gas limit and,
/// from Holocene, the EIP-1559 parameters in `extra_data`.
pub fn system_config_from_l2_block(
    block: &L2Block,
    cfg: &RollupConfig,
) -> PipelineResult<SystemConfig> {
    let header = &block.header;
    if header.number == cfg.genesis.l2.number {
        let genesis = cfg
            .genesis
            .system_config
            .as_ref()
            .ok_or(PipelineError::MissingOrigin.crit())?;
        return Ok(SystemConfig::from(genesis));
    }

    let info = l1_info_of(block)?;
    let mut sys = SystemConfig::default();
    sys.batcher_address = info.batcher_addr;
    sys.gas_limit = header.gas_limit;
    sys.operator_fee_scalar = info.operator_fee_scalar;
    sys.operator_fee_constant = info.operator_fee_constant;

    match cfg.l1_info_format(header.timestamp) {
        Hardfork::Bedrock => {
            sys.overhead = info.l1_fee_overhead;
            sys.scalar = B256::from(info.l1_fee_scalar.to_be_bytes::<32>());
        }
        Hardfork::Ecotone | Hardfork::Isthmus => {
            let mut scalar = [0u8; 32];
            scalar[0] = 1;
            scalar[24..28].copy_from_slice(&info.blob_basefee_scalar.to_be_bytes());
            scalar[28..32].copy_from_slice(&info.basefee_scalar.to_be_bytes());
            sys.overhead = U256::ZERO;
            sys.scalar = B256::from(scalar);
        }
    }

    if cfg.is_holocene_active(header.timestamp) {
        let extra = header.extra_data.as_ref();
        if extra.len() >= 9 && extra[0] == 0 {
            sys.eip1559_denominator = u32::from_be_bytes([extra[1], extra[2], extra[3], extra[4]]);
            sys.eip1559_elasticity = u32::from_be_bytes([extra[5], extra[6], extra[7], extra[8]]);
        }
    }
    Ok(sys)
}
