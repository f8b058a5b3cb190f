//! Payload attributes construction.
//!
//! Every derived L2 block is described to the engine as a `PayloadAttributes`:
//! ```text
//! L2 Block N:
//! ├── tx[0]: L1 Attributes Deposit (system tx)
//! ├── tx[1..n]: User Deposits (first block of an epoch only)
//! └── tx[n+1..]: Sequencer Transactions (from batches, appended by the caller)
//! ```
//!
//! An "epoch" is the run of L2 blocks sharing one L1 origin. `sequence_number` restarts at 0 on
//! the first block of each epoch and counts up from there.

use std::sync::Arc;

use alloy_consensus::{Header, Receipt};
use alloy_eips::eip4844::calc_blob_gasprice;
use alloy_primitives::{Bytes, Sealed, B256, U256};
use opcore_types::{L2BlockRef, PayloadAttributes};
use tracing::trace;

use crate::{
    config::{RollupConfig, SEQUENCER_FEE_VAULT},
    deposits::{deposits_from_receipts, DepositError},
    l1_info::{Hardfork, L1BlockInfo},
    system_config::{SystemConfig, SystemConfigError},
};

#[derive(Debug, thiserror::Error)]
pub enum AttributesError {
    /// The epoch does not extend the parent's L1 origin. The pipeline must reset.
    #[error("L1 origin {got} does not follow parent origin {parent}")]
    BrokenOrigin { parent: u64, got: u64 },
    #[error("L1 origin {number} hash mismatch: expected {expected}, got {got}")]
    OriginHashMismatch { number: u64, expected: B256, got: B256 },
    #[error("L2 timestamp {l2} is before L1 origin timestamp {l1}")]
    OriginInFuture { l2: u64, l1: u64 },
    #[error("receipts of the new epoch were not provided")]
    MissingReceipts,
    #[error(transparent)]
    Deposit(#[from] DepositError),
    #[error(transparent)]
    SystemConfig(#[from] SystemConfigError),
}

/// Builds payload attributes from an L1 epoch header and the running system config.
///
/// The builder itself is stateless: the system config is owned by the caller and updated in
/// place whenever an epoch boundary is crossed.
#[derive(Debug, Clone)]
pub struct AttributesBuilder {
    cfg: Arc<RollupConfig>,
}

impl AttributesBuilder {
    pub fn new(cfg: Arc<RollupConfig>) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &RollupConfig {
        &self.cfg
    }

    /// Prepare the attributes of the block following `parent` with L1 origin `epoch`.
    ///
    /// `receipts` must hold the epoch's receipts whenever `epoch` differs from the parent's
    /// origin; they are ignored otherwise.
    pub fn prepare(
        &self,
        sys: &mut SystemConfig,
        parent: &L2BlockRef,
        epoch: &Sealed<Header>,
        receipts: Option<&[Receipt]>,
    ) -> Result<PayloadAttributes, AttributesError> {
        let header = epoch.inner();
        let epoch_hash = epoch.hash();
        let timestamp = parent.timestamp + self.cfg.block_time;

        let mut transactions = Vec::new();
        let sequence_number;
        if parent.l1_origin.number == header.number {
            if parent.l1_origin.hash != epoch_hash {
                return Err(AttributesError::OriginHashMismatch {
                    number: header.number,
                    expected: parent.l1_origin.hash,
                    got: epoch_hash,
                });
            }
            sequence_number = parent.sequence_number + 1;
        } else {
            if header.number != parent.l1_origin.number + 1 {
                return Err(AttributesError::BrokenOrigin {
                    parent: parent.l1_origin.number,
                    got: header.number,
                });
            }
            if header.parent_hash != parent.l1_origin.hash {
                return Err(AttributesError::OriginHashMismatch {
                    number: parent.l1_origin.number,
                    expected: parent.l1_origin.hash,
                    got: header.parent_hash,
                });
            }
            let receipts = receipts.ok_or(AttributesError::MissingReceipts)?;
            sys.start_epoch();
            sys.update_from_receipts(receipts, self.cfg.l1_system_config_address)?;
            let deposits =
                deposits_from_receipts(receipts, self.cfg.deposit_contract_address, epoch_hash)?;
            transactions.reserve(deposits.len() + 1);
            transactions.extend(deposits.iter().map(|d| d.to_bytes()));
            sequence_number = 0;
        }

        if timestamp < header.timestamp {
            return Err(AttributesError::OriginInFuture { l2: timestamp, l1: header.timestamp });
        }

        let fork = self.cfg.l1_info_format(timestamp);
        let info = l1_block_info(sys, header, epoch_hash, sequence_number, fork);
        let l1_info_tx = info.to_deposit_tx(fork, self.cfg.is_regolith_active(timestamp));
        transactions.insert(0, l1_info_tx.to_bytes());

        trace!(
            target: "opcore::derive",
            l2_timestamp = timestamp,
            epoch = header.number,
            sequence_number,
            ?fork,
            deposits = transactions.len() - 1,
            "prepared payload attributes"
        );

        let ecotone = self.cfg.is_ecotone_active(timestamp);
        Ok(PayloadAttributes {
            timestamp,
            prev_randao: header.mix_hash,
            suggested_fee_recipient: SEQUENCER_FEE_VAULT,
            withdrawals: self.cfg.is_canyon_active(timestamp).then(Vec::new),
            parent_beacon_block_root: ecotone
                .then(|| header.parent_beacon_block_root.unwrap_or_default()),
            transactions: Some(transactions),
            no_tx_pool: Some(true),
            gas_limit: Some(sys.gas_limit),
            eip_1559_params: self
                .cfg
                .is_holocene_active(timestamp)
                .then(|| sys.eip1559_params()),
        })
    }
}

/// L1 info contents for an L2 block with the given epoch header and sequence number.
pub fn l1_block_info(
    sys: &SystemConfig,
    header: &Header,
    hash: B256,
    sequence_number: u64,
    fork: Hardfork,
) -> L1BlockInfo {
    let basefee = U256::from(header.base_fee_per_gas.unwrap_or_default());
    // Pre-Cancun L1 blocks report the minimum blob base fee.
    let blob_basefee = U256::from(header.excess_blob_gas.map_or(1, calc_blob_gasprice));
    let (basefee_scalar, blob_basefee_scalar) = sys.ecotone_scalars();

    let info = L1BlockInfo::new(
        header.number,
        header.timestamp,
        basefee,
        hash,
        sequence_number,
        sys.batcher_address,
        blob_basefee,
        basefee_scalar,
        blob_basefee_scalar,
    );
    match fork {
        Hardfork::Bedrock => {
            info.with_bedrock_fees(sys.overhead, U256::from_be_bytes(sys.scalar.0))
        }
        Hardfork::Ecotone => info,
        Hardfork::Isthmus => {
            info.with_operator_fees(sys.operator_fee_scalar, sys.operator_fee_constant)
        }
    }
}

/// Append batch transactions to prepared attributes.
pub fn with_batch_transactions(mut attrs: PayloadAttributes, txs: Vec<Bytes>) -> PayloadAttributes {
    attrs.transactions.get_or_insert_with(Vec::new).extend(txs);
    attrs
}
