//! Rollup configuration and protocol constants.
//!
//! Loaded from a `rollup.json`-style document. Fork gating is a pure function of the timestamp:
//! a fork is active at `t` iff its activation time is set and `t >= activation`.

use alloy_primitives::{address, Address, B256};
use opcore_types::BlockId;
use serde::{Deserialize, Serialize};

use crate::l1_info::Hardfork;

/// Maximum frame payload size.
pub const MAX_FRAME_LEN: usize = 1_000_000;

/// Bytes of frame framing: 16 id + 2 number + 4 length + 1 last.
pub const FRAME_OVERHEAD: usize = 23;

/// Channel bank capacity before Fjord.
pub const MAX_CHANNEL_BANK_SIZE: usize = 100_000_000;

/// Channel bank capacity from Fjord.
pub const FJORD_MAX_CHANNEL_BANK_SIZE: usize = 1_000_000_000;

/// Maximum decompressed size of a channel before Fjord.
pub const MAX_RLP_BYTES_PER_CHANNEL: u64 = 10_000_000;

/// Maximum decompressed size of a channel from Fjord.
pub const FJORD_MAX_RLP_BYTES_PER_CHANNEL: u64 = 100_000_000;

/// Sequencer drift from Fjord (constant, replaces the configured value).
pub const FJORD_MAX_SEQUENCER_DRIFT: u64 = 1800;

/// Channel timeout from Granite, in L1 blocks.
pub const GRANITE_CHANNEL_TIMEOUT: u64 = 50;

/// Upper bound on the number of blocks a span batch may describe.
pub const MAX_SPAN_BATCH_ELEMENTS: u64 = 10_000_000;

/// L2 sequencer fee vault, the fee recipient of derived blocks.
pub const SEQUENCER_FEE_VAULT: Address = address!("4200000000000000000000000000000000000011");

/// Genesis anchors of the rollup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainGenesis {
    pub l1: BlockId,
    pub l2: BlockId,
    pub l2_time: u64,
    #[serde(default)]
    pub system_config: Option<GenesisSystemConfig>,
}

/// System config values at genesis.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenesisSystemConfig {
    pub batcher_addr: Address,
    pub overhead: B256,
    pub scalar: B256,
    pub gas_limit: u64,
}

/// The rollup configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RollupConfig {
    pub genesis: ChainGenesis,
    pub block_time: u64,
    pub max_sequencer_drift: u64,
    pub seq_window_size: u64,
    pub channel_timeout: u64,
    #[serde(default)]
    pub granite_channel_timeout: Option<u64>,
    pub l1_chain_id: u64,
    pub l2_chain_id: u64,
    #[serde(default)]
    pub regolith_time: Option<u64>,
    #[serde(default)]
    pub canyon_time: Option<u64>,
    #[serde(default)]
    pub delta_time: Option<u64>,
    #[serde(default)]
    pub ecotone_time: Option<u64>,
    #[serde(default)]
    pub fjord_time: Option<u64>,
    #[serde(default)]
    pub granite_time: Option<u64>,
    #[serde(default)]
    pub holocene_time: Option<u64>,
    #[serde(default)]
    pub isthmus_time: Option<u64>,
    pub batch_inbox_address: Address,
    pub deposit_contract_address: Address,
    pub l1_system_config_address: Address,
}

#[inline]
const fn active(fork: Option<u64>, timestamp: u64) -> bool {
    match fork {
        Some(t) => timestamp >= t,
        None => false,
    }
}

impl RollupConfig {
    #[inline]
    pub const fn is_regolith_active(&self, timestamp: u64) -> bool {
        active(self.regolith_time, timestamp) || self.is_canyon_active(timestamp)
    }

    #[inline]
    pub const fn is_canyon_active(&self, timestamp: u64) -> bool {
        active(self.canyon_time, timestamp) || self.is_delta_active(timestamp)
    }

    #[inline]
    pub const fn is_delta_active(&self, timestamp: u64) -> bool {
        active(self.delta_time, timestamp) || self.is_ecotone_active(timestamp)
    }

    #[inline]
    pub const fn is_ecotone_active(&self, timestamp: u64) -> bool {
        active(self.ecotone_time, timestamp) || self.is_fjord_active(timestamp)
    }

    #[inline]
    pub const fn is_fjord_active(&self, timestamp: u64) -> bool {
        active(self.fjord_time, timestamp) || self.is_granite_active(timestamp)
    }

    #[inline]
    pub const fn is_granite_active(&self, timestamp: u64) -> bool {
        active(self.granite_time, timestamp) || self.is_holocene_active(timestamp)
    }

    #[inline]
    pub const fn is_holocene_active(&self, timestamp: u64) -> bool {
        active(self.holocene_time, timestamp) || self.is_isthmus_active(timestamp)
    }

    #[inline]
    pub const fn is_isthmus_active(&self, timestamp: u64) -> bool {
        active(self.isthmus_time, timestamp)
    }

    /// Returns true if `timestamp` is the first L2 block with Ecotone active.
    pub fn is_ecotone_activation_block(&self, timestamp: u64) -> bool {
        self.is_ecotone_active(timestamp) &&
            timestamp >= self.block_time &&
            !self.is_ecotone_active(timestamp - self.block_time)
    }

    /// Returns true if `timestamp` is the first L2 block with Isthmus active.
    pub fn is_isthmus_activation_block(&self, timestamp: u64) -> bool {
        self.is_isthmus_active(timestamp) &&
            timestamp >= self.block_time &&
            !self.is_isthmus_active(timestamp - self.block_time)
    }

    /// L1-info calldata format of an L2 block at `timestamp`.
    ///
    /// The activation block of a fork still uses the previous format: the L1Block predeploy is
    /// upgraded by that block's upgrade transactions.
    pub fn l1_info_format(&self, timestamp: u64) -> Hardfork {
        if self.is_isthmus_active(timestamp) && !self.is_isthmus_activation_block(timestamp) {
            Hardfork::Isthmus
        } else if self.is_ecotone_active(timestamp) && !self.is_ecotone_activation_block(timestamp)
        {
            Hardfork::Ecotone
        } else {
            Hardfork::Bedrock
        }
    }

    /// Sequencer drift allowed for an L1 origin at `timestamp`.
    #[inline]
    pub fn max_sequencer_drift(&self, timestamp: u64) -> u64 {
        if self.is_fjord_active(timestamp) {
            FJORD_MAX_SEQUENCER_DRIFT
        } else {
            self.max_sequencer_drift
        }
    }

    /// Channel timeout (in L1 blocks) for an L1 block at `timestamp`.
    #[inline]
    pub fn channel_timeout(&self, timestamp: u64) -> u64 {
        if self.is_granite_active(timestamp) {
            self.granite_channel_timeout.unwrap_or(GRANITE_CHANNEL_TIMEOUT)
        } else {
            self.channel_timeout
        }
    }

    #[inline]
    pub fn max_channel_bank_size(&self, timestamp: u64) -> usize {
        if self.is_fjord_active(timestamp) {
            FJORD_MAX_CHANNEL_BANK_SIZE
        } else {
            MAX_CHANNEL_BANK_SIZE
        }
    }

    #[inline]
    pub fn max_rlp_bytes_per_channel(&self, timestamp: u64) -> u64 {
        if self.is_fjord_active(timestamp) {
            FJORD_MAX_RLP_BYTES_PER_CHANNEL
        } else {
            MAX_RLP_BYTES_PER_CHANNEL
        }
    }

    /// L2 block number at `timestamp`, counted from genesis.
    #[inline]
    pub fn block_number_at(&self, timestamp: u64) -> Option<u64> {
        let since = timestamp.checked_sub(self.genesis.l2_time)?;
        Some(self.genesis.l2.number + since / self.block_time.max(1))
    }

    /// Parse a config from `rollup.json` contents.
    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}
