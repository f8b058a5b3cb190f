//! L1 system config tracking.
//!
//! The SystemConfig contract on L1 emits `ConfigUpdate` logs whenever the chain operator changes
//! a parameter. Derivation replays those logs in L1 order so every L2 block sees the values that
//! were in force at its L1 origin.

use alloy_consensus::Receipt;
use alloy_primitives::{Address, Log, B256, B64, U256};
use alloy_sol_types::{sol, SolEvent};
use tracing::debug;

use crate::config::GenesisSystemConfig;

sol! {
    /// Emitted by the L1 SystemConfig contract.
    #[derive(Debug)]
    event ConfigUpdate(uint256 indexed version, uint8 indexed updateType, bytes data);
}

/// Keccak256 of `ConfigUpdate(uint256,uint8,bytes)`.
pub const CONFIG_UPDATE_TOPIC: B256 = B256::new(ConfigUpdate::SIGNATURE_HASH.0);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SystemConfigError {
    #[error("failed to decode ConfigUpdate log: {0}")]
    Decode(String),
    #[error("unsupported ConfigUpdate version {0}")]
    UnsupportedVersion(U256),
    #[error("invalid payload length for update type {kind}: {len}")]
    InvalidLength { kind: u8, len: usize },
    #[error("unsupported gas config scalar version {0}")]
    UnsupportedScalarVersion(u8),
}

/// Update kinds carried in the `updateType` topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConfigUpdateKind {
    Batcher = 0,
    FeeScalars = 1,
    GasLimit = 2,
    UnsafeBlockSigner = 3,
    Eip1559Params = 4,
    OperatorFee = 5,
}

impl TryFrom<u8> for ConfigUpdateKind {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        Ok(match v {
            0 => Self::Batcher,
            1 => Self::FeeScalars,
            2 => Self::GasLimit,
            3 => Self::UnsafeBlockSigner,
            4 => Self::Eip1559Params,
            5 => Self::OperatorFee,
            other => return Err(other),
        })
    }
}

/// Chain parameters sourced from the L1 SystemConfig contract.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemConfig {
    pub batcher_address: Address,
    /// Bedrock fee overhead. Unused once Ecotone scalars are in effect.
    pub overhead: U256,
    /// Raw scalar word: Bedrock scalar, or versioned Ecotone scalars when byte 0 is 1.
    pub scalar: B256,
    pub gas_limit: u64,
    pub eip1559_denominator: u32,
    pub eip1559_elasticity: u32,
    pub operator_fee_scalar: u32,
    pub operator_fee_constant: u64,
    /// Operator fee change seen in the current epoch, applied at the next epoch boundary.
    pending_operator_fee: Option<(u32, u64)>,
}

impl From<&GenesisSystemConfig> for SystemConfig {
    fn from(g: &GenesisSystemConfig) -> Self {
        Self {
            batcher_address: g.batcher_addr,
            overhead: U256::from_be_bytes(g.overhead.0),
            scalar: g.scalar,
            gas_limit: g.gas_limit,
            ..Default::default()
        }
    }
}

impl SystemConfig {
    /// `(base_fee_scalar, blob_base_fee_scalar)` as the Ecotone L1 info tx expects them.
    ///
    /// A version 0 scalar is the Bedrock scalar carried over with no blob component.
    pub fn ecotone_scalars(&self) -> (u32, u32) {
        let s = self.scalar.as_slice();
        if s[0] == 1 {
            (be_u32(&s[28..32]), be_u32(&s[24..28]))
        } else {
            (u32::try_from(U256::from_be_bytes(self.scalar.0)).unwrap_or(u32::MAX), 0)
        }
    }

    /// Holocene EIP-1559 params, `denominator(4) ‖ elasticity(4)`.
    pub fn eip1559_params(&self) -> B64 {
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&self.eip1559_denominator.to_be_bytes());
        out[4..].copy_from_slice(&self.eip1559_elasticity.to_be_bytes());
        B64::from(out)
    }

    pub fn pending_operator_fee(&self) -> Option<(u32, u64)> {
        self.pending_operator_fee
    }

    /// Apply the operator fee queued during the previous epoch.
    ///
    /// Called when derivation moves to a new L1 origin, before that origin's own logs are
    /// replayed.
    pub fn start_epoch(&mut self) {
        if let Some((scalar, constant)) = self.pending_operator_fee.take() {
            self.operator_fee_scalar = scalar;
            self.operator_fee_constant = constant;
        }
    }

    /// Replay the `ConfigUpdate` logs of one L1 block.
    ///
    /// Failed receipts are skipped. A malformed log is an error: the contract only ever emits
    /// well-formed updates, so a decoding failure means the input is not what it claims to be.
    pub fn update_from_receipts(
        &mut self,
        receipts: &[Receipt],
        system_config_address: Address,
    ) -> Result<(), SystemConfigError> {
        for receipt in receipts.iter().filter(|r| r.status.coerce_status()) {
            for log in &receipt.logs {
                if log.address != system_config_address
                    || log.topics().first() != Some(&CONFIG_UPDATE_TOPIC)
                {
                    continue;
                }
                self.apply_log(log)?;
            }
        }
        Ok(())
    }

    /// Apply a single `ConfigUpdate` log.
    pub fn apply_log(&mut self, log: &Log) -> Result<(), SystemConfigError> {
        let event = ConfigUpdate::decode_raw_log(log.topics().iter().copied(), &log.data.data)
            .map_err(|e| SystemConfigError::Decode(e.to_string()))?;
        if event.version != U256::ZERO {
            return Err(SystemConfigError::UnsupportedVersion(event.version));
        }
        let data: &[u8] = event.data.as_ref();

        let Ok(kind) = ConfigUpdateKind::try_from(event.updateType) else {
            debug!(target: "opcore::derive", kind = event.updateType, "ignoring unknown config update");
            return Ok(());
        };
        let expect = |len: usize| {
            if data.len() == len {
                Ok(())
            } else {
                Err(SystemConfigError::InvalidLength { kind: kind as u8, len: data.len() })
            }
        };

        match kind {
            ConfigUpdateKind::Batcher => {
                expect(32)?;
                self.batcher_address = Address::from_slice(&data[12..32]);
            }
            ConfigUpdateKind::FeeScalars => {
                expect(64)?;
                let scalar = B256::from_slice(&data[32..64]);
                if scalar[0] > 1 {
                    return Err(SystemConfigError::UnsupportedScalarVersion(scalar[0]));
                }
                self.overhead = U256::from_be_slice(&data[..32]);
                self.scalar = scalar;
            }
            ConfigUpdateKind::GasLimit => {
                expect(32)?;
                self.gas_limit = be_u64(&data[24..32]);
            }
            ConfigUpdateKind::UnsafeBlockSigner => {}
            ConfigUpdateKind::Eip1559Params => {
                expect(32)?;
                self.eip1559_denominator = be_u32(&data[24..28]);
                self.eip1559_elasticity = be_u32(&data[28..32]);
            }
            ConfigUpdateKind::OperatorFee => {
                expect(32)?;
                self.pending_operator_fee =
                    Some((be_u32(&data[20..24]), be_u64(&data[24..32])));
            }
        }
        debug!(target: "opcore::derive", ?kind, "applied system config update");
        Ok(())
    }
}

fn be_u32(b: &[u8]) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(b);
    u32::from_be_bytes(out)
}

fn be_u64(b: &[u8]) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(b);
    u64::from_be_bytes(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_consensus::Eip658Value;
    use alloy_primitives::{address, Bytes, LogData};
    use alloy_sol_types::SolValue;

    const SYS: Address = address!("229047fed2591dbec1eF1118d64F7aF3dB9EB290");

    fn update_log(kind: u8, payload: Vec<u8>) -> Log {
        let topics = vec![
            CONFIG_UPDATE_TOPIC,
            B256::ZERO,
            B256::from(U256::from(kind)),
        ];
        let data = Bytes::from(payload).abi_encode();
        Log { address: SYS, data: LogData::new_unchecked(topics, data.into()) }
    }

    fn receipt(logs: Vec<Log>, ok: bool) -> Receipt {
        Receipt { status: Eip658Value::Eip658(ok), cumulative_gas_used: 0, logs }
    }

    #[test]
    fn batcher_and_gas_limit_updates() {
        let mut cfg = SystemConfig::default();
        let batcher = address!("1111111111111111111111111111111111111111");
        let logs = vec![
            update_log(0, B256::left_padding_from(batcher.as_slice()).to_vec()),
            update_log(2, U256::from(30_000_000u64).to_be_bytes::<32>().to_vec()),
        ];
        cfg.update_from_receipts(&[receipt(logs, true)], SYS).unwrap();
        assert_eq!(cfg.batcher_address, batcher);
        assert_eq!(cfg.gas_limit, 30_000_000);
    }

    #[test]
    fn failed_receipts_are_skipped() {
        let mut cfg = SystemConfig::default();
        let logs = vec![update_log(2, U256::from(1u64).to_be_bytes::<32>().to_vec())];
        cfg.update_from_receipts(&[receipt(logs, false)], SYS).unwrap();
        assert_eq!(cfg.gas_limit, 0);
    }

    #[test]
    fn ecotone_scalar_versions() {
        let mut cfg = SystemConfig::default();
        let mut scalar = [0u8; 32];
        scalar[0] = 1;
        scalar[24..28].copy_from_slice(&500u32.to_be_bytes());
        scalar[28..32].copy_from_slice(&1000u32.to_be_bytes());
        let mut payload = vec![0u8; 32];
        payload.extend_from_slice(&scalar);
        cfg.apply_log(&update_log(1, payload)).unwrap();
        assert_eq!(cfg.ecotone_scalars(), (1000, 500));

        cfg.scalar = B256::from(U256::from(684_000u64));
        assert_eq!(cfg.ecotone_scalars(), (684_000, 0));
    }

    #[test]
    fn operator_fee_waits_for_next_epoch() {
        let mut cfg = SystemConfig::default();
        let mut word = [0u8; 32];
        word[20..24].copy_from_slice(&7u32.to_be_bytes());
        word[24..32].copy_from_slice(&9u64.to_be_bytes());
        cfg.apply_log(&update_log(5, word.to_vec())).unwrap();

        assert_eq!(cfg.operator_fee_scalar, 0);
        assert_eq!(cfg.pending_operator_fee(), Some((7, 9)));

        cfg.start_epoch();
        assert_eq!((cfg.operator_fee_scalar, cfg.operator_fee_constant), (7, 9));
        assert_eq!(cfg.pending_operator_fee(), None);
    }

    #[test]
    fn eip1559_params_packing() {
        let mut cfg = SystemConfig::default();
        let mut word = [0u8; 32];
        word[24..28].copy_from_slice(&250u32.to_be_bytes());
        word[28..32].copy_from_slice(&6u32.to_be_bytes());
        cfg.apply_log(&update_log(4, word.to_vec())).unwrap();
        assert_eq!(cfg.eip1559_params(), B64::from([0, 0, 0, 250, 0, 0, 0, 6]));
    }

    #[test]
    fn wrong_length_is_rejected() {
        let mut cfg = SystemConfig::default();
        let err = cfg.apply_log(&update_log(2, vec![0u8; 31])).unwrap_err();
        assert_eq!(err, SystemConfigError::InvalidLength { kind: 2, len: 31 });
    }
}
