use alloy_primitives::{keccak256, B256};

use super::VmError;

/// Size of the packed state.
pub const STATE_SIZE: usize = 226;

/// Status byte carried in the first byte of the state hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VmStatus {
    Valid = 0,
    Invalid = 1,
    Panic = 2,
    Unfinished = 3,
}

impl VmStatus {
    pub const fn new(exited: bool, exit_code: u8) -> Self {
        match (exited, exit_code) {
            (false, _) => Self::Unfinished,
            (true, 0) => Self::Valid,
            (true, 1) => Self::Invalid,
            (true, _) => Self::Panic,
        }
    }

    pub fn of_hash(hash: B256) -> Option<Self> {
        Some(match hash[0] {
            0 => Self::Valid,
            1 => Self::Invalid,
            2 => Self::Panic,
            3 => Self::Unfinished,
            _ => return None,
        })
    }
}

/// Single-threaded MIPS32 machine state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct State {
    pub memory_root: B256,
    pub preimage_key: B256,
    pub preimage_offset: u32,
    pub pc: u32,
    pub next_pc: u32,
    pub lo: u32,
    pub hi: u32,
    pub heap: u32,
    pub exit_code: u8,
    pub exited: bool,
    pub step: u64,
    pub registers: [u32; 32],
}

impl State {
    /// A fresh state starting at `entry`.
    pub fn new(entry: u32, heap: u32) -> Self {
        Self { pc: entry, next_pc: entry.wrapping_add(4), heap, ..Default::default() }
    }

    pub fn encode(&self) -> [u8; STATE_SIZE] {
        let mut out = [0u8; STATE_SIZE];
        out[..32].copy_from_slice(self.memory_root.as_slice());
        out[32..64].copy_from_slice(self.preimage_key.as_slice());
        let words = [self.preimage_offset, self.pc, self.next_pc, self.lo, self.hi, self.heap];
        for (i, word) in words.iter().enumerate() {
            out[64 + i * 4..68 + i * 4].copy_from_slice(&word.to_be_bytes());
        }
        out[88] = self.exit_code;
        out[89] = self.exited as u8;
        out[90..98].copy_from_slice(&self.step.to_be_bytes());
        for (i, reg) in self.registers.iter().enumerate() {
            out[98 + i * 4..102 + i * 4].copy_from_slice(&reg.to_be_bytes());
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, VmError> {
        if buf.len() != STATE_SIZE {
            return Err(VmError::StateSize(buf.len()));
        }
        let word = |at: usize| u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let mut registers = [0u32; 32];
        for (i, reg) in registers.iter_mut().enumerate() {
            *reg = word(98 + i * 4);
        }
        let mut step = [0u8; 8];
        step.copy_from_slice(&buf[90..98]);
        Ok(Self {
            memory_root: B256::from_slice(&buf[..32]),
            preimage_key: B256::from_slice(&buf[32..64]),
            preimage_offset: word(64),
            pc: word(68),
            next_pc: word(72),
            lo: word(76),
            hi: word(80),
            heap: word(84),
            exit_code: buf[88],
            exited: match buf[89] {
                0 => false,
                1 => true,
                other => return Err(VmError::InvalidExitedFlag(other)),
            },
            step: u64::from_be_bytes(step),
            registers,
        })
    }

    pub fn status(&self) -> VmStatus {
        VmStatus::new(self.exited, self.exit_code)
    }

    /// keccak of the encoding, with the first byte replaced by the status.
    pub fn hash(&self) -> B256 {
        state_hash(&self.encode())
    }
}

/// Hash of an encoded state. Reads the status from the encoding itself.
pub fn state_hash(encoded: &[u8; STATE_SIZE]) -> B256 {
    let mut hash = keccak256(encoded);
    hash[0] = VmStatus::new(encoded[89] != 0, encoded[88]) as u8;
    hash
}
