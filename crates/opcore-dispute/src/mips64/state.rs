use alloy_primitives::{keccak256, B256};

use crate::mips::{VmError, VmStatus};

/// Size of the packed state.
pub const STATE_SIZE: usize = 378;

const EXIT_CODE_AT: usize = 112;
const EXITED_AT: usize = 113;
const STEP_AT: usize = 114;
const REGISTERS_AT: usize = 122;

/// Single-threaded MIPS64 machine state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct State {
    pub memory_root: B256,
    pub preimage_key: B256,
    pub preimage_offset: u64,
    pub pc: u64,
    pub next_pc: u64,
    pub lo: u64,
    pub hi: u64,
    pub heap: u64,
    pub exit_code: u8,
    pub exited: bool,
    pub step: u64,
    pub registers: [u64; 32],
}

impl State {
    pub fn new(entry: u64, heap: u64) -> Self {
        Self { pc: entry, next_pc: entry.wrapping_add(4), heap, ..Default::default() }
    }

    /// `root ‖ key ‖ offset ‖ pc ‖ next_pc ‖ lo ‖ hi ‖ heap ‖ exit_code ‖ exited ‖ step ‖ regs`,
    /// every number 8 bytes big-endian.
    pub fn encode(&self) -> [u8; STATE_SIZE] {
        let mut out = [0u8; STATE_SIZE];
        out[..32].copy_from_slice(self.memory_root.as_slice());
        out[32..64].copy_from_slice(self.preimage_key.as_slice());
        let words = [self.preimage_offset, self.pc, self.next_pc, self.lo, self.hi, self.heap];
        for (i, word) in words.iter().enumerate() {
            out[64 + i * 8..72 + i * 8].copy_from_slice(&word.to_be_bytes());
        }
        out[EXIT_CODE_AT] = self.exit_code;
        out[EXITED_AT] = self.exited as u8;
        out[STEP_AT..REGISTERS_AT].copy_from_slice(&self.step.to_be_bytes());
        for (i, reg) in self.registers.iter().enumerate() {
            let at = REGISTERS_AT + i * 8;
            out[at..at + 8].copy_from_slice(&reg.to_be_bytes());
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, VmError> {
        if buf.len() != STATE_SIZE {
            return Err(VmError::StateSize(buf.len()));
        }
        let word = |at: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[at..at + 8]);
            u64::from_be_bytes(bytes)
        };
        let mut registers = [0u64; 32];
        for (i, reg) in registers.iter_mut().enumerate() {
            *reg = word(REGISTERS_AT + i * 8);
        }
        Ok(Self {
            memory_root: B256::from_slice(&buf[..32]),
            preimage_key: B256::from_slice(&buf[32..64]),
            preimage_offset: word(64),
            pc: word(72),
            next_pc: word(80),
            lo: word(88),
            hi: word(96),
            heap: word(104),
            exit_code: buf[EXIT_CODE_AT],
            exited: match buf[EXITED_AT] {
                0 => false,
                1 => true,
                other => return Err(VmError::InvalidExitedFlag(other)),
            },
            step: word(STEP_AT),
            registers,
        })
    }

    pub fn status(&self) -> VmStatus {
        VmStatus::new(self.exited, self.exit_code)
    }

    pub fn hash(&self) -> B256 {
        state_hash(&self.encode())
    }
}

/// keccak of an encoded state with the first byte replaced by its status.
pub fn state_hash(encoded: &[u8; STATE_SIZE]) -> B256 {
    let mut hash = keccak256(encoded);
    hash[0] = VmStatus::new(encoded[EXITED_AT] != 0, encoded[EXIT_CODE_AT]) as u8;
    hash
}

const _: () = assert!(REGISTERS_AT + 32 * 8 == STATE_SIZE);
