//! Single-threaded MIPS32 VM whose every step can be re-executed from a Merkle witness.
//!
//! The 64-bit variant in [`crate::mips64`] shares the page tree, the status byte and the
//! preimage reads defined here.

pub mod exec;
pub mod memory;
mod state;
pub mod syscall;
mod vm;

pub use memory::{Memory, MemoryAccess, MemoryProof, ProofMemory, PROOF_SIZE};
pub use state::{state_hash, State, VmStatus, STATE_SIZE};
pub use vm::{verify_step, PreimageAccess, Program, StepWitness, Vm};
pub(crate) use vm::{OracleReader, OutputSink, SourceReader};

use crate::preimage::OracleError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    #[error("invalid instruction {0:#010x}")]
    InvalidInstruction(u32),
    #[error("branch in delay slot at {0:#x}")]
    BranchInDelaySlot(u64),
    #[error("jump in delay slot at {0:#x}")]
    JumpInDelaySlot(u64),
    #[error("division by zero at {0:#x}")]
    DivisionByZero(u64),
    #[error("unaligned memory access at {0:#x}")]
    UnalignedAccess(u64),
    #[error("memory proof for {0:#x} does not verify")]
    InvalidProof(u64),
    #[error("step touches memory the witness has no proof for")]
    MissingProof,
    #[error("proof of {0} bytes is malformed")]
    ProofSize(usize),
    #[error("step touched {second:#x} after {first:#x}")]
    TooManyAccesses { first: u64, second: u64 },
    #[error("encoded state is {0} bytes")]
    StateSize(usize),
    #[error("exited flag {0} is not a bool")]
    InvalidExitedFlag(u8),
    #[error(transparent)]
    Preimage(#[from] OracleError),
}
