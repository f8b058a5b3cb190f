//! Single-threaded MIPS64 VM: 64-bit registers and addresses, doubleword memory and the n64
//! syscall numbers. Proofs and the status byte work as on [`crate::mips`].

pub mod exec;
pub mod memory;
mod state;
pub mod syscall;
mod vm;

pub use memory::{Memory, MemoryAccess, MemoryProof, ProofMemory, PROOF_SIZE};
pub use state::{state_hash, State, STATE_SIZE};
pub use vm::{verify_step, Program, StepWitness, Vm};
