//! Either MIPS variant behind one program, VM and step verifier.

use std::{fmt, str::FromStr};

use alloy_primitives::{Address, B256};

use crate::{
    mips::{self, PreimageAccess, VmError},
    mips64,
    preimage::{PreimageOracle, PreimageSource},
};

/// Which VM the execution trace runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum VmKind {
    #[default]
    Mips32,
    Mips64,
}

impl VmKind {
    /// Re-execute one step of this VM. Returns the post-state hash.
    pub fn verify_step(
        self,
        state: &[u8],
        proof: &[u8],
        oracle: &PreimageOracle,
        game: Address,
        local_context: B256,
    ) -> Result<B256, VmError> {
        match self {
            Self::Mips32 => mips::verify_step(state, proof, oracle, game, local_context),
            Self::Mips64 => mips64::verify_step(state, proof, oracle, game, local_context),
        }
    }
}

impl fmt::Display for VmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Mips32 => "mips32",
            Self::Mips64 => "mips64",
        })
    }
}

impl FromStr for VmKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mips32" => Ok(Self::Mips32),
            "mips64" => Ok(Self::Mips64),
            other => Err(format!("unknown vm {other}, expected mips32 or mips64")),
        }
    }
}

#[derive(Debug, Clone)]
pub enum VmProgram {
    Mips32(mips::Program),
    Mips64(mips64::Program),
}

impl From<mips::Program> for VmProgram {
    fn from(program: mips::Program) -> Self {
        Self::Mips32(program)
    }
}

impl From<mips64::Program> for VmProgram {
    fn from(program: mips64::Program) -> Self {
        Self::Mips64(program)
    }
}

impl VmProgram {
    /// Load a JSON program image for `kind`.
    pub fn from_json(kind: VmKind, data: &[u8]) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            VmKind::Mips32 => mips::Program::from_json(data)?.into(),
            VmKind::Mips64 => mips64::Program::from_json(data)?.into(),
        })
    }

    pub const fn kind(&self) -> VmKind {
        match self {
            Self::Mips32(_) => VmKind::Mips32,
            Self::Mips64(_) => VmKind::Mips64,
        }
    }

    pub fn prestate_hash(&self) -> B256 {
        match self {
            Self::Mips32(program) => program.prestate_hash(),
            Self::Mips64(program) => program.prestate_hash(),
        }
    }

    pub fn start<S: PreimageSource>(self, source: S) -> ExecVm<S> {
        match self {
            Self::Mips32(program) => ExecVm::Mips32(mips::Vm::new(program, source)),
            Self::Mips64(program) => ExecVm::Mips64(mips64::Vm::new(program, source)),
        }
    }
}

/// Witness of one step, encoded for the verifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvenStep {
    pub pre_state: Vec<u8>,
    pub proof: Vec<u8>,
    pub preimage: Option<PreimageAccess>,
}

/// A running program on either VM.
#[derive(Debug)]
pub enum ExecVm<S> {
    Mips32(mips::Vm<S>),
    Mips64(mips64::Vm<S>),
}

impl<S: PreimageSource> ExecVm<S> {
    pub fn run_to(&mut self, step: u64) -> Result<(), VmError> {
        match self {
            Self::Mips32(vm) => vm.run_to(step),
            Self::Mips64(vm) => vm.run_to(step),
        }
    }

    pub fn state_hash(&mut self) -> B256 {
        match self {
            Self::Mips32(vm) => vm.state_hash(),
            Self::Mips64(vm) => vm.state_hash(),
        }
    }

    pub fn source(&self) -> &S {
        match self {
            Self::Mips32(vm) => vm.source(),
            Self::Mips64(vm) => vm.source(),
        }
    }

    /// Execute the next instruction and return its witness.
    pub fn prove_step(&mut self) -> Result<ProvenStep, VmError> {
        match self {
            Self::Mips32(vm) => {
                let witness = vm.step(true)?.ok_or(VmError::MissingProof)?;
                let proof = witness.proof();
                Ok(ProvenStep { pre_state: witness.state.to_vec(), proof, preimage: witness.preimage })
            }
            Self::Mips64(vm) => {
                let witness = vm.step(true)?.ok_or(VmError::MissingProof)?;
                let proof = witness.proof();
                Ok(ProvenStep { pre_state: witness.state.to_vec(), proof, preimage: witness.preimage })
            }
        }
    }
}
