use alloy_primitives::{Address, Bytes, B256};
use serde::Deserialize;

use super::{
    exec,
    memory::{Memory, MemoryProof, ProofMemory, TrackedMemory, PROOF_SIZE},
    state::{state_hash, State, STATE_SIZE},
};
use crate::{
    mips::{OracleReader, OutputSink, PreimageAccess, SourceReader, VmError},
    preimage::{PreimageOracle, PreimageSource},
};

/// A loaded 64-bit program.
#[derive(Debug, Clone)]
pub struct Program {
    pub state: State,
    pub memory: Memory,
}

impl Program {
    pub fn new(entry: u64, heap: u64, segments: &[(u64, &[u8])]) -> Self {
        let mut memory = Memory::new();
        for (addr, bytes) in segments {
            memory.set_range(*addr, bytes);
        }
        Self { state: State::new(entry, heap), memory }
    }

    /// Same image format as the 32-bit program, with 64-bit addresses.
    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        let image: ProgramImage = serde_json::from_slice(data)?;
        let segments: Vec<(u64, &[u8])> =
            image.segments.iter().map(|s| (s.addr, s.data.as_ref())).collect();
        Ok(Self::new(image.entry, image.heap, &segments))
    }

    pub fn prestate_hash(&self) -> B256 {
        let mut memory = self.memory.clone();
        let state = State { memory_root: memory.merkle_root(), ..self.state.clone() };
        state.hash()
    }
}

#[derive(Debug, Deserialize)]
struct ProgramImage {
    entry: u64,
    heap: u64,
    segments: Vec<Segment>,
}

#[derive(Debug, Deserialize)]
struct Segment {
    addr: u64,
    data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepWitness {
    pub state: [u8; STATE_SIZE],
    pub insn_proof: MemoryProof,
    pub data_proof: Option<MemoryProof>,
    pub preimage: Option<PreimageAccess>,
}

impl StepWitness {
    pub fn state_hash(&self) -> B256 {
        state_hash(&self.state)
    }

    /// `insn_proof ‖ data_proof?`
    pub fn proof(&self) -> Vec<u8> {
        let mut out = self.insn_proof.to_vec();
        if let Some(data) = &self.data_proof {
            out.extend_from_slice(data);
        }
        out
    }
}

/// The full 64-bit VM.
#[derive(Debug)]
pub struct Vm<S> {
    state: State,
    memory: Memory,
    source: S,
    last_preimage: Option<(B256, Vec<u8>)>,
    output: OutputSink,
}

impl<S: PreimageSource> Vm<S> {
    pub fn new(program: Program, source: S) -> Self {
        Self {
            state: program.state,
            memory: program.memory,
            source,
            last_preimage: None,
            output: OutputSink::default(),
        }
    }

    pub const fn state(&self) -> &State {
        &self.state
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn stdout(&self) -> &[u8] {
        &self.output.stdout
    }

    pub fn encode_state(&mut self) -> [u8; STATE_SIZE] {
        self.state.memory_root = self.memory.merkle_root();
        self.state.encode()
    }

    pub fn state_hash(&mut self) -> B256 {
        state_hash(&self.encode_state())
    }

    /// Execute one instruction, with a witness when `proof` is set.
    pub fn step(&mut self, proof: bool) -> Result<Option<StepWitness>, VmError> {
        let pre = if proof {
            Some((self.encode_state(), self.memory.merkle_proof(self.state.pc)))
        } else {
            None
        };

        let mut memory = TrackedMemory::new(&mut self.memory, proof);
        let mut reader =
            SourceReader { source: &mut self.source, last: &mut self.last_preimage, accessed: None };
        let output = exec::step(&mut self.state, &mut memory, &mut reader)?;
        let accessed = reader.accessed;
        let data_proof = memory.into_data_proof();

        if let Some(output) = output {
            let bytes = self.memory.read_range(output.addr, output.len);
            self.output.write(output.fd, &bytes, &mut self.source);
        }

        Ok(pre.map(|(state, insn_proof)| StepWitness {
            state,
            insn_proof,
            data_proof,
            preimage: accessed.map(|(key, offset)| PreimageAccess {
                key,
                offset,
                value: self.last_preimage.as_ref().map(|(_, v)| v.clone()).unwrap_or_default(),
            }),
        }))
    }

    pub fn run_to(&mut self, step: u64) -> Result<(), VmError> {
        while !self.state.exited && self.state.step < step {
            self.step(false)?;
        }
        Ok(())
    }
}

/// Re-execute one 64-bit step from an encoded pre-state and `insn_proof ‖ data_proof?`.
pub fn verify_step(
    state: &[u8],
    proof: &[u8],
    oracle: &PreimageOracle,
    game: Address,
    local_context: B256,
) -> Result<B256, VmError> {
    let mut state = State::decode(state)?;
    let data = match proof.len() {
        PROOF_SIZE => None,
        len if len == 2 * PROOF_SIZE => Some(&proof[PROOF_SIZE..]),
        len => return Err(VmError::ProofSize(len)),
    };
    let mut memory = ProofMemory::new(state.memory_root, &proof[..PROOF_SIZE], data)?;
    let mut reader = OracleReader { oracle, game, local_context };
    exec::step(&mut state, &mut memory, &mut reader)?;
    state.memory_root = memory.root();
    Ok(state.hash())
}
