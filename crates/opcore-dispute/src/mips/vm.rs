use alloy_primitives::{Address, Bytes, B256};
use serde::Deserialize;
use tracing::trace;

use super::{
    exec::{self, PreimageReader},
    memory::{Memory, MemoryProof, ProofMemory, TrackedMemory, PROOF_SIZE},
    state::{state_hash, State, STATE_SIZE},
    syscall::{FD_HINT_WRITE, FD_STDERR, FD_STDOUT},
    VmError,
};
use crate::preimage::{preimage_part, PreimageKey, PreimageOracle, PreimageSource};

/// A loaded program: the state and memory before the first step.
#[derive(Debug, Clone)]
pub struct Program {
    pub state: State,
    pub memory: Memory,
}

impl Program {
    /// Place `segments` in memory and start at `entry`.
    pub fn new(entry: u32, heap: u32, segments: &[(u32, &[u8])]) -> Self {
        let mut memory = Memory::new();
        for (addr, bytes) in segments {
            memory.set_range(*addr, bytes);
        }
        Self { state: State::new(entry, heap), memory }
    }

    /// Load a program image: `{"entry", "heap", "segments": [{"addr", "data"}]}` with hex data.
    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        let image: ProgramImage = serde_json::from_slice(data)?;
        let segments: Vec<(u32, &[u8])> =
            image.segments.iter().map(|s| (s.addr, s.data.as_ref())).collect();
        Ok(Self::new(image.entry, image.heap, &segments))
    }

    /// Hash of the state before the first step.
    pub fn prestate_hash(&self) -> B256 {
        let mut memory = self.memory.clone();
        let state = State { memory_root: memory.merkle_root(), ..self.state.clone() };
        state.hash()
    }
}

#[derive(Debug, Deserialize)]
struct ProgramImage {
    entry: u32,
    heap: u32,
    segments: Vec<Segment>,
}

#[derive(Debug, Deserialize)]
struct Segment {
    addr: u32,
    data: Bytes,
}

/// Preimage bytes a step read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreimageAccess {
    pub key: B256,
    pub offset: u64,
    pub value: Vec<u8>,
}

/// Everything a verifier needs to re-execute one step.
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

    /// `pre ‖ insn_proof ‖ data_proof? ‖ key? ‖ offset? ‖ value?`
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.state.to_vec();
        out.extend_from_slice(&self.proof());
        if let Some(access) = &self.preimage {
            out.extend_from_slice(access.key.as_slice());
            out.extend_from_slice(&access.offset.to_be_bytes());
            out.extend_from_slice(&access.value);
        }
        out
    }
}

pub(crate) struct SourceReader<'a, S> {
    pub(crate) source: &'a mut S,
    pub(crate) last: &'a mut Option<(B256, Vec<u8>)>,
    pub(crate) accessed: Option<(B256, u64)>,
}

impl<S: PreimageSource> PreimageReader for SourceReader<'_, S> {
    fn read_preimage(&mut self, key: B256, offset: u64) -> Result<([u8; 32], usize), VmError> {
        if self.last.as_ref().is_none_or(|(cached, _)| *cached != key) {
            let value = self.source.get(PreimageKey::from_raw(key))?;
            *self.last = Some((key, value));
        }
        self.accessed = Some((key, offset));
        Ok(self
            .last
            .as_ref()
            .and_then(|(_, value)| preimage_part(value, offset))
            .unwrap_or(([0u8; 32], 0)))
    }
}

/// The full VM: runs a program against a preimage source and produces step witnesses.
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

    pub fn stderr(&self) -> &[u8] {
        &self.output.stderr
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
            self.output.write(output.fd.into(), &bytes, &mut self.source);
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

    /// Step until the program exits or `step` instructions have run in total.
    pub fn run_to(&mut self, step: u64) -> Result<(), VmError> {
        while !self.state.exited && self.state.step < step {
            self.step(false)?;
        }
        Ok(())
    }
}

/// What a program wrote to stdout, stderr and the hint channel.
#[derive(Debug, Default)]
pub(crate) struct OutputSink {
    hint_buf: Vec<u8>,
    pub(crate) stdout: Vec<u8>,
    pub(crate) stderr: Vec<u8>,
}

impl OutputSink {
    pub(crate) fn write<S: PreimageSource>(&mut self, fd: u64, bytes: &[u8], source: &mut S) {
        match u32::try_from(fd) {
            Ok(FD_STDOUT) => self.stdout.extend_from_slice(bytes),
            Ok(FD_STDERR) => self.stderr.extend_from_slice(bytes),
            Ok(FD_HINT_WRITE) => {
                self.hint_buf.extend_from_slice(bytes);
                self.flush_hints(source);
            }
            _ => {}
        }
    }

    /// Forward every complete `len(4, BE) ‖ payload` hint.
    fn flush_hints<S: PreimageSource>(&mut self, source: &mut S) {
        while self.hint_buf.len() >= 4 {
            let len = u32::from_be_bytes([
                self.hint_buf[0],
                self.hint_buf[1],
                self.hint_buf[2],
                self.hint_buf[3],
            ]) as usize;
            if self.hint_buf.len() < 4 + len {
                break;
            }
            let hint: Vec<u8> = self.hint_buf.drain(..4 + len).skip(4).collect();
            trace!(target: "opcore::mips", len, "hint");
            source.hint(&hint);
        }
    }
}

pub(crate) struct OracleReader<'a> {
    pub(crate) oracle: &'a PreimageOracle,
    pub(crate) game: Address,
    pub(crate) local_context: B256,
}

impl PreimageReader for OracleReader<'_> {
    fn read_preimage(&mut self, key: B256, offset: u64) -> Result<([u8; 32], usize), VmError> {
        let key = PreimageKey::from_raw(key).localize(self.game, self.local_context);
        Ok(self.oracle.read_preimage(key, offset)?)
    }
}

/// Re-execute one step from an encoded pre-state and `insn_proof ‖ data_proof?`, reading
/// preimages from `oracle` with local keys bound to `game` and `local_context`. Returns the
/// post-state hash.
pub fn verify_step(
    state: &[u8],
    proof: &[u8],
    oracle: &PreimageOracle,
    game: Address,
    local_context: B256,
) -> Result<B256, VmError> {
    let mut state = State::decode(state)?;
    if proof.len() < PROOF_SIZE {
        return Err(VmError::ProofSize(proof.len()));
    }
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
