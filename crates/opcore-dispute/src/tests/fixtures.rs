//! A tiny MIPS assembler, the program every execution trace test runs, and a chain of outputs
//! that program can check.

use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicUsize, Ordering},
};

use alloy_primitives::{keccak256, Address, B256, U256};
use async_trait::async_trait;
use opcore_stream::L1SourceError;
use opcore_types::{L2BlockRef, OutputResponse};

use crate::{
    mips::Program,
    preimage::{local, PreimageKey, PreimageStore},
    trace::OutputSource,
    GameConfig,
};

pub(crate) const ZERO: u32 = 0;
pub(crate) const V0: u32 = 2;
pub(crate) const A0: u32 = 4;
pub(crate) const A1: u32 = 5;
pub(crate) const A2: u32 = 6;
pub(crate) const T0: u32 = 8;
pub(crate) const T1: u32 = 9;
pub(crate) const T2: u32 = 10;
pub(crate) const T3: u32 = 11;
pub(crate) const T4: u32 = 12;
pub(crate) const T5: u32 = 13;
pub(crate) const T6: u32 = 14;
pub(crate) const S0: u32 = 16;
pub(crate) const S1: u32 = 17;
pub(crate) const RA: u32 = 31;

pub(crate) const CODE_BASE: u32 = 0x1000;
pub(crate) const HEAP_START: u32 = 0x1000_0000;

const KEY_STARTING: u32 = 0x2000;
const KEY_DISPUTED: u32 = 0x2040;
const KEY_SUCCESSOR: u32 = 0x2080;
const BUF_STARTING: u32 = 0x2100;
const BUF_SUCCESSOR: u32 = 0x2200;
const BUF_DISPUTED: u32 = 0x2300;
const SCRATCH: u32 = 0x2400;

pub(crate) const fn r_type(rs: u32, rt: u32, rd: u32, shamt: u32, funct: u32) -> u32 {
    (rs << 21) | (rt << 16) | (rd << 11) | (shamt << 6) | funct
}

pub(crate) const fn i_type(op: u32, rs: u32, rt: u32, imm: u16) -> u32 {
    (op << 26) | (rs << 21) | (rt << 16) | imm as u32
}

enum Fixup {
    Branch,
    Jump,
}

/// Straight-line assembler with labels for branches and jumps.
pub(crate) struct Asm {
    base: u32,
    code: Vec<u32>,
    labels: HashMap<&'static str, u32>,
    fixups: Vec<(usize, &'static str, Fixup)>,
}

impl Asm {
    pub(crate) fn new(base: u32) -> Self {
        Self { base, code: Vec::new(), labels: HashMap::new(), fixups: Vec::new() }
    }

    fn here(&self) -> u32 {
        self.base + 4 * self.code.len() as u32
    }

    pub(crate) fn label(&mut self, name: &'static str) -> &mut Self {
        self.labels.insert(name, self.here());
        self
    }

    pub(crate) fn emit(&mut self, insn: u32) -> &mut Self {
        self.code.push(insn);
        self
    }

    pub(crate) fn nop(&mut self) -> &mut Self {
        self.emit(0)
    }

    pub(crate) fn addiu(&mut self, rt: u32, rs: u32, imm: i16) -> &mut Self {
        self.emit(i_type(0x09, rs, rt, imm as u16))
    }

    pub(crate) fn addu(&mut self, rd: u32, rs: u32, rt: u32) -> &mut Self {
        self.emit(r_type(rs, rt, rd, 0, 0x21))
    }

    pub(crate) fn lw(&mut self, rt: u32, offset: i16, base: u32) -> &mut Self {
        self.emit(i_type(0x23, base, rt, offset as u16))
    }

    pub(crate) fn sw(&mut self, rt: u32, offset: i16, base: u32) -> &mut Self {
        self.emit(i_type(0x2B, base, rt, offset as u16))
    }

    pub(crate) fn sb(&mut self, rt: u32, offset: i16, base: u32) -> &mut Self {
        self.emit(i_type(0x28, base, rt, offset as u16))
    }

    pub(crate) fn beq(&mut self, rs: u32, rt: u32, target: &'static str) -> &mut Self {
        self.fixups.push((self.code.len(), target, Fixup::Branch));
        self.emit(i_type(0x04, rs, rt, 0))
    }

    pub(crate) fn bne(&mut self, rs: u32, rt: u32, target: &'static str) -> &mut Self {
        self.fixups.push((self.code.len(), target, Fixup::Branch));
        self.emit(i_type(0x05, rs, rt, 0))
    }

    pub(crate) fn jal(&mut self, target: &'static str) -> &mut Self {
        self.fixups.push((self.code.len(), target, Fixup::Jump));
        self.emit(0x03 << 26)
    }

    pub(crate) fn jr(&mut self, rs: u32) -> &mut Self {
        self.emit(r_type(rs, 0, 0, 0, 0x08))
    }

    pub(crate) fn syscall(&mut self) -> &mut Self {
        self.emit(r_type(0, 0, 0, 0, 0x0C))
    }

    /// `$v0 = num; $a0..$a2 = args; syscall`
    pub(crate) fn sys(&mut self, num: i16, a0: i16, a1_reg: u32, a2: i16) -> &mut Self {
        self.addiu(V0, ZERO, num).addiu(A0, ZERO, a0).addu(A1, a1_reg, ZERO).addiu(A2, ZERO, a2).syscall()
    }

    pub(crate) fn assemble(&self) -> Vec<u8> {
        let mut code = self.code.clone();
        for (at, target, kind) in &self.fixups {
            let dest = self.labels[target];
            let pc = self.base + 4 * *at as u32;
            code[*at] |= match kind {
                Fixup::Branch => ((dest.wrapping_sub(pc + 4) as i32 >> 2) as u32) & 0xFFFF,
                Fixup::Jump => (dest >> 2) & 0x03FF_FFFF,
            };
        }
        code.iter().flat_map(|insn| insn.to_be_bytes()).collect()
    }
}

/// A program of `code` at [`CODE_BASE`].
pub(crate) fn program_of(asm: &Asm) -> Program {
    Program::new(CODE_BASE, HEAP_START, &[(CODE_BASE, &asm.assemble())])
}

/// Reads the starting and disputed outputs from the local inputs, asks for the keccak preimage
/// of the starting output and exits 0 if it equals the disputed output, 1 otherwise.
pub(crate) fn successor_program() -> Program {
    let mut asm = Asm::new(CODE_BASE);
    asm.addiu(S0, ZERO, KEY_STARTING as i16)
        .addiu(S1, ZERO, BUF_STARTING as i16)
        .jal("read")
        .nop()
        .addiu(S0, ZERO, KEY_DISPUTED as i16)
        .addiu(S1, ZERO, BUF_DISPUTED as i16)
        .jal("read")
        .nop();

    // successor key: the starting output with the keccak type byte
    asm.addiu(T2, ZERO, BUF_STARTING as i16)
        .addiu(T3, ZERO, KEY_SUCCESSOR as i16)
        .addiu(T4, ZERO, (BUF_STARTING + 32) as i16)
        .label("copy")
        .lw(T5, 0, T2)
        .sw(T5, 0, T3)
        .addiu(T2, T2, 4)
        .addiu(T3, T3, 4)
        .bne(T2, T4, "copy")
        .nop()
        .addiu(T5, ZERO, 2)
        .sb(T5, KEY_SUCCESSOR as i16, ZERO)
        .addiu(S0, ZERO, KEY_SUCCESSOR as i16)
        .addiu(S1, ZERO, BUF_SUCCESSOR as i16)
        .jal("read")
        .nop();

    asm.addiu(T2, ZERO, BUF_SUCCESSOR as i16)
        .addiu(T3, ZERO, BUF_DISPUTED as i16)
        .addiu(T4, ZERO, (BUF_SUCCESSOR + 32) as i16)
        .label("compare")
        .lw(T5, 0, T2)
        .lw(T6, 0, T3)
        .bne(T5, T6, "mismatch")
        .nop()
        .addiu(T2, T2, 4)
        .addiu(T3, T3, 4)
        .bne(T2, T4, "compare")
        .nop()
        .addiu(A0, ZERO, 0)
        .beq(ZERO, ZERO, "exit")
        .nop()
        .label("mismatch")
        .addiu(A0, ZERO, 1)
        .label("exit")
        .addiu(V0, ZERO, 4246)
        .syscall();

    // read(key at $s0) -> 32 bytes at $s1
    asm.label("read")
        .addu(T0, S0, ZERO)
        .addiu(T1, S0, 32)
        .label("write_key")
        .sys(4004, 6, T0, 4)
        .addiu(T0, T0, 4)
        .bne(T0, T1, "write_key")
        .nop()
        .addiu(T0, ZERO, SCRATCH as i16)
        .addiu(T1, ZERO, (SCRATCH + 8) as i16)
        .label("read_len")
        .sys(4003, 5, T0, 4)
        .addiu(T0, T0, 4)
        .bne(T0, T1, "read_len")
        .nop()
        .addu(T0, S1, ZERO)
        .addiu(T1, S1, 32)
        .label("read_data")
        .sys(4003, 5, T0, 4)
        .addiu(T0, T0, 4)
        .bne(T0, T1, "read_data")
        .nop()
        .jr(RA)
        .nop();

    let starting = PreimageKey::local(local::STARTING_OUTPUT_ROOT).as_b256();
    let disputed = PreimageKey::local(local::DISPUTED_OUTPUT_ROOT).as_b256();
    Program::new(
        CODE_BASE,
        HEAP_START,
        &[
            (CODE_BASE, &asm.assemble()),
            (KEY_STARTING, starting.as_slice()),
            (KEY_DISPUTED, disputed.as_slice()),
        ],
    )
}

/// Output roots where each root is the keccak of the next block's, so the successor program
/// accepts exactly the honest pairs.
pub(crate) struct OutputChain {
    pub(crate) roots: BTreeMap<u64, B256>,
}

impl OutputChain {
    pub(crate) fn new(first: u64, last: u64) -> Self {
        let mut roots = BTreeMap::new();
        let mut root = keccak256(b"tip");
        roots.insert(last, root);
        for block in (first..last).rev() {
            root = keccak256(root);
            roots.insert(block, root);
        }
        Self { roots }
    }

    pub(crate) fn root(&self, block: u64) -> B256 {
        self.roots[&block]
    }

    /// Preimages of every root after the first, keyed by their keccak (the previous root).
    pub(crate) fn store(&self) -> PreimageStore {
        let mut store = PreimageStore::new();
        for root in self.roots.values().skip(1) {
            store.insert_keccak256(root.as_slice());
        }
        store
    }
}

/// Serves output roots from a map, counting requests.
#[derive(Default)]
pub(crate) struct MockRollup {
    pub(crate) roots: BTreeMap<u64, B256>,
    pub(crate) calls: AtomicUsize,
}

impl MockRollup {
    pub(crate) fn new(roots: BTreeMap<u64, B256>) -> Self {
        Self { roots, calls: AtomicUsize::new(0) }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl OutputSource for MockRollup {
    async fn output_at_block(&self, number: u64) -> Result<OutputResponse, L1SourceError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let root = self
            .roots
            .get(&number)
            .ok_or_else(|| L1SourceError::NotFound(format!("output {number}")))?;
        Ok(OutputResponse {
            version: B256::ZERO,
            output_root: *root,
            block_ref: L2BlockRef { number, ..Default::default() },
            withdrawal_storage_root: B256::ZERO,
            state_root: B256::ZERO,
        })
    }
}

pub(crate) fn addr(n: u8) -> Address {
    Address::repeat_byte(n)
}

pub(crate) fn hash(n: u8) -> B256 {
    B256::repeat_byte(n)
}

/// A hash with the given VM status byte.
pub(crate) fn with_status(value: B256, status: u8) -> B256 {
    let mut value = value;
    value[0] = status;
    value
}

/// `split_depth` output levels above an 11-level execution game.
pub(crate) fn small_config(split_depth: u8) -> GameConfig {
    GameConfig::builder()
        .max_game_depth(split_depth + 12)
        .split_depth(split_depth)
        .max_clock_duration(1_000)
        .base_bond(U256::from(1))
        .absolute_prestate(successor_program().prestate_hash())
        .build()
}
