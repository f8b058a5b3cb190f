//! Sparse 64-bit memory. Same pages and leaves as the 32-bit tree, with a deeper path above
//! the pages.

use std::{collections::BTreeMap, fmt};

use alloy_primitives::B256;

use crate::mips::{
    memory::{hash_pair, zero_hashes, Page, LEAF_SIZE, PAGE_ADDR_SIZE, PAGE_SIZE, PAGE_TREE_DEPTH},
    VmError,
};

pub const PAGE_ADDR_MASK: u64 = PAGE_SIZE as u64 - 1;
/// Levels between a leaf and the root: one per address bit above the leaf offset.
pub const MEMORY_TREE_DEPTH: usize = 64 - 5;
/// A leaf followed by its siblings bottom-up.
pub const PROOF_SIZE: usize = (MEMORY_TREE_DEPTH + 1) * 32;

const PAGE_INDEX_BITS: usize = MEMORY_TREE_DEPTH - PAGE_TREE_DEPTH;

pub type MemoryProof = [u8; PROOF_SIZE];

fn word_in_leaf(leaf: &[u8], addr: u64) -> u32 {
    let at = (addr & 31) as usize;
    u32::from_be_bytes([leaf[at], leaf[at + 1], leaf[at + 2], leaf[at + 3]])
}

fn doubleword_in_leaf(leaf: &[u8], addr: u64) -> u64 {
    let at = (addr & 31) as usize;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&leaf[at..at + 8]);
    u64::from_be_bytes(bytes)
}

pub fn proof_root(proof: &[u8], addr: u64) -> B256 {
    let mut node = B256::from_slice(&proof[..32]);
    let path = addr >> 5;
    for i in 0..MEMORY_TREE_DEPTH {
        let sibling = B256::from_slice(&proof[(i + 1) * 32..(i + 2) * 32]);
        node = if (path >> i) & 1 == 1 { hash_pair(&sibling, &node) } else { hash_pair(&node, &sibling) };
    }
    node
}

pub fn verify_proof(root: B256, addr: u64, proof: &[u8]) -> bool {
    proof.len() == PROOF_SIZE && proof_root(proof, addr) == root
}

fn check_aligned(addr: u64, size: u64) -> Result<(), VmError> {
    if addr & (size - 1) != 0 {
        return Err(VmError::UnalignedAccess(addr));
    }
    Ok(())
}

/// Doubleword-level memory access used by the step function.
pub trait MemoryAccess {
    fn fetch_instruction(&mut self, addr: u64) -> Result<u32, VmError>;

    fn read_doubleword(&mut self, addr: u64) -> Result<u64, VmError>;

    fn write_doubleword(&mut self, addr: u64, value: u64) -> Result<(), VmError>;
}

/// Full memory of a running program.
#[derive(Clone, Default)]
pub struct Memory {
    pages: BTreeMap<u64, Page>,
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory").field("pages", &self.pages.len()).finish()
    }
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn page_mut(&mut self, addr: u64) -> &mut Page {
        let page = self.pages.entry(addr >> PAGE_ADDR_SIZE).or_insert_with(Page::new);
        page.root = None;
        page
    }

    pub fn get_word(&self, addr: u64) -> u32 {
        let at = (addr & PAGE_ADDR_MASK & !3) as usize;
        self.pages
            .get(&(addr >> PAGE_ADDR_SIZE))
            .map_or(0, |page| word_in_leaf(&page.data[at & !31..], at as u64 & 31))
    }

    pub fn get_doubleword(&self, addr: u64) -> u64 {
        let at = (addr & PAGE_ADDR_MASK & !7) as usize;
        self.pages
            .get(&(addr >> PAGE_ADDR_SIZE))
            .map_or(0, |page| doubleword_in_leaf(&page.data[at & !31..], at as u64 & 31))
    }

    pub fn set_doubleword(&mut self, addr: u64, value: u64) {
        let at = (addr & PAGE_ADDR_MASK & !7) as usize;
        self.page_mut(addr).data[at..at + 8].copy_from_slice(&value.to_be_bytes());
    }

    pub fn set_range(&mut self, addr: u64, bytes: &[u8]) {
        let mut addr = addr;
        let mut rest = bytes;
        while !rest.is_empty() {
            let at = (addr & PAGE_ADDR_MASK) as usize;
            let n = rest.len().min(PAGE_SIZE - at);
            self.page_mut(addr).data[at..at + n].copy_from_slice(&rest[..n]);
            rest = &rest[n..];
            addr = addr.wrapping_add(n as u64);
        }
    }

    pub fn read_range(&self, addr: u64, len: u64) -> Vec<u8> {
        (0..len)
            .map(|i| {
                let a = addr.wrapping_add(i);
                self.pages
                    .get(&(a >> PAGE_ADDR_SIZE))
                    .map_or(0, |p| p.data[(a & PAGE_ADDR_MASK) as usize])
            })
            .collect()
    }

    /// Root of the subtree over pages `[index << height, (index + 1) << height)`.
    fn subtree(&mut self, height: usize, index: u64) -> B256 {
        let start = index << height;
        let end = (index + 1) << height;
        let occupied = self.pages.range(start..).next().is_some_and(|(k, _)| *k < end);
        if !occupied {
            return zero_hashes()[PAGE_TREE_DEPTH + height];
        }
        if height == 0 {
            return self.pages.get_mut(&index).map_or(zero_hashes()[PAGE_TREE_DEPTH], Page::root);
        }
        let left = self.subtree(height - 1, index << 1);
        let right = self.subtree(height - 1, (index << 1) | 1);
        hash_pair(&left, &right)
    }

    pub fn merkle_root(&mut self) -> B256 {
        self.subtree(PAGE_INDEX_BITS, 0)
    }

    /// Proof for the leaf holding `addr`.
    pub fn merkle_proof(&mut self, addr: u64) -> MemoryProof {
        let mut proof = [0u8; PROOF_SIZE];
        let page_index = addr >> PAGE_ADDR_SIZE;
        let mut leaf_index = ((addr & PAGE_ADDR_MASK) as usize) / LEAF_SIZE;
        match self.pages.get(&page_index) {
            Some(page) => {
                let levels = page.levels();
                proof[..32].copy_from_slice(levels[0][leaf_index].as_slice());
                for height in 0..PAGE_TREE_DEPTH {
                    let sibling = levels[height][leaf_index ^ 1];
                    proof[(height + 1) * 32..(height + 2) * 32].copy_from_slice(sibling.as_slice());
                    leaf_index >>= 1;
                }
            }
            None => {
                for height in 0..PAGE_TREE_DEPTH {
                    let zero = zero_hashes()[height];
                    proof[(height + 1) * 32..(height + 2) * 32].copy_from_slice(zero.as_slice());
                }
            }
        }
        for height in 0..PAGE_INDEX_BITS {
            let sibling = self.subtree(height, (page_index >> height) ^ 1);
            let at = (PAGE_TREE_DEPTH + height + 1) * 32;
            proof[at..at + 32].copy_from_slice(sibling.as_slice());
        }
        proof
    }
}

/// Memory known only through a root and the proofs in a step witness.
#[derive(Debug, Clone)]
pub struct ProofMemory {
    root: B256,
    insn_proof: MemoryProof,
    data_proof: Option<MemoryProof>,
}

impl ProofMemory {
    pub fn new(root: B256, insn_proof: &[u8], data_proof: Option<&[u8]>) -> Result<Self, VmError> {
        let to_proof = |p: &[u8]| -> Result<MemoryProof, VmError> {
            p.try_into().map_err(|_| VmError::ProofSize(p.len()))
        };
        Ok(Self { root, insn_proof: to_proof(insn_proof)?, data_proof: data_proof.map(to_proof).transpose()? })
    }

    pub const fn root(&self) -> B256 {
        self.root
    }

    fn data_leaf(&self, addr: u64) -> Result<&MemoryProof, VmError> {
        let proof = self.data_proof.as_ref().ok_or(VmError::MissingProof)?;
        if !verify_proof(self.root, addr, proof) {
            return Err(VmError::InvalidProof(addr));
        }
        Ok(proof)
    }
}

impl MemoryAccess for ProofMemory {
    fn fetch_instruction(&mut self, addr: u64) -> Result<u32, VmError> {
        check_aligned(addr, 4)?;
        if !verify_proof(self.root, addr, &self.insn_proof) {
            return Err(VmError::InvalidProof(addr));
        }
        Ok(word_in_leaf(&self.insn_proof, addr))
    }

    fn read_doubleword(&mut self, addr: u64) -> Result<u64, VmError> {
        check_aligned(addr, 8)?;
        Ok(doubleword_in_leaf(self.data_leaf(addr)?, addr))
    }

    fn write_doubleword(&mut self, addr: u64, value: u64) -> Result<(), VmError> {
        check_aligned(addr, 8)?;
        let mut proof = *self.data_leaf(addr)?;
        let at = (addr & 31) as usize;
        proof[at..at + 8].copy_from_slice(&value.to_be_bytes());
        self.root = proof_root(&proof, addr);
        self.data_proof = Some(proof);
        Ok(())
    }
}

/// Full memory that records a proof for the one data leaf a step touches.
#[derive(Debug)]
pub(crate) struct TrackedMemory<'a> {
    memory: &'a mut Memory,
    track: bool,
    data: Option<(u64, MemoryProof)>,
}

impl<'a> TrackedMemory<'a> {
    pub(crate) fn new(memory: &'a mut Memory, track: bool) -> Self {
        Self { memory, track, data: None }
    }

    pub(crate) fn into_data_proof(self) -> Option<MemoryProof> {
        self.data.map(|(_, proof)| proof)
    }

    fn track(&mut self, addr: u64) -> Result<(), VmError> {
        if !self.track {
            return Ok(());
        }
        match self.data {
            Some((first, _)) if first & !31 == addr & !31 => Ok(()),
            Some((first, _)) => Err(VmError::TooManyAccesses { first, second: addr }),
            None => {
                self.data = Some((addr, self.memory.merkle_proof(addr)));
                Ok(())
            }
        }
    }
}

impl MemoryAccess for TrackedMemory<'_> {
    fn fetch_instruction(&mut self, addr: u64) -> Result<u32, VmError> {
        check_aligned(addr, 4)?;
        Ok(self.memory.get_word(addr))
    }

    fn read_doubleword(&mut self, addr: u64) -> Result<u64, VmError> {
        check_aligned(addr, 8)?;
        self.track(addr)?;
        Ok(self.memory.get_doubleword(addr))
    }

    fn write_doubleword(&mut self, addr: u64, value: u64) -> Result<(), VmError> {
        check_aligned(addr, 8)?;
        self.track(addr)?;
        self.memory.set_doubleword(addr, value);
        Ok(())
    }
}
