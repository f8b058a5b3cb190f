//! Sparse paged memory with a binary Merkle tree over 32-byte leaves.

use std::{collections::BTreeMap, fmt, sync::OnceLock};

use alloy_primitives::{keccak256, B256};

use super::VmError;

pub const PAGE_ADDR_SIZE: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_ADDR_SIZE;
pub const PAGE_ADDR_MASK: u32 = (PAGE_SIZE - 1) as u32;
pub const LEAF_SIZE: usize = 32;
/// Levels between a leaf and the root.
pub const MEMORY_TREE_DEPTH: usize = 27;
/// A leaf followed by its siblings bottom-up.
pub const PROOF_SIZE: usize = (MEMORY_TREE_DEPTH + 1) * 32;

pub(crate) const PAGE_TREE_DEPTH: usize = 7;
/// Deep enough for the 64-bit address space.
const ZERO_HASH_LEVELS: usize = 64;
const PAGE_INDEX_BITS: usize = MEMORY_TREE_DEPTH - PAGE_TREE_DEPTH;
const LEAVES_PER_PAGE: usize = PAGE_SIZE / LEAF_SIZE;

pub type MemoryProof = [u8; PROOF_SIZE];

pub(crate) fn hash_pair(left: &B256, right: &B256) -> B256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left.as_slice());
    buf[32..].copy_from_slice(right.as_slice());
    keccak256(buf)
}

/// Roots of all-zero subtrees by height; height 0 is a zero leaf.
pub(crate) fn zero_hashes() -> &'static [B256; ZERO_HASH_LEVELS + 1] {
    static ZERO: OnceLock<[B256; ZERO_HASH_LEVELS + 1]> = OnceLock::new();
    ZERO.get_or_init(|| {
        let mut zeros = [B256::ZERO; ZERO_HASH_LEVELS + 1];
        for i in 1..=ZERO_HASH_LEVELS {
            zeros[i] = hash_pair(&zeros[i - 1], &zeros[i - 1]);
        }
        zeros
    })
}

fn word_in_leaf(leaf: &[u8], addr: u32) -> u32 {
    let at = (addr & 31) as usize;
    u32::from_be_bytes([leaf[at], leaf[at + 1], leaf[at + 2], leaf[at + 3]])
}

/// Fold a proof up to the root it commits to.
pub fn proof_root(proof: &[u8], addr: u32) -> B256 {
    let mut node = B256::from_slice(&proof[..32]);
    let path = addr >> 5;
    for i in 0..MEMORY_TREE_DEPTH {
        let sibling = B256::from_slice(&proof[(i + 1) * 32..(i + 2) * 32]);
        node = if (path >> i) & 1 == 1 { hash_pair(&sibling, &node) } else { hash_pair(&node, &sibling) };
    }
    node
}

pub fn verify_proof(root: B256, addr: u32, proof: &[u8]) -> bool {
    proof.len() == PROOF_SIZE && proof_root(proof, addr) == root
}

fn check_aligned(addr: u32) -> Result<(), VmError> {
    if addr & 3 != 0 {
        return Err(VmError::UnalignedAccess(addr.into()));
    }
    Ok(())
}

/// Word-level memory access used by the step function.
pub trait MemoryAccess {
    fn fetch_instruction(&mut self, addr: u32) -> Result<u32, VmError>;

    fn read_word(&mut self, addr: u32) -> Result<u32, VmError>;

    fn write_word(&mut self, addr: u32, value: u32) -> Result<(), VmError>;
}

#[derive(Clone)]
pub(crate) struct Page {
    pub(crate) data: Box<[u8; PAGE_SIZE]>,
    pub(crate) root: Option<B256>,
}

impl Page {
    pub(crate) fn new() -> Self {
        Self { data: Box::new([0u8; PAGE_SIZE]), root: None }
    }

    /// Every level of the page's subtree, leaves first.
    pub(crate) fn levels(&self) -> Vec<Vec<B256>> {
        let mut levels = Vec::with_capacity(PAGE_TREE_DEPTH + 1);
        levels.push(self.data.chunks_exact(LEAF_SIZE).map(B256::from_slice).collect::<Vec<_>>());
        for height in 0..PAGE_TREE_DEPTH {
            let next = levels[height].chunks_exact(2).map(|p| hash_pair(&p[0], &p[1])).collect();
            levels.push(next);
        }
        levels
    }

    pub(crate) fn root(&mut self) -> B256 {
        if let Some(root) = self.root {
            return root;
        }
        let root = self.levels()[PAGE_TREE_DEPTH][0];
        self.root = Some(root);
        root
    }
}

/// Full memory of a running program.
#[derive(Clone, Default)]
pub struct Memory {
    pages: BTreeMap<u32, Page>,
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

    fn page_mut(&mut self, addr: u32) -> &mut Page {
        let page = self.pages.entry(addr >> PAGE_ADDR_SIZE).or_insert_with(Page::new);
        page.root = None;
        page
    }

    pub fn get_word(&self, addr: u32) -> u32 {
        match self.pages.get(&(addr >> PAGE_ADDR_SIZE)) {
            Some(page) => {
                let at = (addr & PAGE_ADDR_MASK & !3) as usize;
                u32::from_be_bytes([page.data[at], page.data[at + 1], page.data[at + 2], page.data[at + 3]])
            }
            None => 0,
        }
    }

    pub fn set_word(&mut self, addr: u32, value: u32) {
        let at = (addr & PAGE_ADDR_MASK & !3) as usize;
        self.page_mut(addr).data[at..at + 4].copy_from_slice(&value.to_be_bytes());
    }

    /// Copy `bytes` in at `addr`, allocating pages as needed.
    pub fn set_range(&mut self, addr: u32, bytes: &[u8]) {
        let mut addr = addr;
        let mut rest = bytes;
        while !rest.is_empty() {
            let at = (addr & PAGE_ADDR_MASK) as usize;
            let n = rest.len().min(PAGE_SIZE - at);
            self.page_mut(addr).data[at..at + n].copy_from_slice(&rest[..n]);
            rest = &rest[n..];
            addr = addr.wrapping_add(n as u32);
        }
    }

    pub fn read_range(&self, addr: u32, len: u32) -> Vec<u8> {
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
    fn subtree(&mut self, height: usize, index: u32) -> B256 {
        let start = (index as u64) << height;
        let end = (index as u64 + 1) << height;
        let occupied = self.pages.range(start as u32..).next().is_some_and(|(k, _)| (*k as u64) < end);
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
    pub fn merkle_proof(&mut self, addr: u32) -> MemoryProof {
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

const _: () = assert!(LEAVES_PER_PAGE == 1 << PAGE_TREE_DEPTH);

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

    fn data_leaf(&self, addr: u32) -> Result<&MemoryProof, VmError> {
        let proof = self.data_proof.as_ref().ok_or(VmError::MissingProof)?;
        if !verify_proof(self.root, addr, proof) {
            return Err(VmError::InvalidProof(addr.into()));
        }
        Ok(proof)
    }
}

impl MemoryAccess for ProofMemory {
    fn fetch_instruction(&mut self, addr: u32) -> Result<u32, VmError> {
        check_aligned(addr)?;
        if !verify_proof(self.root, addr, &self.insn_proof) {
            return Err(VmError::InvalidProof(addr.into()));
        }
        Ok(word_in_leaf(&self.insn_proof, addr))
    }

    fn read_word(&mut self, addr: u32) -> Result<u32, VmError> {
        check_aligned(addr)?;
        Ok(word_in_leaf(self.data_leaf(addr)?, addr))
    }

    fn write_word(&mut self, addr: u32, value: u32) -> Result<(), VmError> {
        check_aligned(addr)?;
        let mut proof = *self.data_leaf(addr)?;
        let at = (addr & 31) as usize;
        proof[at..at + 4].copy_from_slice(&value.to_be_bytes());
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
    data: Option<(u32, MemoryProof)>,
}

impl<'a> TrackedMemory<'a> {
    pub(crate) fn new(memory: &'a mut Memory, track: bool) -> Self {
        Self { memory, track, data: None }
    }

    pub(crate) fn into_data_proof(self) -> Option<MemoryProof> {
        self.data.map(|(_, proof)| proof)
    }

    fn track(&mut self, addr: u32) -> Result<(), VmError> {
        if !self.track {
            return Ok(());
        }
        match self.data {
            Some((first, _)) if first & !31 == addr & !31 => Ok(()),
            Some((first, _)) => Err(VmError::TooManyAccesses { first: first.into(), second: addr.into() }),
            None => {
                self.data = Some((addr, self.memory.merkle_proof(addr)));
                Ok(())
            }
        }
    }
}

impl MemoryAccess for TrackedMemory<'_> {
    fn fetch_instruction(&mut self, addr: u32) -> Result<u32, VmError> {
        check_aligned(addr)?;
        Ok(self.memory.get_word(addr))
    }

    fn read_word(&mut self, addr: u32) -> Result<u32, VmError> {
        check_aligned(addr)?;
        self.track(addr)?;
        Ok(self.memory.get_word(addr))
    }

    fn write_word(&mut self, addr: u32, value: u32) -> Result<(), VmError> {
        check_aligned(addr)?;
        self.track(addr)?;
        self.memory.set_word(addr, value);
        Ok(())
    }
}
