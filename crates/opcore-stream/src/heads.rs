//! Safe and finalized head tracking for derived L2 blocks.
//!
//! - **Unsafe**: latest L2 block known to the node
//! - **Safe**: latest L2 block derived from data posted to L1
//! - **Finalized**: latest safe block whose L1 inclusion block has reached finality

use std::collections::VecDeque;

use opcore_types::{BlockId, L2BlockRef};

/// Head update event.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct HeadUpdate {
    pub unsafe_head: BlockId,
    pub safe_head: BlockId,
    pub finalized_head: BlockId,
}

#[derive(Debug, Clone)]
struct SafeEntry {
    block: BlockId,
    /// The L1 block where the batch containing this L2 block was posted.
    l1_inclusion: u64,
}

/// Tracks L2 heads from derivation results, L1 inclusion and finality.
#[derive(Debug)]
pub struct HeadTracker {
    unsafe_head: BlockId,
    /// Recent safe blocks (oldest first).
    safe: VecDeque<SafeEntry>,
    max_entries: usize,
    /// L1 blocks required for finality (64 on mainnet, two PoS epochs).
    finality_depth: u64,
    finalized: BlockId,
    l1_head: u64,
}

impl HeadTracker {
    pub fn new(finality_depth: u64) -> Self {
        Self {
            unsafe_head: BlockId::default(),
            safe: VecDeque::new(),
            max_entries: 10_000,
            finality_depth,
            finalized: BlockId::default(),
            l1_head: 0,
        }
    }

    pub fn mainnet() -> Self {
        Self::new(64)
    }

    pub fn set_unsafe(&mut self, head: &L2BlockRef) {
        self.unsafe_head = head.id();
    }

    /// Record a block derived from a batch included in L1 block `l1_inclusion`.
    pub fn add_safe(&mut self, block: &L2BlockRef, l1_inclusion: u64) {
        if self.safe.len() >= self.max_entries {
            self.safe.pop_front();
        }
        self.safe.push_back(SafeEntry { block: block.id(), l1_inclusion });
        if block.number > self.unsafe_head.number {
            self.unsafe_head = block.id();
        }
    }

    /// Update the L1 head and return the new head positions.
    pub fn update_l1_head(&mut self, l1_number: u64) -> HeadUpdate {
        self.l1_head = l1_number;
        let cutoff = self.l1_head.saturating_sub(self.finality_depth);
        if let Some(pos) = self.safe.iter().rposition(|e| e.l1_inclusion <= cutoff) {
            self.finalized = self.safe[pos].block;
            // Entries below the finalized head are no longer needed.
            self.safe.drain(..pos);
        }
        self.heads()
    }

    pub fn heads(&self) -> HeadUpdate {
        HeadUpdate {
            unsafe_head: self.unsafe_head,
            safe_head: self.safe.back().map(|e| e.block).unwrap_or(self.finalized),
            finalized_head: self.finalized,
        }
    }

    /// Drop every safe block whose batch was included at or after `first_invalid_l1`.
    pub fn handle_reorg(&mut self, first_invalid_l1: u64) {
        self.safe.retain(|e| e.l1_inclusion < first_invalid_l1);
    }
}
