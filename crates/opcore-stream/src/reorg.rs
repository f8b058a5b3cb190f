//! L1 reorg detection.

use std::collections::VecDeque;

use alloy_primitives::B256;
use opcore_types::{BlockId, L1BlockRef};
use tracing::warn;

/// Information about a detected reorg.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ReorgEvent {
    /// The block number where the reorg was detected.
    pub detected_at: u64,
    /// The first invalid block number (fork point + 1).
    pub first_invalid: u64,
    /// Depth of the reorg (number of blocks invalidated).
    pub depth: u64,
    /// The old block hash at the fork point.
    pub old_hash: B256,
    /// The new block hash at the fork point.
    pub new_hash: B256,
}

/// Detects L1 reorgs by tracking parent hash consistency.
#[derive(Debug)]
pub struct ReorgDetector {
    /// Recent blocks in order (oldest first).
    recent: VecDeque<BlockId>,
    /// Maximum number of blocks to track.
    max_depth: usize,
}

impl ReorgDetector {
    /// `max_depth` bounds the deepest reorg that can be located precisely.
    pub fn new(max_depth: usize) -> Self {
        Self { recent: VecDeque::with_capacity(max_depth), max_depth }
    }

    /// Process a new L1 head and check it against the tracked chain.
    pub fn process_block(&mut self, block: &L1BlockRef) -> Option<ReorgEvent> {
        if self.recent.contains(&block.id()) {
            return None;
        }
        let reorg = self.recent.back().and_then(|tip| {
            if block.number == tip.number + 1 && block.parent_hash != tip.hash {
                let (first_invalid, old_hash) = self.find_fork_point(&block.parent_hash);
                Some(ReorgEvent {
                    detected_at: block.number,
                    first_invalid,
                    depth: block.number.saturating_sub(first_invalid),
                    old_hash,
                    new_hash: block.parent_hash,
                })
            } else if block.number <= tip.number {
                let old = self.recent.iter().find(|b| b.number == block.number);
                Some(ReorgEvent {
                    detected_at: block.number,
                    first_invalid: block.number,
                    depth: tip.number.saturating_sub(block.number) + 1,
                    old_hash: old.map(|b| b.hash).unwrap_or_default(),
                    new_hash: block.hash,
                })
            } else {
                None
            }
        });

        if let Some(event) = &reorg {
            warn!(
                target: "opcore::l1",
                first_invalid = event.first_invalid,
                depth = event.depth,
                "L1 reorg detected"
            );
            self.recent.retain(|b| b.number < event.first_invalid);
        }

        if self.recent.len() >= self.max_depth {
            self.recent.pop_front();
        }
        self.recent.push_back(block.id());
        reorg
    }

    pub fn latest_block(&self) -> Option<u64> {
        self.recent.back().map(|b| b.number)
    }

    pub fn reset(&mut self) {
        self.recent.clear();
    }

    /// Search backwards for the block the new chain builds on.
    fn find_fork_point(&self, parent_hash: &B256) -> (u64, B256) {
        if let Some(block) = self.recent.iter().rev().find(|b| b.hash == *parent_hash) {
            return (block.number + 1, block.hash);
        }
        // Deeper than the window: everything we track is suspect.
        self.recent.front().map(|b| (b.number, b.hash)).unwrap_or_default()
    }
}
