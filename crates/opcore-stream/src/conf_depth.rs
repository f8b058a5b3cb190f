//! Confirmation depth filter over an [`L1Provider`].

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use alloy_consensus::{Header, Receipt};
use alloy_primitives::{Sealed, B256};
use async_trait::async_trait;
use opcore_types::L1BlockRef;

use super::{l1::L1Provider, types::RpcTransaction, L1SourceError};

/// Shared L1 head number, updated by whoever follows the chain. Zero means unknown.
#[derive(Debug, Clone, Default)]
pub struct L1Head(Arc<AtomicU64>);

impl L1Head {
    pub fn set(&self, number: u64) {
        self.0.store(number, Ordering::Release);
    }

    pub fn get(&self) -> Option<u64> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            n => Some(n),
        }
    }
}

/// Hides blocks that are fewer than `depth` blocks below the L1 head.
///
/// Lookups by number above the threshold fail with `NotConfirmed`. Lookups by hash are passed
/// through: a caller holding the hash already learned about the block through a numbered lookup.
#[derive(Debug, Clone)]
pub struct ConfDepth<P> {
    inner: P,
    depth: u64,
    head: L1Head,
}

impl<P> ConfDepth<P> {
    pub fn new(inner: P, depth: u64, head: L1Head) -> Self {
        Self { inner, depth, head }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    /// `Ok` if block `number` may be served.
    pub fn check(&self, number: u64) -> Result<(), L1SourceError> {
        if self.depth == 0 {
            return Ok(());
        }
        match self.head.get() {
            Some(head) if number + self.depth > head => {
                Err(L1SourceError::NotConfirmed { number, head, depth: self.depth })
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl<P: L1Provider> L1Provider for ConfDepth<P> {
    async fn head_number(&self) -> Result<u64, L1SourceError> {
        let head = match self.head.get() {
            Some(h) => h,
            None => self.inner.head_number().await?,
        };
        Ok(head.saturating_sub(self.depth))
    }

    async fn block_ref_by_number(&self, number: u64) -> Result<L1BlockRef, L1SourceError> {
        self.check(number)?;
        self.inner.block_ref_by_number(number).await
    }

    async fn block_ref_by_hash(&self, hash: B256) -> Result<L1BlockRef, L1SourceError> {
        self.inner.block_ref_by_hash(hash).await
    }

    async fn block_info_and_txs_by_hash(
        &self,
        hash: B256,
    ) -> Result<(Sealed<Header>, Arc<Vec<RpcTransaction>>), L1SourceError> {
        self.inner.block_info_and_txs_by_hash(hash).await
    }

    async fn receipts_by_hash(&self, hash: B256) -> Result<Arc<Vec<Receipt>>, L1SourceError> {
        self.inner.receipts_by_hash(hash).await
    }
}
