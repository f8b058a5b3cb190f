//! Batcher data of one L1 block: calldata and blobs sent to the batch inbox.

use std::{collections::VecDeque, sync::Arc};

use alloy_primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use opcore_pipeline::{decode_blob, RollupConfig, SystemConfig};
use opcore_stream::{BlobProvider, L1Provider, L1SourceError};
use opcore_types::L1BlockRef;
use tracing::{debug, warn};

use crate::{
    errors::{PipelineError, PipelineResult},
    traits::{
        FrameQueueProvider, L1RetrievalProvider, OriginAdvancer, OriginProvider, ResettableStage,
    },
};

/// Reads batcher transactions out of L1 blocks.
#[derive(Debug)]
pub struct EthereumDataSource<P, B> {
    provider: P,
    blobs: B,
    cfg: Arc<RollupConfig>,
}

enum Item {
    Calldata(Bytes),
    Blob(usize),
}

impl<P: L1Provider, B: BlobProvider> EthereumDataSource<P, B> {
    pub fn new(provider: P, blobs: B, cfg: Arc<RollupConfig>) -> Self {
        Self { provider, blobs, cfg }
    }

    /// All batcher payloads of `block`, in transaction order.
    ///
    /// Blob transactions are only honoured once Ecotone is active; their calldata is ignored.
    /// A blob that fails to decode is skipped.
    pub async fn open_data(
        &self,
        block: &L1BlockRef,
        batcher: Address,
    ) -> PipelineResult<VecDeque<Bytes>> {
        let (_, txs) = self.provider.block_info_and_txs_by_hash(block.hash).await?;
        let blobs_enabled = self.cfg.is_ecotone_active(block.timestamp);

        let mut items = Vec::new();
        let mut hashes: Vec<B256> = Vec::new();
        for tx in txs.iter() {
            if tx.to != Some(self.cfg.batch_inbox_address) || tx.from != batcher {
                continue;
            }
            if !tx.is_blob() {
                items.push(Item::Calldata(tx.input.clone()));
                continue;
            }
            if !blobs_enabled {
                continue;
            }
            if !tx.input.is_empty() {
                warn!(target: "opcore::derive", tx = %tx.hash, "ignoring calldata of blob transaction");
            }
            for hash in &tx.blob_versioned_hashes {
                items.push(Item::Blob(hashes.len()));
                hashes.push(*hash);
            }
        }

        let blobs = if hashes.is_empty() {
            Vec::new()
        } else {
            self.blobs.get_blobs(block, &hashes).await?
        };

        let mut out = VecDeque::with_capacity(items.len());
        for item in items {
            match item {
                Item::Calldata(data) => out.push_back(data),
                Item::Blob(i) => {
                    let Some(blob) = blobs.get(i) else {
                        let err = L1SourceError::BlobNotFound(block.number, hashes[i].to_string());
                        return Err(PipelineError::Provider(err).temp());
                    };
                    match decode_blob(blob) {
                        Ok(data) => out.push_back(data.into()),
                        Err(err) => {
                            warn!(target: "opcore::derive", %err, hash = %hashes[i], "skipping undecodable blob")
                        }
                    }
                }
            }
        }
        debug!(target: "opcore::derive", l1_block = block.number, items = out.len(), "opened L1 data");
        Ok(out)
    }
}

/// Second stage: turns the current origin into batcher payloads.
#[derive(Debug)]
pub struct L1Retrieval<T, P, B> {
    prev: T,
    source: EthereumDataSource<P, B>,
    data: Option<VecDeque<Bytes>>,
}

impl<T, P, B> L1Retrieval<T, P, B>
where
    T: L1RetrievalProvider + OriginAdvancer + OriginProvider + ResettableStage + Send,
    P: L1Provider,
    B: BlobProvider,
{
    pub fn new(prev: T, source: EthereumDataSource<P, B>) -> Self {
        Self { prev, source, data: None }
    }

    pub fn prev(&self) -> &T {
        &self.prev
    }
}

#[async_trait]
impl<T, P, B> FrameQueueProvider for L1Retrieval<T, P, B>
where
    T: L1RetrievalProvider + OriginAdvancer + OriginProvider + ResettableStage + Send,
    P: L1Provider,
    B: BlobProvider,
{
    async fn next_data(&mut self) -> PipelineResult<Bytes> {
        if self.data.is_none() {
            let block =
                self.prev.next_l1_block().await?.ok_or(PipelineError::MissingOrigin.temp())?;
            let batcher = self.prev.batcher_address();
            self.data = Some(self.source.open_data(&block, batcher).await?);
        }

        match self.data.as_mut().and_then(VecDeque::pop_front) {
            Some(data) => Ok(data),
            None => {
                self.data = None;
                Err(PipelineError::Eof.temp())
            }
        }
    }
}

#[async_trait]
impl<T, P, B> OriginAdvancer for L1Retrieval<T, P, B>
where
    T: L1RetrievalProvider + OriginAdvancer + OriginProvider + ResettableStage + Send,
    P: L1Provider,
    B: BlobProvider,
{
    async fn advance_origin(&mut self) -> PipelineResult<()> {
        self.prev.advance_origin().await
    }
}

impl<T: OriginProvider, P, B> OriginProvider for L1Retrieval<T, P, B> {
    fn origin(&self) -> Option<L1BlockRef> {
        self.prev.origin()
    }
}

#[async_trait]
impl<T, P, B> ResettableStage for L1Retrieval<T, P, B>
where
    T: L1RetrievalProvider + OriginAdvancer + OriginProvider + ResettableStage + Send,
    P: L1Provider,
    B: BlobProvider,
{
    async fn reset(&mut self, base: L1BlockRef, system_config: &SystemConfig) -> PipelineResult<()> {
        self.prev.reset(base, system_config).await?;
        self.data = None;
        Ok(())
    }
}
