//! L2 block access through `debug_getRawBlock`.
//!
//! The raw RLP block is the only RPC shape that carries every transaction, deposits included,
//! in the exact encoding batches are built from.

use std::{fmt, sync::Arc, time::Duration};

use alloy_consensus::Block;
use alloy_eips::eip2718::Encodable2718;
use alloy_primitives::Bytes;
use alloy_rlp::Decodable;
use async_trait::async_trait;
use backon::Retryable;
use op_alloy_consensus::OpTxEnvelope;
use opcore_pipeline::{L1BlockInfo, RollupConfig};
use opcore_types::{BlockId, L2BlockRef};
use tracing::debug;

use super::{
    retry::RetryConfig,
    rpc::{quantity, RpcClient},
    L1SourceError,
};

pub type L2Block = Block<OpTxEnvelope>;

/// Read access to the L2 chain.
#[async_trait]
pub trait L2Provider: Send + Sync {
    /// Block `number`, or the latest block when `None`.
    async fn block_by_number(&self, number: Option<u64>) -> Result<L2Block, L1SourceError>;

    async fn block_ref_by_number(&self, number: Option<u64>) -> Result<L2BlockRef, L1SourceError>;
}

#[async_trait]
impl<P: L2Provider + ?Sized> L2Provider for Arc<P> {
    async fn block_by_number(&self, number: Option<u64>) -> Result<L2Block, L1SourceError> {
        (**self).block_by_number(number).await
    }

    async fn block_ref_by_number(&self, number: Option<u64>) -> Result<L2BlockRef, L1SourceError> {
        (**self).block_ref_by_number(number).await
    }
}

/// Reference of an L2 block, reading its L1 origin from the L1 info deposit.
pub fn l2_block_ref(block: &L2Block, cfg: &RollupConfig) -> Result<L2BlockRef, L1SourceError> {
    let header = &block.header;
    let hash = header.hash_slow();
    let (l1_origin, sequence_number) = if header.number == cfg.genesis.l2.number {
        if hash != cfg.genesis.l2.hash {
            return Err(L1SourceError::Decode(format!(
                "L2 genesis hash mismatch: expected {}, got {hash}",
                cfg.genesis.l2.hash
            )));
        }
        (cfg.genesis.l1, 0)
    } else {
        let info = l1_info_of(block)?;
        (BlockId::new(info.hash, info.number), info.sequence_number)
    };
    Ok(L2BlockRef {
        hash,
        number: header.number,
        parent_hash: header.parent_hash,
        timestamp: header.timestamp,
        l1_origin,
        sequence_number,
    })
}

/// Decode the L1 info deposit at the head of an L2 block.
pub fn l1_info_of(block: &L2Block) -> Result<L1BlockInfo, L1SourceError> {
    let Some(OpTxEnvelope::Deposit(first)) = block.body.transactions.first() else {
        return Err(L1SourceError::Decode(format!(
            "L2 block {} does not start with an L1 info deposit",
            block.header.number
        )));
    };
    L1BlockInfo::decode_calldata(&first.inner().input)
        .map(|(_, info)| info)
        .map_err(|e| L1SourceError::Decode(e.to_string()))
}

/// EIP-2718 encodings of a block's transactions.
pub fn raw_transactions(block: &L2Block) -> Vec<Bytes> {
    block.body.transactions.iter().map(|tx| Bytes::from(tx.encoded_2718())).collect()
}

/// EIP-2718 encodings of the non-deposit transactions, the part of a block that goes into batches.
pub fn batch_transactions(block: &L2Block) -> Vec<Bytes> {
    block
        .body
        .transactions
        .iter()
        .filter(|tx| !tx.is_deposit())
        .map(|tx| Bytes::from(tx.encoded_2718()))
        .collect()
}

/// [`L2Provider`] backed by an L2 execution client's JSON-RPC.
pub struct HttpL2Provider {
    rpc: RpcClient,
    cfg: Arc<RollupConfig>,
    retry: RetryConfig,
}

impl fmt::Debug for HttpL2Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpL2Provider").field("url", &self.rpc.url()).finish_non_exhaustive()
    }
}

impl HttpL2Provider {
    pub fn new(
        url: impl Into<String>,
        cfg: Arc<RollupConfig>,
        retry: RetryConfig,
    ) -> Result<Self, L1SourceError> {
        Ok(Self { rpc: RpcClient::new(url, Duration::from_secs(10))?, cfg, retry })
    }
}

#[async_trait]
impl L2Provider for HttpL2Provider {
    async fn block_by_number(&self, number: Option<u64>) -> Result<L2Block, L1SourceError> {
        let tag = number.map_or_else(|| "latest".to_string(), quantity);
        let raw: Bytes = (|| async { self.rpc.request("debug_getRawBlock", [tag.clone()]).await })
            .retry(self.retry.backoff())
            .when(L1SourceError::is_transient)
            .notify(|err, dur| {
                debug!(target: "opcore::l1", %err, delay = ?dur, "retrying debug_getRawBlock");
            })
            .await?;
        Ok(L2Block::decode(&mut raw.as_ref())?)
    }

    async fn block_ref_by_number(&self, number: Option<u64>) -> Result<L2BlockRef, L1SourceError> {
        let block = self.block_by_number(number).await?;
        l2_block_ref(&block, &self.cfg)
    }
}

