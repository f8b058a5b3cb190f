//! L1 JSON-RPC source with LRU caching and backoff retry.

use std::{fmt, sync::Arc, time::Duration};

use alloy_consensus::{Header, Receipt};
use alloy_primitives::{Sealed, B256};
use async_trait::async_trait;
use backon::Retryable;
use bon::Builder;
use opcore_types::L1BlockRef;
use schnellru::{ByLength, LruMap};
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    retry::RetryConfig,
    rpc::{quantity, RpcClient},
    types::{RpcBlock, RpcHeader, RpcReceipt, RpcTransaction},
    L1SourceError,
};

/// Read access to the L1 chain used by derivation and the batcher.
#[async_trait]
pub trait L1Provider: Send + Sync {
    /// Number of the newest block the provider will serve.
    async fn head_number(&self) -> Result<u64, L1SourceError>;

    async fn block_ref_by_number(&self, number: u64) -> Result<L1BlockRef, L1SourceError>;

    async fn block_ref_by_hash(&self, hash: B256) -> Result<L1BlockRef, L1SourceError>;

    /// Header plus the transactions derivation inspects.
    async fn block_info_and_txs_by_hash(
        &self,
        hash: B256,
    ) -> Result<(Sealed<Header>, Arc<Vec<RpcTransaction>>), L1SourceError>;

    async fn receipts_by_hash(&self, hash: B256) -> Result<Arc<Vec<Receipt>>, L1SourceError>;
}

#[async_trait]
impl<P: L1Provider + ?Sized> L1Provider for Arc<P> {
    async fn head_number(&self) -> Result<u64, L1SourceError> {
        (**self).head_number().await
    }

    async fn block_ref_by_number(&self, number: u64) -> Result<L1BlockRef, L1SourceError> {
        (**self).block_ref_by_number(number).await
    }

    async fn block_ref_by_hash(&self, hash: B256) -> Result<L1BlockRef, L1SourceError> {
        (**self).block_ref_by_hash(hash).await
    }

    async fn block_info_and_txs_by_hash(
        &self,
        hash: B256,
    ) -> Result<(Sealed<Header>, Arc<Vec<RpcTransaction>>), L1SourceError> {
        (**self).block_info_and_txs_by_hash(hash).await
    }

    async fn receipts_by_hash(&self, hash: B256) -> Result<Arc<Vec<Receipt>>, L1SourceError> {
        (**self).receipts_by_hash(hash).await
    }
}

#[derive(Debug, Clone, Builder)]
pub struct L1SourceConfig {
    #[builder(into)]
    pub rpc_url: String,
    #[builder(default = Duration::from_secs(10))]
    pub timeout: Duration,
    #[builder(default = 1000)]
    pub cache_capacity: u32,
    #[builder(default)]
    pub retry: RetryConfig,
}

type Cache<V> = RwLock<LruMap<B256, V, ByLength>>;

/// [`L1Provider`] backed by an `eth_` JSON-RPC endpoint.
pub struct HttpL1Provider {
    rpc: RpcClient,
    retry: RetryConfig,
    refs: Cache<L1BlockRef>,
    blocks: Cache<(Sealed<Header>, Arc<Vec<RpcTransaction>>)>,
    receipts: Cache<Arc<Vec<Receipt>>>,
}

impl fmt::Debug for HttpL1Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpL1Provider").field("url", &self.rpc.url()).finish_non_exhaustive()
    }
}

impl HttpL1Provider {
    pub fn new(config: L1SourceConfig) -> Result<Self, L1SourceError> {
        let cap = config.cache_capacity;
        Ok(Self {
            rpc: RpcClient::new(config.rpc_url, config.timeout)?,
            retry: config.retry,
            refs: RwLock::new(LruMap::new(ByLength::new(cap))),
            blocks: RwLock::new(LruMap::new(ByLength::new(cap))),
            receipts: RwLock::new(LruMap::new(ByLength::new(cap))),
        })
    }

    async fn call<R>(&self, method: &'static str, params: serde_json::Value) -> Result<R, L1SourceError>
    where
        R: serde::de::DeserializeOwned,
    {
        (|| async { self.rpc.request::<_, R>(method, params.clone()).await })
            .retry(self.retry.backoff())
            .when(L1SourceError::is_transient)
            .notify(|err, dur| {
                debug!(target: "opcore::l1", %err, delay = ?dur, method, "retrying L1 request");
            })
            .await
    }

    async fn cache_ref(&self, r: &L1BlockRef) {
        self.refs.write().await.insert(r.hash, r.clone());
    }
}

#[async_trait]
impl L1Provider for HttpL1Provider {
    async fn head_number(&self) -> Result<u64, L1SourceError> {
        let n: alloy_primitives::U64 = self.call("eth_blockNumber", serde_json::json!([])).await?;
        Ok(n.to())
    }

    async fn block_ref_by_number(&self, number: u64) -> Result<L1BlockRef, L1SourceError> {
        let header: RpcHeader = self
            .call("eth_getBlockByNumber", serde_json::json!([quantity(number), false]))
            .await?;
        let r = header.block_ref();
        self.cache_ref(&r).await;
        Ok(r)
    }

    async fn block_ref_by_hash(&self, hash: B256) -> Result<L1BlockRef, L1SourceError> {
        if let Some(r) = self.refs.write().await.get(&hash) {
            return Ok(r.clone());
        }
        let header: RpcHeader =
            self.call("eth_getBlockByHash", serde_json::json!([hash, false])).await?;
        let r = header.block_ref();
        self.cache_ref(&r).await;
        Ok(r)
    }

    async fn block_info_and_txs_by_hash(
        &self,
        hash: B256,
    ) -> Result<(Sealed<Header>, Arc<Vec<RpcTransaction>>), L1SourceError> {
        if let Some(hit) = self.blocks.write().await.get(&hash) {
            return Ok(hit.clone());
        }
        let block: RpcBlock =
            self.call("eth_getBlockByHash", serde_json::json!([hash, true])).await?;
        if block.hash != hash {
            return Err(L1SourceError::Decode(format!(
                "requested block {hash}, node returned {}",
                block.hash
            )));
        }
        self.cache_ref(&block.block_ref()).await;
        let entry = (block.sealed_header(), Arc::new(block.transactions));
        self.blocks.write().await.insert(hash, entry.clone());
        Ok(entry)
    }

    async fn receipts_by_hash(&self, hash: B256) -> Result<Arc<Vec<Receipt>>, L1SourceError> {
        if let Some(hit) = self.receipts.write().await.get(&hash) {
            return Ok(hit.clone());
        }
        let raw: Vec<RpcReceipt> =
            self.call("eth_getBlockReceipts", serde_json::json!([hash])).await?;
        let receipts = Arc::new(raw.into_iter().map(Receipt::from).collect::<Vec<_>>());
        self.receipts.write().await.insert(hash, receipts.clone());
        Ok(receipts)
    }
}
