//! Where a running program gets its preimages from.
//!
//! The VM steps synchronously, so it talks to an async [`OracleServer`] through a channel and
//! blocks on the reply. Hints are forwarded as they complete.

use std::{collections::HashMap, fmt, sync::Arc};

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use backon::Retryable;
use opcore_stream::RetryConfig;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    key::PreimageKey,
    oracle::{run_precompile, OracleError, OracleUpdate},
};

/// Synchronous preimage access for the VM.
pub trait PreimageSource: Send {
    fn hint(&mut self, hint: &[u8]);

    fn get(&mut self, key: PreimageKey) -> Result<Vec<u8>, OracleError>;

    /// How to load `key` into the on-chain oracle, if known.
    fn oracle_update(&self, _key: PreimageKey) -> Option<OracleUpdate> {
        None
    }
}

/// Asynchronous preimage backend behind an [`OracleServer`].
#[async_trait]
pub trait PreimageFetcher: Send + Sync {
    async fn hint(&self, hint: &[u8]) -> Result<(), OracleError>;

    async fn fetch(&self, key: PreimageKey) -> Result<Vec<u8>, OracleError>;
}

#[async_trait]
impl<F: PreimageFetcher + ?Sized> PreimageFetcher for Arc<F> {
    async fn hint(&self, hint: &[u8]) -> Result<(), OracleError> {
        (**self).hint(hint).await
    }

    async fn fetch(&self, key: PreimageKey) -> Result<Vec<u8>, OracleError> {
        (**self).fetch(key).await
    }
}

#[derive(Debug, Clone)]
struct Stored {
    value: Vec<u8>,
    update: OracleUpdate,
}

/// In-memory key-value store of preimages, remembering how each one is loaded on chain.
#[derive(Debug, Clone, Default)]
pub struct PreimageStore {
    entries: HashMap<PreimageKey, Stored>,
    hints: Vec<Vec<u8>>,
}

impl PreimageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_keccak256(&mut self, preimage: &[u8]) -> PreimageKey {
        let key = PreimageKey::keccak256(preimage);
        self.insert(key, preimage.to_vec(), OracleUpdate::Keccak256(preimage.to_vec()));
        key
    }

    pub fn insert_sha256(&mut self, preimage: &[u8]) -> PreimageKey {
        let key = PreimageKey::sha256(preimage);
        self.insert(key, preimage.to_vec(), OracleUpdate::Sha256(preimage.to_vec()));
        key
    }

    /// Local input `ident`, keyed the way the program asks for it.
    pub fn insert_local(&mut self, ident: u64, value: &[u8]) -> PreimageKey {
        let key = PreimageKey::local(ident);
        self.insert(key, value.to_vec(), OracleUpdate::Local { ident });
        key
    }

    pub fn insert_blob(&mut self, commitment: &[u8], z: B256, y: B256, proof: &[u8]) -> PreimageKey {
        let key = PreimageKey::blob(commitment, z);
        let update =
            OracleUpdate::Blob { z, y, commitment: commitment.to_vec(), proof: proof.to_vec() };
        self.insert(key, y.to_vec(), update);
        key
    }

    pub fn insert_precompile(
        &mut self,
        address: Address,
        required_gas: u64,
        input: &[u8],
    ) -> Result<PreimageKey, OracleError> {
        let key = PreimageKey::precompile(address, required_gas, input);
        let value = run_precompile(address, input)?;
        let update = OracleUpdate::Precompile { address, required_gas, input: input.to_vec() };
        self.insert(key, value, update);
        Ok(key)
    }

    fn insert(&mut self, key: PreimageKey, value: Vec<u8>, update: OracleUpdate) {
        self.entries.insert(key, Stored { value, update });
    }

    pub fn lookup(&self, key: PreimageKey) -> Result<Vec<u8>, OracleError> {
        self.entries.get(&key).map(|s| s.value.clone()).ok_or(OracleError::NotFound(key))
    }

    pub fn hints(&self) -> &[Vec<u8>] {
        &self.hints
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PreimageSource for PreimageStore {
    fn hint(&mut self, hint: &[u8]) {
        self.hints.push(hint.to_vec());
    }

    fn get(&mut self, key: PreimageKey) -> Result<Vec<u8>, OracleError> {
        self.lookup(key)
    }

    fn oracle_update(&self, key: PreimageKey) -> Option<OracleUpdate> {
        self.entries.get(&key).map(|s| s.update.clone())
    }
}

/// A [`PreimageStore`] shared with an async server.
#[async_trait]
impl PreimageFetcher for RwLock<PreimageStore> {
    async fn hint(&self, hint: &[u8]) -> Result<(), OracleError> {
        self.write().await.hints.push(hint.to_vec());
        Ok(())
    }

    async fn fetch(&self, key: PreimageKey) -> Result<Vec<u8>, OracleError> {
        self.read().await.lookup(key)
    }
}

pub enum OracleRequest {
    Hint(Vec<u8>),
    Get(PreimageKey, oneshot::Sender<Result<Vec<u8>, OracleError>>),
}

impl fmt::Debug for OracleRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hint(hint) => f.debug_tuple("Hint").field(&hint.len()).finish(),
            Self::Get(key, _) => f.debug_tuple("Get").field(key).finish(),
        }
    }
}

/// Blocking end of the oracle channel. Caches the last preimage, which the program reads one
/// word at a time.
#[derive(Debug)]
pub struct OracleClient {
    requests: mpsc::Sender<OracleRequest>,
    last: Option<(PreimageKey, Vec<u8>)>,
}

pub fn oracle_channel(buffer: usize) -> (OracleClient, mpsc::Receiver<OracleRequest>) {
    let (tx, rx) = mpsc::channel(buffer);
    (OracleClient { requests: tx, last: None }, rx)
}

impl PreimageSource for OracleClient {
    fn hint(&mut self, hint: &[u8]) {
        if self.requests.blocking_send(OracleRequest::Hint(hint.to_vec())).is_err() {
            warn!(target: "opcore::dispute", "preimage server gone, dropping hint");
        }
    }

    fn get(&mut self, key: PreimageKey) -> Result<Vec<u8>, OracleError> {
        if let Some((cached, value)) = &self.last {
            if *cached == key {
                return Ok(value.clone());
            }
        }
        let (tx, rx) = oneshot::channel();
        self.requests
            .blocking_send(OracleRequest::Get(key, tx))
            .map_err(|_| OracleError::ChannelClosed)?;
        let value = rx.blocking_recv().map_err(|_| OracleError::ChannelClosed)??;
        self.last = Some((key, value.clone()));
        Ok(value)
    }
}

/// Serves [`OracleRequest`]s from a [`PreimageFetcher`], retrying fetches that may succeed later.
#[derive(Debug)]
pub struct OracleServer<F> {
    fetcher: F,
    retry: RetryConfig,
}

impl<F: PreimageFetcher> OracleServer<F> {
    pub fn new(fetcher: F, retry: RetryConfig) -> Self {
        Self { fetcher, retry }
    }

    pub async fn serve(&self, mut requests: mpsc::Receiver<OracleRequest>, cancel: CancellationToken) {
        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => return,
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => return,
                },
            };
            match request {
                OracleRequest::Hint(hint) => {
                    if let Err(err) = self.fetcher.hint(&hint).await {
                        warn!(target: "opcore::dispute", %err, "hint failed");
                    }
                }
                OracleRequest::Get(key, reply) => {
                    let result = self.fetch(key).await;
                    // The VM may have been dropped mid-step.
                    let _ = reply.send(result);
                }
            }
        }
    }

    async fn fetch(&self, key: PreimageKey) -> Result<Vec<u8>, OracleError> {
        (|| async { self.fetcher.fetch(key).await })
            .retry(self.retry.backoff())
            .when(OracleError::is_transient)
            .notify(|err, dur| {
                debug!(
                    target: "opcore::dispute",
                    %err,
                    delay = ?dur,
                    key_type = ?key.key_type().ok(),
                    "retrying preimage fetch"
                );
            })
            .await
    }
}
