//! Beacon API blob fetcher with KZG verification and LRU caching.

use std::{sync::Arc, time::Duration};

use alloy_eips::eip4844::{
    env_settings::EnvKzgSettings, kzg_to_versioned_hash, Blob, BlobTransactionSidecar,
};
use alloy_primitives::B256;
use alloy_rpc_types_beacon::sidecar::{BeaconBlobBundle, BlobData};
use async_trait::async_trait;
use reqwest::Client;
use schnellru::{ByLength, LruMap};
use serde::Deserialize;
use tokio::sync::{OnceCell, RwLock};
use tracing::debug;

use opcore_types::L1BlockRef;

use super::L1SourceError;

/// Cache key for blobs: (slot, versioned_hash).
type BlobCacheKey = (u64, B256);

/// Source of blob payloads referenced by L1 blob transactions.
#[async_trait]
pub trait BlobProvider: Send + Sync {
    /// Fetch the blobs with the given versioned hashes, in the same order.
    async fn get_blobs(
        &self,
        block: &L1BlockRef,
        hashes: &[B256],
    ) -> Result<Vec<Box<Blob>>, L1SourceError>;
}

#[derive(Deserialize)]
struct Data<T> {
    data: T,
}

#[derive(Deserialize)]
struct Genesis {
    #[serde(with = "alloy_serde::displayfromstr")]
    genesis_time: u64,
}

#[derive(Deserialize)]
struct Spec {
    #[serde(rename = "SECONDS_PER_SLOT", with = "alloy_serde::displayfromstr")]
    seconds_per_slot: u64,
}

/// Fetches blobs from the Beacon API with LRU caching.
pub struct BeaconClient {
    client: Client,
    beacon_url: String,
    /// `(genesis_time, seconds_per_slot)`, fetched once.
    timing: OnceCell<(u64, u64)>,
    cache: Arc<RwLock<LruMap<BlobCacheKey, Box<Blob>, ByLength>>>,
}

impl BeaconClient {
    /// * `beacon_url` - Base URL for the Beacon API (e.g., "https://beacon.example.com")
    /// * `cache_capacity` - Maximum number of blobs to cache
    pub fn new(beacon_url: impl Into<String>, cache_capacity: u32) -> Result<Self, L1SourceError> {
        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(30)).build()?,
            beacon_url: beacon_url.into().trim_end_matches('/').to_string(),
            timing: OnceCell::new(),
            cache: Arc::new(RwLock::new(LruMap::new(ByLength::new(cache_capacity)))),
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, L1SourceError> {
        let url = format!("{}{}", self.beacon_url, path);
        let response =
            self.client.get(&url).send().await.map_err(|e| L1SourceError::Beacon(e.to_string()))?;
        if !response.status().is_success() {
            return Err(L1SourceError::Beacon(format!("{path} returned {}", response.status())));
        }
        response.json().await.map_err(|e| L1SourceError::Beacon(e.to_string()))
    }

    async fn timing(&self) -> Result<(u64, u64), L1SourceError> {
        self.timing
            .get_or_try_init(|| async {
                let genesis: Data<Genesis> = self.get("/eth/v1/beacon/genesis").await?;
                let spec: Data<Spec> = self.get("/eth/v1/config/spec").await?;
                Ok((genesis.data.genesis_time, spec.data.seconds_per_slot))
            })
            .await
            .copied()
    }

    /// Beacon slot of the L1 block with the given timestamp.
    pub async fn slot(&self, timestamp: u64) -> Result<u64, L1SourceError> {
        let (genesis, per_slot) = self.timing().await?;
        slot_at(timestamp, genesis, per_slot)
    }

    /// Fetch all sidecars for a slot.
    pub async fn sidecars(&self, slot: u64) -> Result<Vec<BlobData>, L1SourceError> {
        let bundle: BeaconBlobBundle =
            self.get(&format!("/eth/v1/beacon/blob_sidecars/{slot}")).await?;
        Ok(bundle.data)
    }
}

#[async_trait]
impl BlobProvider for BeaconClient {
    async fn get_blobs(
        &self,
        block: &L1BlockRef,
        hashes: &[B256],
    ) -> Result<Vec<Box<Blob>>, L1SourceError> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let slot = self.slot(block.timestamp).await?;

        {
            let mut cache = self.cache.write().await;
            let hits: Option<Vec<_>> =
                hashes.iter().map(|h| cache.get(&(slot, *h)).cloned()).collect();
            if let Some(blobs) = hits {
                return Ok(blobs);
            }
        }

        let sidecars = self.sidecars(slot).await?;
        let mut out = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let sidecar = sidecars
                .iter()
                .find(|s| kzg_to_versioned_hash(s.kzg_commitment.as_slice()) == *hash)
                .ok_or_else(|| L1SourceError::BlobNotFound(slot, hash.to_string()))?;
            verify_sidecar(sidecar, *hash)?;
            out.push(sidecar.blob.clone());
        }
        debug!(target: "opcore::l1", slot, blobs = out.len(), "fetched blob sidecars");

        let mut cache = self.cache.write().await;
        for (hash, blob) in hashes.iter().zip(&out) {
            cache.insert((slot, *hash), blob.clone());
        }
        Ok(out)
    }
}

fn slot_at(timestamp: u64, genesis: u64, per_slot: u64) -> Result<u64, L1SourceError> {
    if per_slot == 0 || timestamp < genesis {
        return Err(L1SourceError::Beacon(format!(
            "timestamp {timestamp} precedes beacon genesis {genesis}"
        )));
    }
    Ok((timestamp - genesis) / per_slot)
}

/// Check a sidecar's KZG proof against the versioned hash the transaction commits to.
pub fn verify_sidecar(sidecar: &BlobData, versioned_hash: B256) -> Result<(), L1SourceError> {
    let single = BlobTransactionSidecar {
        blobs: vec![*sidecar.blob.clone()],
        commitments: vec![sidecar.kzg_commitment],
        proofs: vec![sidecar.kzg_proof],
    };
    single
        .validate(&[versioned_hash], EnvKzgSettings::Default.get())
        .map_err(|e| L1SourceError::Kzg(e.to_string()))
}
