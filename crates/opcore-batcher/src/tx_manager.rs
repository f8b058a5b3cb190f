//! Sending batcher transactions to L1 and seeing them included.
//!
//! [`TxManager::send`] signs and publishes one candidate, polls for its receipt and, when it is
//! not included within the resubmission timeout, republishes it with the same nonce and bumped
//! fees. Signing and chain access sit behind the [`Transactor`] trait.

use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use alloy_consensus::{
    Signed, TxEip1559, TxEip4844, TxEip4844Variant, TxEip4844WithSidecar, TxEnvelope,
};
use alloy_eips::{
    eip2718::{Decodable2718, Encodable2718},
    eip4844::{Blob, BlobTransactionSidecar},
};
use alloy_primitives::{Address, Bytes, TxKind, B256, U128, U256, U64};
use async_trait::async_trait;
use bon::Builder;
use opcore_stream::{L1SourceError, RpcClient, RpcHeader};
use opcore_types::BlockId;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const GWEI: u128 = 1_000_000_000;

/// Priority fee of every first attempt, whatever the market pays.
pub const GAS_TIP_CAP: u128 = 2 * GWEI;

/// Base cost of every transaction.
pub const TX_GAS: u64 = 21_000;

#[derive(Debug, thiserror::Error)]
pub enum TxManagerError {
    #[error("send canceled")]
    Canceled,
    #[error("transaction not confirmed within {0:?}")]
    Timeout(Duration),
    #[error("fee cap {fee_cap} exceeds the limit {limit}")]
    FeeLimitReached { fee_cap: u128, limit: u128 },
    #[error("L1 has no blob base fee, cannot price a blob transaction")]
    MissingBlobFee,
    #[error("blob sidecar: {0}")]
    Sidecar(String),
    #[error("signer: {0}")]
    Signer(String),
    #[error(transparent)]
    Rpc(#[from] L1SourceError),
}

/// What to send: calldata or blobs, to a fixed recipient.
#[derive(Debug, Clone, Default)]
pub struct TxCandidate {
    pub to: Address,
    pub data: Bytes,
    pub blobs: Vec<Box<Blob>>,
    /// Wei sent along, e.g. a dispute game bond.
    pub value: U256,
    /// Overrides the intrinsic gas estimate.
    pub gas_limit: Option<u64>,
}

impl TxCandidate {
    pub fn is_blob(&self) -> bool {
        !self.blobs.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub block: BlockId,
    pub gas_used: u64,
    pub success: bool,
}

/// L1 fee market at the head.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeeInfo {
    pub base_fee: u128,
    /// `None` before Cancun.
    pub blob_base_fee: Option<u128>,
}

/// Fees of one publication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fees {
    pub tip: u128,
    pub fee_cap: u128,
    pub blob_fee_cap: Option<u128>,
}

/// A transaction ready for signing.
#[derive(Debug, Clone)]
pub enum UnsignedTx {
    Eip1559(TxEip1559),
    Eip4844(TxEip4844, BlobTransactionSidecar),
}

impl UnsignedTx {
    pub fn nonce(&self) -> u64 {
        match self {
            Self::Eip1559(tx) => tx.nonce,
            Self::Eip4844(tx, _) => tx.nonce,
        }
    }

    pub fn fee_cap(&self) -> u128 {
        match self {
            Self::Eip1559(tx) => tx.max_fee_per_gas,
            Self::Eip4844(tx, _) => tx.max_fee_per_gas,
        }
    }
}

/// Signing and L1 access for the [`TxManager`].
#[async_trait]
pub trait Transactor: Send + Sync {
    fn sender(&self) -> Address;

    fn chain_id(&self) -> u64;

    async fn pending_nonce(&self) -> Result<u64, L1SourceError>;

    async fn fee_info(&self) -> Result<FeeInfo, L1SourceError>;

    async fn head_number(&self) -> Result<u64, L1SourceError>;

    /// Sign and broadcast, returning the transaction hash.
    async fn publish(&self, tx: UnsignedTx) -> Result<B256, TxManagerError>;

    async fn receipt(&self, hash: B256) -> Result<Option<TxReceipt>, L1SourceError>;
}

#[async_trait]
impl<T: Transactor + ?Sized> Transactor for Arc<T> {
    fn sender(&self) -> Address {
        (**self).sender()
    }

    fn chain_id(&self) -> u64 {
        (**self).chain_id()
    }

    async fn pending_nonce(&self) -> Result<u64, L1SourceError> {
        (**self).pending_nonce().await
    }

    async fn fee_info(&self) -> Result<FeeInfo, L1SourceError> {
        (**self).fee_info().await
    }

    async fn head_number(&self) -> Result<u64, L1SourceError> {
        (**self).head_number().await
    }

    async fn publish(&self, tx: UnsignedTx) -> Result<B256, TxManagerError> {
        (**self).publish(tx).await
    }

    async fn receipt(&self, hash: B256) -> Result<Option<TxReceipt>, L1SourceError> {
        (**self).receipt(hash).await
    }
}

#[derive(Debug, Clone, Builder)]
pub struct TxManagerConfig {
    /// Blocks, the inclusion block counting as one.
    #[builder(default = 1)]
    pub num_confirmations: u64,
    #[builder(default = Duration::from_secs(48))]
    pub resubmission_timeout: Duration,
    #[builder(default = Duration::from_secs(12))]
    pub receipt_query_interval: Duration,
    /// Give up on a candidate after this long.
    #[builder(default = Duration::from_secs(600))]
    pub send_timeout: Duration,
    #[builder(default = GAS_TIP_CAP)]
    pub tip_cap: u128,
    #[builder(default = GWEI)]
    pub min_blob_fee: u128,
    /// Bumped fees may not exceed this multiple of the current market fees.
    #[builder(default = 5)]
    pub fee_limit_multiplier: u128,
}

impl Default for TxManagerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Gas charged for `data` before execution: the larger of the EIP-2028 cost and the EIP-7623
/// calldata floor.
pub fn intrinsic_gas(data: &[u8]) -> u64 {
    let zero = data.iter().filter(|b| **b == 0).count() as u64;
    let non_zero = data.len() as u64 - zero;
    let standard = TX_GAS + 4 * zero + 16 * non_zero;
    let floor = TX_GAS + 10 * (zero + 4 * non_zero);
    standard.max(floor)
}

/// Fees for a first attempt: the fixed tip on top of twice the parent base fee.
pub fn initial_fees(info: &FeeInfo, config: &TxManagerConfig) -> Fees {
    let tip = config.tip_cap;
    Fees {
        tip,
        fee_cap: tip + 2 * info.base_fee,
        blob_fee_cap: info.blob_base_fee.map(|fee| (2 * fee).max(config.min_blob_fee)),
    }
}

#[inline]
const fn bump(value: u128, percent: u128) -> u128 {
    (value * (100 + percent)).div_ceil(100)
}

/// Fees for a replacement: at least the replacement minimum over `old` (10% for calldata, 100%
/// for blob transactions), and never below what the market asks now.
pub fn bump_fees(old: Fees, market: Fees, is_blob: bool) -> Fees {
    let percent = if is_blob { 100 } else { 10 };
    let tip = bump(old.tip, percent).max(market.tip);
    let fee_cap = bump(old.fee_cap, percent).max(market.fee_cap).max(tip);
    let blob_fee_cap = match (old.blob_fee_cap, market.blob_fee_cap) {
        (Some(old), Some(new)) => Some(bump(old, percent).max(new)),
        (old, new) => new.or(old),
    };
    Fees { tip, fee_cap, blob_fee_cap }
}

/// Sends candidates one nonce after the other.
pub struct TxManager<T> {
    config: TxManagerConfig,
    transactor: T,
    nonce: Mutex<Option<u64>>,
}

impl<T: Transactor> TxManager<T> {
    pub fn new(config: TxManagerConfig, transactor: T) -> Self {
        Self { config, transactor, nonce: Mutex::new(None) }
    }

    pub fn config(&self) -> &TxManagerConfig {
        &self.config
    }

    pub fn transactor(&self) -> &T {
        &self.transactor
    }

    async fn next_nonce(&self) -> Result<u64, TxManagerError> {
        let mut guard = self.nonce.lock().await;
        let nonce = match *guard {
            Some(n) => n,
            None => self.transactor.pending_nonce().await?,
        };
        *guard = Some(nonce + 1);
        Ok(nonce)
    }

    /// Forget the local nonce; the next send asks the node again.
    async fn reset_nonce(&self) {
        *self.nonce.lock().await = None;
    }

    async fn market_fees(&self) -> Result<Fees, TxManagerError> {
        let info = self.transactor.fee_info().await?;
        Ok(initial_fees(&info, &self.config))
    }

    /// Publish `candidate` and wait until it has the configured confirmations.
    ///
    /// A receipt with a failed status is still returned; the caller decides what a revert means.
    pub async fn send(
        &self,
        candidate: TxCandidate,
        cancel: &CancellationToken,
    ) -> Result<TxReceipt, TxManagerError> {
        let result = self.send_inner(candidate, cancel).await;
        if result.is_err() {
            self.reset_nonce().await;
        }
        result
    }

    async fn send_inner(
        &self,
        candidate: TxCandidate,
        cancel: &CancellationToken,
    ) -> Result<TxReceipt, TxManagerError> {
        let sidecar = if candidate.is_blob() {
            let blobs = candidate.blobs.iter().map(|b| **b).collect();
            Some(
                BlobTransactionSidecar::try_from_blobs(blobs)
                    .map_err(|e| TxManagerError::Sidecar(e.to_string()))?,
            )
        } else {
            None
        };
        let gas_limit = candidate.gas_limit.unwrap_or_else(|| intrinsic_gas(&candidate.data));
        let nonce = self.next_nonce().await?;
        let deadline = Instant::now() + self.config.send_timeout;

        let mut fees = self.market_fees().await?;
        let mut sent = Vec::new();
        loop {
            let tx = self.build_tx(&candidate, sidecar.as_ref(), nonce, gas_limit, fees)?;
            match self.transactor.publish(tx).await {
                Ok(hash) => {
                    info!(
                        target: "opcore::batcher",
                        %hash,
                        nonce,
                        tip = fees.tip,
                        fee_cap = fees.fee_cap,
                        blob_fee_cap = ?fees.blob_fee_cap,
                        "published transaction"
                    );
                    sent.push(hash);
                }
                // A replacement can be refused while an earlier attempt is still in flight.
                Err(err) if !sent.is_empty() => {
                    warn!(target: "opcore::batcher", nonce, %err, "replacement not accepted");
                }
                Err(err) => return Err(err),
            }

            let resubmit_at = Instant::now() + self.config.resubmission_timeout;
            loop {
                if let Some(receipt) = self.confirmed_receipt(&sent).await? {
                    return Ok(receipt);
                }
                let now = Instant::now();
                if now >= deadline {
                    return Err(TxManagerError::Timeout(self.config.send_timeout));
                }
                if now >= resubmit_at {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TxManagerError::Canceled),
                    _ = tokio::time::sleep(self.config.receipt_query_interval) => {}
                }
            }

            let market = self.market_fees().await?;
            fees = bump_fees(fees, market, candidate.is_blob());
            let limit = market.fee_cap * self.config.fee_limit_multiplier;
            if fees.fee_cap > limit {
                return Err(TxManagerError::FeeLimitReached { fee_cap: fees.fee_cap, limit });
            }
            debug!(target: "opcore::batcher", nonce, fee_cap = fees.fee_cap, "bumping fees");
        }
    }

    /// The receipt of any published attempt, once it has enough confirmations.
    async fn confirmed_receipt(&self, sent: &[B256]) -> Result<Option<TxReceipt>, TxManagerError> {
        for hash in sent.iter().rev() {
            let Some(receipt) = self.transactor.receipt(*hash).await? else { continue };
            let head = self.transactor.head_number().await?;
            let confirmations = (head + 1).saturating_sub(receipt.block.number);
            if confirmations >= self.config.num_confirmations {
                return Ok(Some(receipt));
            }
            debug!(
                target: "opcore::batcher",
                %hash,
                confirmations,
                needed = self.config.num_confirmations,
                "waiting for confirmations"
            );
        }
        Ok(None)
    }

    fn build_tx(
        &self,
        candidate: &TxCandidate,
        sidecar: Option<&BlobTransactionSidecar>,
        nonce: u64,
        gas_limit: u64,
        fees: Fees,
    ) -> Result<UnsignedTx, TxManagerError> {
        let chain_id = self.transactor.chain_id();
        let Some(sidecar) = sidecar else {
            return Ok(UnsignedTx::Eip1559(TxEip1559 {
                chain_id,
                nonce,
                gas_limit,
                max_fee_per_gas: fees.fee_cap,
                max_priority_fee_per_gas: fees.tip,
                to: TxKind::Call(candidate.to),
                value: candidate.value,
                input: candidate.data.clone(),
                ..Default::default()
            }));
        };
        let max_fee_per_blob_gas = fees.blob_fee_cap.ok_or(TxManagerError::MissingBlobFee)?;
        let tx = TxEip4844 {
            chain_id,
            nonce,
            gas_limit,
            max_fee_per_gas: fees.fee_cap,
            max_priority_fee_per_gas: fees.tip,
            to: candidate.to,
            value: candidate.value,
            blob_versioned_hashes: sidecar.versioned_hashes().collect(),
            max_fee_per_blob_gas,
            input: candidate.data.clone(),
            ..Default::default()
        };
        Ok(UnsignedTx::Eip4844(tx, sidecar.clone()))
    }
}

/// Where the remote signer lives and how to authenticate to it.
#[derive(Debug, Clone, Builder)]
pub struct SignerConfig {
    #[builder(into)]
    pub endpoint: String,
    /// The batcher account the signer signs for.
    pub address: Address,
    pub tls_ca: Option<PathBuf>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    #[builder(default = Duration::from_secs(10))]
    pub timeout: Duration,
}

impl SignerConfig {
    fn client(&self) -> Result<RpcClient, TxManagerError> {
        let read = |path: &PathBuf| {
            std::fs::read(path)
                .map_err(|e| TxManagerError::Signer(format!("reading {}: {e}", path.display())))
        };
        let mut builder = reqwest::Client::builder().timeout(self.timeout);
        if let Some(ca) = &self.tls_ca {
            let cert = reqwest::Certificate::from_pem(&read(ca)?)
                .map_err(|e| TxManagerError::Signer(e.to_string()))?;
            builder = builder.add_root_certificate(cert);
        }
        if let (Some(cert), Some(key)) = (&self.tls_cert, &self.tls_key) {
            let mut pem = read(cert)?;
            pem.extend(read(key)?);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| TxManagerError::Signer(e.to_string()))?;
            builder = builder.identity(identity);
        }
        let client = builder.build().map_err(|e| TxManagerError::Signer(e.to_string()))?;
        Ok(RpcClient::from_client(client, self.endpoint.clone()))
    }
}

/// `eth_signTransaction` arguments, as remote signers take them.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignArgs {
    from: Address,
    to: Address,
    gas: U64,
    max_fee_per_gas: U128,
    max_priority_fee_per_gas: U128,
    value: U256,
    nonce: U64,
    chain_id: U64,
    data: Bytes,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_fee_per_blob_gas: Option<U128>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    blob_versioned_hashes: Vec<B256>,
}

impl SignArgs {
    fn new(from: Address, tx: &UnsignedTx) -> Self {
        match tx {
            UnsignedTx::Eip1559(tx) => Self {
                from,
                to: tx.to.to().copied().unwrap_or_default(),
                gas: U64::from(tx.gas_limit),
                max_fee_per_gas: U128::from(tx.max_fee_per_gas),
                max_priority_fee_per_gas: U128::from(tx.max_priority_fee_per_gas),
                value: tx.value,
                nonce: U64::from(tx.nonce),
                chain_id: U64::from(tx.chain_id),
                data: tx.input.clone(),
                max_fee_per_blob_gas: None,
                blob_versioned_hashes: Vec::new(),
            },
            UnsignedTx::Eip4844(tx, _) => Self {
                from,
                to: tx.to,
                gas: U64::from(tx.gas_limit),
                max_fee_per_gas: U128::from(tx.max_fee_per_gas),
                max_priority_fee_per_gas: U128::from(tx.max_priority_fee_per_gas),
                value: tx.value,
                nonce: U64::from(tx.nonce),
                chain_id: U64::from(tx.chain_id),
                data: tx.input.clone(),
                max_fee_per_blob_gas: Some(U128::from(tx.max_fee_per_blob_gas)),
                blob_versioned_hashes: tx.blob_versioned_hashes.clone(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTxReceipt {
    transaction_hash: B256,
    block_hash: B256,
    block_number: U64,
    gas_used: U64,
    #[serde(default)]
    status: Option<U64>,
}

impl From<RpcTxReceipt> for TxReceipt {
    fn from(r: RpcTxReceipt) -> Self {
        Self {
            tx_hash: r.transaction_hash,
            block: BlockId::new(r.block_hash, r.block_number.to()),
            gas_used: r.gas_used.to(),
            success: r.status.is_none_or(|s| s == U64::from(1)),
        }
    }
}

/// [`Transactor`] over L1 JSON-RPC, signing through a remote `eth_signTransaction` endpoint.
#[derive(Debug)]
pub struct RpcTransactor {
    l1: RpcClient,
    signer: RpcClient,
    sender: Address,
    chain_id: u64,
}

impl RpcTransactor {
    pub fn new(l1: RpcClient, signer: &SignerConfig, chain_id: u64) -> Result<Self, TxManagerError> {
        Ok(Self { l1, signer: signer.client()?, sender: signer.address, chain_id })
    }

    /// Gas `eth_estimateGas` reports for a call from the sender.
    pub async fn estimate_gas(&self, to: Address, data: &Bytes, value: U256) -> Result<u64, L1SourceError> {
        let call = serde_json::json!({ "from": self.sender, "to": to, "data": data, "value": value });
        let gas: U64 = self.l1.request("eth_estimateGas", [call]).await?;
        Ok(gas.to())
    }

    async fn sign(&self, tx: &UnsignedTx) -> Result<Bytes, TxManagerError> {
        let args = SignArgs::new(self.sender, tx);
        let raw: Bytes = self
            .signer
            .request("eth_signTransaction", [args])
            .await
            .map_err(|e| TxManagerError::Signer(e.to_string()))?;
        match tx {
            UnsignedTx::Eip1559(_) => Ok(raw),
            UnsignedTx::Eip4844(_, sidecar) => with_sidecar(&raw, sidecar.clone()),
        }
    }
}

/// Re-encode a signed blob transaction in its network form, sidecar attached.
fn with_sidecar(raw: &[u8], sidecar: BlobTransactionSidecar) -> Result<Bytes, TxManagerError> {
    let envelope = TxEnvelope::decode_2718(&mut &raw[..])
        .map_err(|e| TxManagerError::Signer(format!("undecodable signed tx: {e}")))?;
    let TxEnvelope::Eip4844(signed) = envelope else {
        return Err(TxManagerError::Signer("signer returned a non-blob transaction".into()));
    };
    let (tx, signature, hash) = signed.into_parts();
    let tx = match tx {
        TxEip4844Variant::TxEip4844(tx) => tx,
        TxEip4844Variant::TxEip4844WithSidecar(with) => with.tx,
    };
    let variant =
        TxEip4844Variant::TxEip4844WithSidecar(TxEip4844WithSidecar::from_tx_and_sidecar(tx, sidecar));
    let envelope = TxEnvelope::Eip4844(Signed::new_unchecked(variant.into(), signature, hash));
    Ok(envelope.encoded_2718().into())
}

#[async_trait]
impl Transactor for RpcTransactor {
    fn sender(&self) -> Address {
        self.sender
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn pending_nonce(&self) -> Result<u64, L1SourceError> {
        let n: U64 = self.l1.request("eth_getTransactionCount", (self.sender, "pending")).await?;
        Ok(n.to())
    }

    async fn fee_info(&self) -> Result<FeeInfo, L1SourceError> {
        let head: RpcHeader = self.l1.request("eth_getBlockByNumber", ("latest", false)).await?;
        Ok(FeeInfo {
            base_fee: head.header.base_fee_per_gas.unwrap_or_default().into(),
            blob_base_fee: head.block_ref().blob_base_fee,
        })
    }

    async fn head_number(&self) -> Result<u64, L1SourceError> {
        let n: U64 = self.l1.request("eth_blockNumber", serde_json::json!([])).await?;
        Ok(n.to())
    }

    async fn publish(&self, tx: UnsignedTx) -> Result<B256, TxManagerError> {
        let raw = self.sign(&tx).await?;
        Ok(self.l1.request("eth_sendRawTransaction", [raw]).await?)
    }

    async fn receipt(&self, hash: B256) -> Result<Option<TxReceipt>, L1SourceError> {
        let receipt: Option<RpcTxReceipt> =
            self.l1.request_opt("eth_getTransactionReceipt", [hash]).await?;
        Ok(receipt.map(Into::into))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receipt_json_decodes() {
        let json = r#"{
            "transactionHash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "blockHash": "0x2222222222222222222222222222222222222222222222222222222222222222",
            "blockNumber": "0x10",
            "gasUsed": "0x5208",
            "status": "0x0"
        }"#;
        let receipt: TxReceipt = serde_json::from_str::<RpcTxReceipt>(json).unwrap().into();
        assert_eq!(receipt.block, BlockId::new(B256::repeat_byte(0x22), 16));
        assert_eq!(receipt.gas_used, 21_000);
        assert!(!receipt.success);
    }

    #[test]
    fn test_sign_args_use_hex_quantities() {
        let tx = UnsignedTx::Eip1559(TxEip1559 {
            chain_id: 1,
            nonce: 5,
            gas_limit: 21_000,
            max_fee_per_gas: 10,
            max_priority_fee_per_gas: 2,
            to: TxKind::Call(Address::repeat_byte(0x10)),
            ..Default::default()
        });
        let json = serde_json::to_value(SignArgs::new(Address::repeat_byte(0x01), &tx)).unwrap();
        assert_eq!(json["nonce"], "0x5");
        assert_eq!(json["gas"], "0x5208");
        assert_eq!(json["maxFeePerGas"], "0xa");
        assert!(json.get("blobVersionedHashes").is_none());
    }
}
