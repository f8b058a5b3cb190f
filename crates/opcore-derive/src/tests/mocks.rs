//! In-memory L1, L2, blob and engine sources for derivation tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use alloy_consensus::{
    Block, BlockBody, Header, Receipt, SignableTransaction, TxEip1559, TxEnvelope,
};
use alloy_eips::{
    eip2718::{Decodable2718, Encodable2718},
    eip4844::Blob,
};
use alloy_primitives::{
    address, keccak256, Address, Bytes, Sealed, Signature, TxKind, B256, B64, U256,
};
use async_trait::async_trait;
use op_alloy_consensus::OpTxEnvelope;
use opcore_pipeline::{
    config::ChainGenesis, encode_frames, Batch, CompressionAlgo, Frame, GenesisSystemConfig,
    Hardfork, L1BlockInfo, RollupConfig, SingleBatch, SystemConfig,
};
use opcore_stream::{
    BlobProvider, EngineApi, EngineVersion, L1Provider, L1SourceError, L2Block, L2Provider,
    RpcTransaction,
};
use opcore_types::{
    BlockId, ExecutionPayload, ExecutionPayloadEnvelope, ForkchoiceState, ForkchoiceUpdated,
    L1BlockRef, L2BlockRef, PayloadAttributes, PayloadStatus, PayloadStatusKind,
};

pub const BATCHER: Address = address!("6887246668a3b87F54DeB3b94Ba47a6f63F32985");
pub const INBOX: Address = address!("ff00000000000000000000000000000000000010");
pub const L1_BLOCK_TIME: u64 = 12;

/// Bedrock chain with 2s L2 blocks anchored at L1 block 0 / L2 block 0.
pub fn mock_config() -> RollupConfig {
    RollupConfig {
        genesis: ChainGenesis {
            l1: BlockId::new(l1_hash(0), 0),
            l2: BlockId::new(l2_hash(0), 0),
            l2_time: 0,
            system_config: Some(GenesisSystemConfig {
                batcher_addr: BATCHER,
                gas_limit: 30_000_000,
                ..Default::default()
            }),
        },
        block_time: 2,
        max_sequencer_drift: 600,
        seq_window_size: 100,
        channel_timeout: 30,
        l1_chain_id: 1,
        l2_chain_id: 10,
        regolith_time: Some(0),
        batch_inbox_address: INBOX,
        ..Default::default()
    }
}

pub fn genesis_system_config(cfg: &RollupConfig) -> SystemConfig {
    cfg.genesis.system_config.as_ref().map(SystemConfig::from).unwrap_or_default()
}

pub fn l1_hash(number: u64) -> B256 {
    keccak256(number.to_be_bytes())
}

pub fn l2_hash(number: u64) -> B256 {
    keccak256([b"l2".as_slice(), &number.to_be_bytes()].concat())
}

pub fn l1_ref(number: u64) -> L1BlockRef {
    L1BlockRef {
        hash: l1_hash(number),
        number,
        parent_hash: l1_hash(number.wrapping_sub(1)),
        timestamp: number * L1_BLOCK_TIME,
        ..Default::default()
    }
}

/// L2 block `number` with deterministic hashes, as the engine would report after deriving it.
pub fn l2_ref(number: u64, epoch: u64, sequence_number: u64) -> L2BlockRef {
    L2BlockRef {
        hash: l2_hash(number),
        number,
        parent_hash: l2_hash(number.wrapping_sub(1)),
        timestamp: number * 2,
        l1_origin: BlockId::new(l1_hash(epoch), epoch),
        sequence_number,
    }
}

/// A batch for L2 block `number` on top of [`l2_ref`]`(number - 1)`.
pub fn batch(number: u64, epoch: u64) -> SingleBatch {
    SingleBatch {
        parent_hash: l2_hash(number - 1),
        epoch_num: epoch,
        epoch_hash: l1_hash(epoch),
        timestamp: number * 2,
        transactions: vec![Bytes::from(vec![0x02, number as u8, 0xaa, 0xbb])],
    }
}

/// One frame carrying a zlib channel with `batches`, prefixed with the derivation version byte.
pub fn channel_payload(id: u8, batches: &[SingleBatch], cfg: &RollupConfig) -> Bytes {
    let mut raw = Vec::new();
    for b in batches {
        raw.extend(Batch::Single(b.clone()).encode_for_channel(cfg).unwrap());
    }
    let data = CompressionAlgo::Zlib.compress(&raw).unwrap();
    let frame = Frame { id: [id; 16], number: 0, data, is_last: true };
    encode_frames(&[frame]).unwrap().into()
}

/// L1 info deposit for an L2 block with the given origin, Bedrock format.
pub fn l1_info_tx(epoch: u64, sequence_number: u64) -> Bytes {
    let origin = l1_ref(epoch);
    L1BlockInfo::new(
        epoch,
        origin.timestamp,
        U256::from(7u64),
        origin.hash,
        sequence_number,
        BATCHER,
        U256::from(1u64),
        0,
        0,
    )
    .with_bedrock_fees(U256::ZERO, U256::ZERO)
    .to_deposit_tx(Hardfork::Bedrock, true)
    .to_bytes()
}

/// An EIP-1559 transfer with a syntactically valid, unverified signature.
pub fn signed_tx(nonce: u64) -> Bytes {
    let tx = TxEip1559 {
        chain_id: 10,
        nonce,
        gas_limit: 21_000,
        max_fee_per_gas: 2_000_000_000,
        max_priority_fee_per_gas: 1_000_000,
        to: TxKind::Call(Address::repeat_byte(0x42)),
        value: U256::from(nonce + 1),
        ..Default::default()
    };
    let sig = Signature::new(U256::from(nonce + 1), U256::from(2u64), false);
    TxEnvelope::from(tx.into_signed(sig)).encoded_2718().into()
}

struct L1Entry {
    block: L1BlockRef,
    header: Sealed<Header>,
    txs: Vec<RpcTransaction>,
    receipts: Vec<Receipt>,
}

/// Serves L1 blocks `0..=head`; anything newer is `NotFound`.
#[derive(Default)]
pub struct MockL1 {
    blocks: Mutex<HashMap<u64, L1Entry>>,
}

impl MockL1 {
    pub fn with_blocks(count: u64) -> Self {
        let l1 = Self::default();
        for n in 0..count {
            l1.insert(l1_ref(n));
        }
        l1
    }

    /// Insert or replace a block, keeping transactions already added at that height.
    pub fn insert(&self, block: L1BlockRef) {
        let header = Header {
            number: block.number,
            parent_hash: block.parent_hash,
            timestamp: block.timestamp,
            base_fee_per_gas: Some(7),
            mix_hash: B256::repeat_byte(block.number as u8),
            ..Default::default()
        };
        let mut blocks = self.blocks.lock().unwrap();
        let entry = blocks.entry(block.number).or_insert_with(|| L1Entry {
            block,
            header: Sealed::new_unchecked(header.clone(), block.hash),
            txs: Vec::new(),
            receipts: Vec::new(),
        });
        entry.block = block;
        entry.header = Sealed::new_unchecked(header, block.hash);
    }

    pub fn push_tx(&self, number: u64, tx: RpcTransaction) {
        let mut blocks = self.blocks.lock().unwrap();
        blocks.get_mut(&number).expect("block exists").txs.push(tx);
    }

    /// A calldata batcher transaction from `from` to the inbox.
    pub fn push_calldata(&self, number: u64, from: Address, data: Bytes) {
        let tx = RpcTransaction {
            hash: keccak256(&data),
            from,
            to: Some(INBOX),
            tx_type: 2,
            input: data,
            blob_versioned_hashes: Vec::new(),
        };
        self.push_tx(number, tx);
    }

    pub fn block(&self, number: u64) -> L1BlockRef {
        self.blocks.lock().unwrap()[&number].block
    }

    fn head(&self) -> u64 {
        self.blocks.lock().unwrap().keys().copied().max().unwrap_or_default()
    }

    fn number_of(&self, hash: B256) -> Result<u64, L1SourceError> {
        self.blocks
            .lock()
            .unwrap()
            .values()
            .find(|e| e.block.hash == hash)
            .map(|e| e.block.number)
            .ok_or_else(|| L1SourceError::NotFound(format!("block {hash}")))
    }
}

#[async_trait]
impl L1Provider for MockL1 {
    async fn head_number(&self) -> Result<u64, L1SourceError> {
        Ok(self.head())
    }

    async fn block_ref_by_number(&self, number: u64) -> Result<L1BlockRef, L1SourceError> {
        self.blocks
            .lock()
            .unwrap()
            .get(&number)
            .map(|e| e.block)
            .ok_or_else(|| L1SourceError::NotFound(format!("block {number}")))
    }

    async fn block_ref_by_hash(&self, hash: B256) -> Result<L1BlockRef, L1SourceError> {
        let number = self.number_of(hash)?;
        self.block_ref_by_number(number).await
    }

    async fn block_info_and_txs_by_hash(
        &self,
        hash: B256,
    ) -> Result<(Sealed<Header>, Arc<Vec<RpcTransaction>>), L1SourceError> {
        let number = self.number_of(hash)?;
        let blocks = self.blocks.lock().unwrap();
        let entry = &blocks[&number];
        Ok((entry.header.clone(), Arc::new(entry.txs.clone())))
    }

    async fn receipts_by_hash(&self, hash: B256) -> Result<Arc<Vec<Receipt>>, L1SourceError> {
        let number = self.number_of(hash)?;
        Ok(Arc::new(self.blocks.lock().unwrap()[&number].receipts.clone()))
    }
}

#[derive(Default)]
pub struct MockBlobs {
    pub blobs: HashMap<B256, Box<Blob>>,
}

#[async_trait]
impl BlobProvider for MockBlobs {
    async fn get_blobs(
        &self,
        block: &L1BlockRef,
        hashes: &[B256],
    ) -> Result<Vec<Box<Blob>>, L1SourceError> {
        hashes
            .iter()
            .map(|h| {
                self.blobs
                    .get(h)
                    .cloned()
                    .ok_or_else(|| L1SourceError::BlobNotFound(block.number, h.to_string()))
            })
            .collect()
    }
}

/// L2 chain view: references by number, and optionally full blocks.
#[derive(Default)]
pub struct MockL2 {
    pub refs: Mutex<HashMap<u64, L2BlockRef>>,
    pub blocks: Mutex<HashMap<u64, L2Block>>,
}

impl MockL2 {
    /// Blocks `0..=head`, `per_epoch` L2 blocks per L1 origin.
    pub fn with_chain(head: u64, per_epoch: u64) -> Self {
        let l2 = Self::default();
        for n in 0..=head {
            l2.set_ref(l2_ref(n, n / per_epoch, n % per_epoch));
        }
        l2
    }

    pub fn set_ref(&self, block: L2BlockRef) {
        self.refs.lock().unwrap().insert(block.number, block);
    }

    pub fn set_block(&self, block: L2Block) {
        self.blocks.lock().unwrap().insert(block.header.number, block);
    }
}

#[async_trait]
impl L2Provider for MockL2 {
    async fn block_by_number(&self, number: Option<u64>) -> Result<L2Block, L1SourceError> {
        let blocks = self.blocks.lock().unwrap();
        let number = number.or_else(|| blocks.keys().copied().max()).unwrap_or_default();
        blocks
            .get(&number)
            .cloned()
            .ok_or_else(|| L1SourceError::NotFound(format!("L2 block {number}")))
    }

    async fn block_ref_by_number(&self, number: Option<u64>) -> Result<L2BlockRef, L1SourceError> {
        let refs = self.refs.lock().unwrap();
        let number = number.or_else(|| refs.keys().copied().max()).unwrap_or_default();
        refs.get(&number)
            .copied()
            .ok_or_else(|| L1SourceError::NotFound(format!("L2 block {number}")))
    }
}

/// An L2 block carrying `txs` (EIP-2718 encoded, L1 info deposit first).
pub fn l2_block(header: Header, txs: &[Bytes]) -> L2Block {
    let transactions = txs
        .iter()
        .map(|tx| OpTxEnvelope::decode_2718(&mut tx.as_ref()).unwrap())
        .collect();
    Block { header, body: BlockBody { transactions, ommers: Vec::new(), withdrawals: None } }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    ForkchoiceUpdated { state: ForkchoiceState, with_attributes: bool },
    GetPayload,
    NewPayload(u64),
}

/// Engine that builds payloads straight from the attributes it was given.
#[derive(Default)]
pub struct MockEngine {
    pub calls: Mutex<Vec<EngineCall>>,
    /// Statuses returned by `newPayload`, in order; `VALID` once empty.
    pub new_payload_statuses: Mutex<VecDeque<PayloadStatusKind>>,
    /// Attributes of every build request.
    pub built: Mutex<Vec<PayloadAttributes>>,
    /// Drop the blob gas fields from built payloads.
    pub wrong_shape: bool,
    pub(crate) numbers: Mutex<HashMap<B256, u64>>,
    pub(crate) pending: Mutex<Option<ExecutionPayloadEnvelope>>,
}

impl MockEngine {
    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn know(&self, block: &L2BlockRef) {
        self.numbers.lock().unwrap().insert(block.hash, block.number);
    }

    fn build(&self, parent: B256, attrs: &PayloadAttributes) -> ExecutionPayloadEnvelope {
        let number = self.numbers.lock().unwrap().get(&parent).map_or(1, |n| n + 1);
        let txs = attrs.txs().to_vec();
        let block_hash = keccak256(
            [parent.as_slice(), &attrs.timestamp.to_be_bytes(), &(txs.len() as u64).to_be_bytes()]
                .concat(),
        );
        self.numbers.lock().unwrap().insert(block_hash, number);

        let ecotone = attrs.parent_beacon_block_root.is_some() && !self.wrong_shape;
        let payload = ExecutionPayload {
            parent_hash: parent,
            fee_recipient: attrs.suggested_fee_recipient,
            logs_bloom: Bytes::from(vec![0u8; 256]),
            prev_randao: attrs.prev_randao,
            block_number: number,
            gas_limit: attrs.gas_limit.unwrap_or_default(),
            timestamp: attrs.timestamp,
            block_hash,
            transactions: txs,
            withdrawals: attrs.withdrawals.clone(),
            blob_gas_used: ecotone.then_some(0),
            excess_blob_gas: ecotone.then_some(0),
            ..Default::default()
        };
        ExecutionPayloadEnvelope {
            parent_beacon_block_root: attrs.parent_beacon_block_root,
            execution_payload: payload,
        }
    }
}

#[async_trait]
impl EngineApi for MockEngine {
    async fn new_payload(
        &self,
        _: EngineVersion,
        envelope: &ExecutionPayloadEnvelope,
    ) -> Result<PayloadStatus, L1SourceError> {
        self.calls.lock().unwrap().push(EngineCall::NewPayload(envelope.block_number()));
        let status = self
            .new_payload_statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(PayloadStatusKind::Valid);
        Ok(PayloadStatus { status, latest_valid_hash: None, validation_error: None })
    }

    async fn forkchoice_updated(
        &self,
        _: EngineVersion,
        state: ForkchoiceState,
        attributes: Option<&PayloadAttributes>,
    ) -> Result<ForkchoiceUpdated, L1SourceError> {
        self.calls.lock().unwrap().push(EngineCall::ForkchoiceUpdated {
            state,
            with_attributes: attributes.is_some(),
        });
        let payload_id = attributes.map(|attrs| {
            self.built.lock().unwrap().push(attrs.clone());
            *self.pending.lock().unwrap() = Some(self.build(state.head_block_hash, attrs));
            B64::repeat_byte(0x11)
        });
        Ok(ForkchoiceUpdated {
            payload_status: PayloadStatus::valid(state.head_block_hash),
            payload_id,
        })
    }

    async fn get_payload(
        &self,
        _: EngineVersion,
        _: B64,
    ) -> Result<ExecutionPayloadEnvelope, L1SourceError> {
        self.calls.lock().unwrap().push(EngineCall::GetPayload);
        self.pending
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| L1SourceError::NotFound("payload".into()))
    }
}
