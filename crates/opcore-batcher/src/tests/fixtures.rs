//! L2 blocks, batches and configs shared by the batcher tests.

use alloy_consensus::{Block, BlockBody, Header, SignableTransaction, TxEip1559, TxEnvelope};
use alloy_eips::eip2718::{Decodable2718, Encodable2718};
use alloy_primitives::{address, keccak256, Address, Bytes, Signature, TxKind, B256, U256};
use op_alloy_consensus::OpTxEnvelope;
use opcore_pipeline::{
    config::ChainGenesis, GenesisSystemConfig, Hardfork, L1BlockInfo, RollupConfig, SingleBatch,
};
use opcore_stream::L2Block;
use opcore_types::BlockId;
use rand::{rngs::StdRng, RngCore, SeedableRng};

pub const BATCHER: Address = address!("6887246668a3b87F54DeB3b94Ba47a6f63F32985");
pub const INBOX: Address = address!("ff00000000000000000000000000000000000010");

/// Delta chain (span batches allowed) with 2s blocks, anchored at L1 0 / L2 0.
pub fn mock_config() -> RollupConfig {
    RollupConfig {
        genesis: ChainGenesis {
            l1: BlockId::new(l1_hash(0), 0),
            l2: BlockId::new(genesis_hash(), 0),
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
        delta_time: Some(0),
        batch_inbox_address: INBOX,
        ..Default::default()
    }
}

pub fn l1_hash(number: u64) -> B256 {
    keccak256(number.to_be_bytes())
}

pub fn genesis_hash() -> B256 {
    Header::default().hash_slow()
}

/// A signed EIP-1559 transaction on chain 10 with `input_len` bytes of noise as calldata.
pub fn signed_tx(nonce: u64, input_len: usize) -> Bytes {
    let mut input = vec![0u8; input_len];
    StdRng::seed_from_u64(nonce).fill_bytes(&mut input);
    let tx = TxEip1559 {
        chain_id: 10,
        nonce,
        gas_limit: 1_000_000,
        max_fee_per_gas: 2_000_000_000,
        max_priority_fee_per_gas: 1_000_000,
        to: TxKind::Call(Address::repeat_byte(0x42)),
        value: U256::from(nonce),
        input: input.into(),
        ..Default::default()
    };
    let sig = Signature::new(U256::from(nonce + 1), U256::from(2u64), false);
    TxEnvelope::from(tx.into_signed(sig)).encoded_2718().into()
}

pub fn single_batch(number: u64, epoch: u64, tx_len: usize) -> SingleBatch {
    SingleBatch {
        parent_hash: B256::with_last_byte(number as u8),
        epoch_num: epoch,
        epoch_hash: l1_hash(epoch),
        timestamp: number * 2,
        transactions: vec![signed_tx(number, tx_len)],
    }
}

fn l1_info_tx(epoch: u64, sequence_number: u64) -> Bytes {
    L1BlockInfo::new(
        epoch,
        epoch * 12,
        U256::from(7u64),
        l1_hash(epoch),
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

/// L2 block `number` on top of `parent`, carrying one user transaction of `tx_len` bytes.
pub fn l2_block(number: u64, parent: B256, epoch: u64, sequence_number: u64, tx_len: usize) -> L2Block {
    let header = Header {
        number,
        parent_hash: parent,
        timestamp: number * 2,
        gas_limit: 30_000_000,
        ..Default::default()
    };
    let raw = [l1_info_tx(epoch, sequence_number), signed_tx(number, tx_len)];
    let transactions = raw
        .iter()
        .map(|tx| OpTxEnvelope::decode_2718(&mut tx.as_ref()).unwrap())
        .collect();
    Block { header, body: BlockBody { transactions, ommers: Vec::new(), withdrawals: None } }
}

/// Blocks `1..=count` on top of the genesis block, `per_epoch` blocks per L1 origin.
pub fn l2_chain(count: u64, per_epoch: u64, tx_len: usize) -> Vec<L2Block> {
    let mut parent = genesis_hash();
    (1..=count)
        .map(|n| {
            let block = l2_block(n, parent, n / per_epoch, n % per_epoch, tx_len);
            parent = block.header.hash_slow();
            block
        })
        .collect()
}
