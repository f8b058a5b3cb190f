use std::sync::Arc;

use alloy_eips::eip2718::Decodable2718;
use alloy_primitives::{keccak256, Bytes, B256};
use op_alloy_consensus::OpTxEnvelope;
use opcore_pipeline::{encode_blob, L1BlockInfo, RollupConfig, SingleBatch};
use opcore_stream::RpcTransaction;

use super::mocks::*;
use crate::{AttributesWithParent, DerivationPipeline, OriginProvider, StepResult};

type TestPipeline = DerivationPipeline<Arc<MockL1>, MockBlobs, Arc<MockL2>>;

async fn pipeline_at_genesis(
    cfg: RollupConfig,
    l1: &Arc<MockL1>,
    blobs: MockBlobs,
) -> TestPipeline {
    let sys = genesis_system_config(&cfg);
    let mut pipeline =
        DerivationPipeline::new(Arc::new(cfg), l1.clone(), blobs, Arc::new(MockL2::default()));
    pipeline.reset(&l2_ref(0, 0, 0), l1.block(0), &sys).await.unwrap();
    pipeline
}

/// Derive until the pipeline runs out of L1 data, advancing the cursor as the engine would.
async fn derive_all(
    pipeline: &mut TestPipeline,
    batches: &[SingleBatch],
) -> Vec<AttributesWithParent> {
    let mut out = Vec::new();
    let mut cursor = l2_ref(0, 0, 0);
    loop {
        match pipeline.produce(&cursor).await {
            Ok(attrs) => {
                let batch = &batches[out.len()];
                let epoch_changed = batch.epoch_num != cursor.l1_origin.number;
                let seq = if epoch_changed { 0 } else { cursor.sequence_number + 1 };
                cursor = l2_ref(cursor.number + 1, batch.epoch_num, seq);
                out.push(attrs);
            }
            Err(err) => {
                assert!(err.is_eof(), "unexpected error: {err}");
                return out;
            }
        }
    }
}

fn l1_info(attrs: &AttributesWithParent) -> L1BlockInfo {
    let first = &attrs.attributes.txs()[0];
    let OpTxEnvelope::Deposit(deposit) = OpTxEnvelope::decode_2718(&mut first.as_ref()).unwrap()
    else {
        panic!("first transaction is not a deposit");
    };
    L1BlockInfo::decode_calldata(&deposit.inner().input).unwrap().1
}

#[tokio::test]
async fn test_derives_calldata_batches_in_order() {
    let cfg = mock_config();
    let l1 = Arc::new(MockL1::with_blocks(2));
    let batches: Vec<_> = (1..=3).map(|n| batch(n, 0)).collect();
    l1.push_calldata(1, BATCHER, channel_payload(1, &batches, &cfg));

    let mut pipeline = pipeline_at_genesis(cfg, &l1, MockBlobs::default()).await;
    let derived = derive_all(&mut pipeline, &batches).await;

    assert_eq!(derived.len(), 3);
    for (i, attrs) in derived.iter().enumerate() {
        let number = i as u64 + 1;
        assert_eq!(attrs.parent.number, number - 1);
        assert_eq!(attrs.timestamp(), number * 2);
        assert_eq!(attrs.derived_from, Some(l1.block(1)));
        assert_eq!(attrs.attributes.txs()[1..], batches[i].transactions[..]);
        assert_eq!(attrs.attributes.no_tx_pool, Some(true));
        assert_eq!(l1_info(attrs).sequence_number, number);
    }
    assert_eq!(pipeline.origin(), Some(l1.block(1)));
}

#[tokio::test]
async fn test_epoch_change_starts_new_sequence() {
    let cfg = mock_config();
    let l1 = Arc::new(MockL1::with_blocks(2));
    // L1 block 1 is at t=12, so L2 block 6 is the first that may use it.
    let batches: Vec<_> = (1..=6).map(|n| batch(n, if n < 6 { 0 } else { 1 })).collect();
    l1.push_calldata(1, BATCHER, channel_payload(1, &batches, &cfg));

    let mut pipeline = pipeline_at_genesis(cfg, &l1, MockBlobs::default()).await;
    let derived = derive_all(&mut pipeline, &batches).await;

    assert_eq!(derived.len(), 6);
    let last = l1_info(&derived[5]);
    assert_eq!(last.number, 1);
    assert_eq!(last.hash, l1_hash(1));
    assert_eq!(last.sequence_number, 0);
    assert_eq!(derived[5].attributes.prev_randao, B256::repeat_byte(1));
    assert_eq!(l1_info(&derived[4]).sequence_number, 5);
}

#[tokio::test]
async fn test_step_reports_origin_advance() {
    let cfg = mock_config();
    let l1 = Arc::new(MockL1::with_blocks(3));
    let mut pipeline = pipeline_at_genesis(cfg, &l1, MockBlobs::default()).await;
    let cursor = l2_ref(0, 0, 0);

    assert!(matches!(pipeline.step(&cursor).await, StepResult::AdvancedOrigin));
    assert_eq!(pipeline.origin(), Some(l1.block(1)));
    assert!(matches!(pipeline.step(&cursor).await, StepResult::AdvancedOrigin));
    match pipeline.step(&cursor).await {
        StepResult::OriginAdvanceErr(err) => assert!(err.is_eof()),
        other => panic!("expected origin advance error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_payload_is_skipped() {
    let cfg = mock_config();
    let l1 = Arc::new(MockL1::with_blocks(2));
    let batches = vec![batch(1, 0)];
    l1.push_calldata(1, BATCHER, Bytes::from_static(&[0x00, 0x01, 0x02]));
    l1.push_calldata(1, BATCHER, channel_payload(1, &batches, &cfg));

    let mut pipeline = pipeline_at_genesis(cfg, &l1, MockBlobs::default()).await;
    assert_eq!(derive_all(&mut pipeline, &batches).await.len(), 1);
}

#[tokio::test]
async fn test_invalid_batch_dropped_before_holocene() {
    let cfg = mock_config();
    let l1 = Arc::new(MockL1::with_blocks(2));
    let mut bad = batch(1, 0);
    bad.parent_hash = B256::repeat_byte(0xde);
    let good = batch(1, 0);
    l1.push_calldata(1, BATCHER, channel_payload(1, &[bad, good.clone()], &cfg));

    let mut pipeline = pipeline_at_genesis(cfg, &l1, MockBlobs::default()).await;
    let derived = derive_all(&mut pipeline, &[good.clone()]).await;
    assert_eq!(derived.len(), 1);
    assert_eq!(derived[0].attributes.txs()[1], good.transactions[0]);
}

#[tokio::test]
async fn test_invalid_batch_flushes_channel_after_holocene() {
    let cfg = RollupConfig { holocene_time: Some(0), ..mock_config() };
    let l1 = Arc::new(MockL1::with_blocks(2));
    let mut bad = batch(1, 0);
    bad.parent_hash = B256::repeat_byte(0xde);
    l1.push_calldata(1, BATCHER, channel_payload(1, &[bad, batch(1, 0)], &cfg));

    let mut pipeline = pipeline_at_genesis(cfg, &l1, MockBlobs::default()).await;
    assert!(derive_all(&mut pipeline, &[]).await.is_empty());
}

#[tokio::test]
async fn test_holocene_derives_ordered_channel() {
    let cfg = RollupConfig { holocene_time: Some(0), ..mock_config() };
    let l1 = Arc::new(MockL1::with_blocks(2));
    let batches: Vec<_> = (1..=2).map(|n| batch(n, 0)).collect();
    l1.push_calldata(1, BATCHER, channel_payload(7, &batches, &cfg));

    let mut pipeline = pipeline_at_genesis(cfg, &l1, MockBlobs::default()).await;
    let derived = derive_all(&mut pipeline, &batches).await;

    assert_eq!(derived.len(), 2);
    let attrs = &derived[0].attributes;
    assert!(attrs.eip_1559_params.is_some());
    assert_eq!(attrs.parent_beacon_block_root, Some(B256::ZERO));
    assert_eq!(attrs.withdrawals, Some(Vec::new()));
}

#[tokio::test]
async fn test_derives_from_blobs_after_ecotone() {
    let cfg = RollupConfig { ecotone_time: Some(0), ..mock_config() };
    let l1 = Arc::new(MockL1::with_blocks(2));
    let batches: Vec<_> = (1..=2).map(|n| batch(n, 0)).collect();
    let payload = channel_payload(3, &batches, &cfg);
    let versioned = keccak256(&payload);
    l1.push_tx(
        1,
        RpcTransaction {
            hash: B256::repeat_byte(0xb1),
            from: BATCHER,
            to: Some(INBOX),
            tx_type: RpcTransaction::BLOB_TX_TYPE,
            input: Bytes::new(),
            blob_versioned_hashes: vec![versioned],
        },
    );
    let mut blobs = MockBlobs::default();
    blobs.blobs.insert(versioned, encode_blob(&payload).unwrap());

    let mut pipeline = pipeline_at_genesis(cfg, &l1, blobs).await;
    assert_eq!(derive_all(&mut pipeline, &batches).await.len(), 2);
}

#[tokio::test]
async fn test_reset_discards_prepared_attributes() {
    let cfg = mock_config();
    let sys = genesis_system_config(&cfg);
    let l1 = Arc::new(MockL1::with_blocks(2));
    let batches = vec![batch(1, 0)];
    l1.push_calldata(1, BATCHER, channel_payload(1, &batches, &cfg));

    let mut pipeline = pipeline_at_genesis(cfg, &l1, MockBlobs::default()).await;
    let cursor = l2_ref(0, 0, 0);
    loop {
        if matches!(pipeline.step(&cursor).await, StepResult::PreparedAttributes) {
            break;
        }
    }
    assert!(pipeline.peek().is_some());

    pipeline.reset(&cursor, l1.block(0), &sys).await.unwrap();
    assert!(pipeline.peek().is_none());
    assert_eq!(pipeline.origin(), Some(l1.block(0)));

    // The same batch is derived again from the reset point.
    assert_eq!(derive_all(&mut pipeline, &batches).await.len(), 1);
}
