use std::sync::Arc;

use alloy_consensus::Header;
use alloy_primitives::{Bytes, B256};
use opcore_pipeline::{config::SEQUENCER_FEE_VAULT, RollupConfig};
use opcore_stream::EngineVersion;
use opcore_types::{
    ExecutionPayload, ExecutionPayloadEnvelope, L2BlockRef, PayloadAttributes, PayloadStatusKind,
    PayloadVersion, Withdrawal,
};

use super::mocks::*;
use crate::{
    check_payload_shape, engine_version, payload_version, AttributesWithParent, EngineController,
    EngineError, EngineHeads,
};

type TestController = EngineController<MockEngine, Arc<MockL2>>;

fn forks() -> RollupConfig {
    RollupConfig {
        canyon_time: Some(10),
        ecotone_time: Some(20),
        isthmus_time: Some(30),
        ..mock_config()
    }
}

fn controller(
    cfg: RollupConfig,
    engine: MockEngine,
    l2: Arc<MockL2>,
    heads: EngineHeads,
) -> TestController {
    engine.know(&heads.unsafe_head);
    EngineController::new(engine, l2, Arc::new(cfg), heads)
}

/// Attributes for block 1 on top of genesis, shaped for the forks active at t=2.
fn attributes(cfg: &RollupConfig) -> AttributesWithParent {
    let ecotone = cfg.is_ecotone_active(2);
    AttributesWithParent {
        attributes: PayloadAttributes {
            timestamp: 2,
            prev_randao: B256::repeat_byte(0x0a),
            suggested_fee_recipient: SEQUENCER_FEE_VAULT,
            withdrawals: cfg.is_canyon_active(2).then(Vec::new),
            parent_beacon_block_root: ecotone.then_some(B256::ZERO),
            transactions: Some(vec![l1_info_tx(0, 1), signed_tx(0)]),
            no_tx_pool: Some(true),
            gas_limit: Some(30_000_000),
            eip_1559_params: None,
        },
        parent: l2_ref(0, 0, 0),
        derived_from: Some(l1_ref(1)),
        is_last_in_span: true,
    }
}

fn envelope(number: u64, timestamp: u64, version: PayloadVersion) -> ExecutionPayloadEnvelope {
    let v2 = version >= PayloadVersion::V2;
    let v3 = version >= PayloadVersion::V3;
    ExecutionPayloadEnvelope {
        parent_beacon_block_root: v3.then_some(B256::ZERO),
        execution_payload: ExecutionPayload {
            parent_hash: l2_hash(number - 1),
            logs_bloom: Bytes::from(vec![0u8; 256]),
            block_number: number,
            timestamp,
            block_hash: B256::repeat_byte(number as u8),
            transactions: vec![l1_info_tx(0, number)],
            withdrawals: v2.then(Vec::<Withdrawal>::new),
            blob_gas_used: v3.then_some(0),
            excess_blob_gas: v3.then_some(0),
            withdrawals_root: (version == PayloadVersion::V4).then_some(B256::ZERO),
            ..Default::default()
        },
    }
}

#[test]
fn test_versions_follow_forks() {
    let cfg = forks();
    assert_eq!(engine_version(&cfg, 0), EngineVersion::V2);
    assert_eq!(payload_version(&cfg, 0), PayloadVersion::V1);
    assert_eq!(payload_version(&cfg, 10), PayloadVersion::V2);
    assert_eq!(engine_version(&cfg, 20), EngineVersion::V3);
    assert_eq!(payload_version(&cfg, 20), PayloadVersion::V3);
    assert_eq!(engine_version(&cfg, 30), EngineVersion::V4);
    assert_eq!(payload_version(&cfg, 30), PayloadVersion::V4);
}

#[test]
fn test_payload_shape_checked_against_fork() {
    let cfg = forks();
    assert!(check_payload_shape(&cfg, &envelope(1, 0, PayloadVersion::V1)).is_ok());
    assert!(check_payload_shape(&cfg, &envelope(1, 20, PayloadVersion::V3)).is_ok());

    let err = check_payload_shape(&cfg, &envelope(1, 20, PayloadVersion::V2)).unwrap_err();
    assert!(matches!(
        err,
        EngineError::ShapeMismatch { expected: PayloadVersion::V3, got: PayloadVersion::V2 }
    ));

    let mut early_root = envelope(1, 10, PayloadVersion::V2);
    early_root.parent_beacon_block_root = Some(B256::ZERO);
    assert!(matches!(
        check_payload_shape(&cfg, &early_root),
        Err(EngineError::UnexpectedBeaconRoot(10))
    ));
}

#[tokio::test]
async fn test_build_and_insert_call_sequence() {
    let cfg = mock_config();
    let genesis = l2_ref(0, 0, 0);
    let mut ctl =
        controller(cfg.clone(), MockEngine::default(), Arc::default(), EngineHeads::at(genesis));
    let attrs = attributes(&cfg);

    let block = ctl.build_and_insert(&attrs).await.unwrap();
    assert_eq!(block.number, 1);
    assert_eq!(block.parent_hash, genesis.hash);
    assert_eq!(block.l1_origin.number, 0);
    assert_eq!(block.sequence_number, 1);
    assert_eq!(ctl.heads().unsafe_head, block);
    assert_eq!(ctl.heads().safe_head, block);
    assert_eq!(ctl.heads().finalized_head, genesis);

    let calls = ctl.engine().calls();
    assert_eq!(calls.len(), 4);
    assert!(matches!(
        &calls[0],
        EngineCall::ForkchoiceUpdated { state, with_attributes: true }
            if state.head_block_hash == genesis.hash
    ));
    assert_eq!(calls[1], EngineCall::GetPayload);
    assert_eq!(calls[2], EngineCall::NewPayload(1));
    assert!(matches!(
        &calls[3],
        EngineCall::ForkchoiceUpdated { state, with_attributes: false }
            if state.head_block_hash == block.hash && state.safe_block_hash == block.hash
    ));
}

#[tokio::test]
async fn test_build_rejects_wrong_payload_shape() {
    let cfg = RollupConfig { ecotone_time: Some(0), ..mock_config() };
    let engine = MockEngine { wrong_shape: true, ..Default::default() };
    let mut ctl = controller(cfg.clone(), engine, Arc::default(), EngineHeads::at(l2_ref(0, 0, 0)));

    let err = ctl.build_and_insert(&attributes(&cfg)).await.unwrap_err();
    assert!(matches!(err, EngineError::ShapeMismatch { expected: PayloadVersion::V3, .. }));
    assert_eq!(ctl.heads().safe_head.number, 0);
    assert!(!ctl.engine().calls().iter().any(|c| matches!(c, EngineCall::NewPayload(_))));
}

#[tokio::test]
async fn test_holocene_invalid_payload_retries_deposits_only() {
    let cfg = RollupConfig { holocene_time: Some(0), ..mock_config() };
    let engine = MockEngine::default();
    engine.new_payload_statuses.lock().unwrap().push_back(PayloadStatusKind::Invalid);
    let mut ctl = controller(cfg.clone(), engine, Arc::default(), EngineHeads::at(l2_ref(0, 0, 0)));

    let block = ctl.process_attributes(&attributes(&cfg)).await.unwrap();
    assert_eq!(block.number, 1);

    let built = ctl.engine().built.lock().unwrap().clone();
    assert_eq!(built.len(), 2);
    assert_eq!(built[0].txs().len(), 2);
    assert_eq!(built[1].txs(), &[l1_info_tx(0, 1)]);
}

#[tokio::test]
async fn test_invalid_payload_is_an_error_before_holocene() {
    let cfg = mock_config();
    let engine = MockEngine::default();
    engine.new_payload_statuses.lock().unwrap().push_back(PayloadStatusKind::Invalid);
    let mut ctl = controller(cfg.clone(), engine, Arc::default(), EngineHeads::at(l2_ref(0, 0, 0)));

    let err = ctl.process_attributes(&attributes(&cfg)).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidPayload(s) if s.status == PayloadStatusKind::Invalid));
    assert_eq!(ctl.heads().safe_head.number, 0);
}

#[tokio::test]
async fn test_insert_unsafe_moves_unsafe_head_only() {
    let cfg = mock_config();
    let genesis = l2_ref(0, 0, 0);
    let mut ctl = controller(cfg, MockEngine::default(), Arc::default(), EngineHeads::at(genesis));

    let block = ctl.insert_unsafe(&envelope(1, 2, PayloadVersion::V1)).await.unwrap();
    assert_eq!(block.hash, B256::repeat_byte(1));
    assert_eq!(ctl.heads().unsafe_head, block);
    assert_eq!(ctl.heads().safe_head, genesis);
    assert_eq!(ctl.engine().calls()[0], EngineCall::NewPayload(1));
}

#[tokio::test]
async fn test_insert_unsafe_rejected_keeps_head() {
    let cfg = mock_config();
    let genesis = l2_ref(0, 0, 0);
    let engine = MockEngine::default();
    engine.new_payload_statuses.lock().unwrap().push_back(PayloadStatusKind::InvalidBlockHash);
    let mut ctl = controller(cfg, engine, Arc::default(), EngineHeads::at(genesis));

    assert!(ctl.insert_unsafe(&envelope(1, 2, PayloadVersion::V1)).await.is_err());
    assert_eq!(ctl.heads().unsafe_head, genesis);
}

#[tokio::test]
async fn test_promote_safe_requires_canonical_block() {
    let cfg = mock_config();
    let l2 = Arc::new(MockL2::with_chain(5, 100));
    let heads = EngineHeads { unsafe_head: l2_ref(5, 0, 5), ..EngineHeads::at(l2_ref(0, 0, 0)) };
    let mut ctl = controller(cfg, MockEngine::default(), l2, heads);

    ctl.promote_safe(l2_ref(3, 0, 3)).await.unwrap();
    assert_eq!(ctl.heads().safe_head.number, 3);

    let forked = L2BlockRef { hash: B256::repeat_byte(0xf0), ..l2_ref(4, 0, 4) };
    assert!(matches!(
        ctl.promote_safe(forked).await,
        Err(EngineError::NotAncestor { number: 4, .. })
    ));
    assert!(matches!(
        ctl.promote_safe(l2_ref(6, 0, 6)).await,
        Err(EngineError::NotAncestor { number: 6, .. })
    ));

    // Finality never passes the safe head.
    assert!(ctl.promote_finalized(l2_ref(4, 0, 4)).await.is_err());
    ctl.promote_finalized(l2_ref(2, 0, 2)).await.unwrap();
    assert_eq!(ctl.heads().finalized_head.number, 2);
    assert_eq!(ctl.heads().safe_head.number, 3);
}

fn unsafe_block_matching(attrs: &AttributesWithParent) -> Header {
    let a = &attrs.attributes;
    Header {
        parent_hash: attrs.parent.hash,
        number: attrs.parent.number + 1,
        timestamp: a.timestamp,
        mix_hash: a.prev_randao,
        beneficiary: a.suggested_fee_recipient,
        gas_limit: 30_000_000,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_matching_unsafe_block_is_consolidated() {
    let cfg = mock_config();
    let attrs = attributes(&cfg);
    let header = unsafe_block_matching(&attrs);
    let hash = header.hash_slow();
    let l2 = Arc::new(MockL2::default());
    l2.set_block(l2_block(header, attrs.attributes.txs()));

    let unsafe_head = L2BlockRef { hash, ..l2_ref(1, 0, 1) };
    let heads = EngineHeads { unsafe_head, ..EngineHeads::at(l2_ref(0, 0, 0)) };
    let mut ctl = controller(cfg, MockEngine::default(), l2, heads);

    let safe = ctl.process_attributes(&attrs).await.unwrap();
    assert_eq!(safe.hash, hash);
    assert_eq!(safe.sequence_number, 1);
    assert_eq!(ctl.heads().safe_head, safe);

    let calls = ctl.engine().calls();
    assert_eq!(calls.len(), 1);
    assert!(matches!(&calls[0], EngineCall::ForkchoiceUpdated { with_attributes: false, .. }));
}

#[tokio::test]
async fn test_mismatched_unsafe_block_is_rebuilt() {
    let cfg = mock_config();
    let attrs = attributes(&cfg);
    let mut header = unsafe_block_matching(&attrs);
    header.mix_hash = B256::repeat_byte(0x0b);
    let hash = header.hash_slow();
    let l2 = Arc::new(MockL2::default());
    l2.set_block(l2_block(header, attrs.attributes.txs()));

    let unsafe_head = L2BlockRef { hash, ..l2_ref(1, 0, 1) };
    let heads = EngineHeads { unsafe_head, ..EngineHeads::at(l2_ref(0, 0, 0)) };
    let mut ctl = controller(cfg, MockEngine::default(), l2, heads);
    ctl.engine().know(&l2_ref(0, 0, 0));

    let safe = ctl.process_attributes(&attrs).await.unwrap();
    assert_ne!(safe.hash, hash);
    assert_eq!(ctl.heads().unsafe_head, safe);
    assert!(ctl.engine().calls().contains(&EngineCall::GetPayload));
}
