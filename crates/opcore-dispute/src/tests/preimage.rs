use std::sync::Arc;

use alloy_eips::eip4844::{env_settings::EnvKzgSettings, kzg_to_versioned_hash};
use alloy_primitives::{keccak256, B256, U256};
use opcore_stream::RetryConfig;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::fixtures::{addr, hash};
use crate::preimage::{
    local, oracle_channel, preimage_part, run_precompile, LocalInputs, OracleError, OracleServer,
    OracleUpdate, PreimageKey, PreimageKeyType, PreimageOracle, PreimageSource, PreimageStore,
    IDENTITY_PRECOMPILE, POINT_EVALUATION_PRECOMPILE, SHA256_PRECOMPILE,
};

fn inputs() -> LocalInputs {
    LocalInputs {
        l1_head: hash(1),
        starting_output: hash(2),
        disputed_output: hash(3),
        disputed_block: 101,
        chain_id: 10,
    }
}

#[test]
fn keys_carry_their_type_byte() {
    let key = PreimageKey::keccak256(b"hello");
    assert_eq!(key.key_type(), Ok(PreimageKeyType::Keccak256));
    assert_eq!(key.as_b256()[1..], keccak256(b"hello")[1..]);

    let key = PreimageKey::sha256(b"hello");
    assert_eq!(key.as_b256()[0], 3);
    assert_eq!(key.as_b256()[1..], Sha256::digest(b"hello")[1..]);

    assert_eq!(PreimageKey::blob(&[0u8; 48], B256::ZERO).key_type(), Ok(PreimageKeyType::Blob));
    assert_eq!(
        PreimageKey::precompile(SHA256_PRECOMPILE, 100, b"x").key_type(),
        Ok(PreimageKeyType::Precompile)
    );
    assert_eq!(PreimageKey::from_raw(hash(0x04)).key_type(), Err(0x04));
}

#[test]
fn local_keys_are_bound_to_a_game_and_context() {
    let key = PreimageKey::local(local::DISPUTED_OUTPUT_ROOT);
    assert!(key.is_local());
    assert_eq!(key.as_b256()[31], 3);
    assert!(key.as_b256()[1..31].iter().all(|b| *b == 0));

    let a = key.localize(addr(1), hash(9));
    let b = key.localize(addr(2), hash(9));
    let c = key.localize(addr(1), hash(8));
    assert!(a.is_local());
    assert_ne!(a, b);
    assert_ne!(a, c);

    let mut buf = key.as_b256().to_vec();
    buf.extend_from_slice(&[0u8; 12]);
    buf.extend_from_slice(addr(1).as_slice());
    buf.extend_from_slice(hash(9).as_slice());
    assert_eq!(a.as_b256()[1..], keccak256(buf)[1..]);

    let global = PreimageKey::keccak256(b"x");
    assert_eq!(global.localize(addr(1), hash(9)), global);
}

#[test]
fn local_inputs_context_and_data() {
    let inputs = inputs();
    assert_eq!(
        inputs.local_context(),
        keccak256([hash(2).as_slice(), hash(3).as_slice()].concat())
    );
    assert_eq!(inputs.local_data(local::L1_HEAD), Some((hash(1), 32)));
    let (word, size) = inputs.local_data(local::DISPUTED_L2_BLOCK_NUMBER).unwrap();
    assert_eq!(size, 8);
    assert_eq!(word[..8], 101u64.to_be_bytes());
    assert_eq!(inputs.local_data(6), None);

    let other = LocalInputs { disputed_block: 102, ..inputs };
    assert_ne!(inputs.cache_key(), other.cache_key());
    assert_eq!(inputs.local_context(), other.local_context());
}

#[test]
fn parts_are_windows_of_the_length_prefixed_preimage() {
    let preimage: Vec<u8> = (0u8..40).collect();

    let (part, len) = preimage_part(&preimage, 0).unwrap();
    assert_eq!(len, 32);
    assert_eq!(part[..8], 40u64.to_be_bytes());
    assert_eq!(part[8..], preimage[..24]);

    let (part, len) = preimage_part(&preimage, 40).unwrap();
    assert_eq!(len, 8);
    assert_eq!(part[..8], preimage[32..]);
    assert!(part[8..].iter().all(|b| *b == 0));

    assert!(preimage_part(&preimage, 48).is_none());
    assert_eq!(preimage_part(&[], 0).map(|(_, len)| len), Some(8));
}

#[test]
fn oracle_serves_loaded_parts_only() {
    let mut oracle = PreimageOracle::default();
    let data = vec![7u8; 100];
    let key = oracle.load_keccak256_preimage_part(8, &data).unwrap();
    assert_eq!(key, PreimageKey::keccak256(&data));
    assert_eq!(oracle.preimage_length(key), Some(100));
    assert_eq!(oracle.read_preimage(key, 8).unwrap(), ([7u8; 32], 32));
    assert_eq!(oracle.read_preimage(key, 0), Err(OracleError::MissingPart { key, offset: 0 }));
    assert_eq!(
        oracle.load_keccak256_preimage_part(108, &data),
        Err(OracleError::PartOffsetOob { offset: 108, size: 100 })
    );

    let key = oracle.load_sha256_preimage_part(0, b"abc").unwrap();
    let (part, len) = oracle.read_preimage(key, 0).unwrap();
    assert_eq!(len, 11);
    assert_eq!(&part[8..11], b"abc");
}

#[test]
fn local_data_is_stored_under_the_localized_key() {
    let mut oracle = PreimageOracle::default();
    let inputs = inputs();
    let (word, size) = inputs.local_data(local::CHAIN_ID).unwrap();
    let key = oracle
        .load_local_data(addr(1), local::CHAIN_ID, inputs.local_context(), word, size, 0)
        .unwrap();
    assert_eq!(key, PreimageKey::local(local::CHAIN_ID).localize(addr(1), inputs.local_context()));
    let (part, len) = oracle.read_preimage(key, 0).unwrap();
    assert_eq!(len, 16);
    assert_eq!(part[..8], 8u64.to_be_bytes());
    assert_eq!(part[8..16], 10u64.to_be_bytes());

    assert_eq!(
        oracle.load_local_data(addr(1), local::CHAIN_ID, B256::ZERO, word, 33, 0),
        Err(OracleError::LocalDataTooLarge(33))
    );
}

#[test]
fn precompiles_prefix_a_status_byte() {
    let out = run_precompile(SHA256_PRECOMPILE, b"abc").unwrap();
    assert_eq!(out[0], 1);
    assert_eq!(out[1..], Sha256::digest(b"abc")[..]);

    assert_eq!(run_precompile(IDENTITY_PRECOMPILE, b"abc").unwrap(), b"\x01abc");
    // malformed point evaluation input fails without erroring
    assert_eq!(run_precompile(POINT_EVALUATION_PRECOMPILE, &[0u8; 10]).unwrap(), vec![0]);
    assert_eq!(
        run_precompile(addr(0x55), b""),
        Err(OracleError::UnsupportedPrecompile(addr(0x55)))
    );

    let mut oracle = PreimageOracle::default();
    let key = oracle.load_precompile_preimage_part(0, IDENTITY_PRECOMPILE, 15, b"abc").unwrap();
    assert_eq!(key, PreimageKey::precompile(IDENTITY_PRECOMPILE, 15, b"abc"));
    let (part, len) = oracle.read_preimage(key, 0).unwrap();
    assert_eq!(len, 12);
    assert_eq!(&part[8..12], b"\x01abc");
}

/// A blob whose first field element is 1, its commitment, and a proof of its value at `z`.
fn blob_opening(z: B256) -> (Vec<u8>, B256, Vec<u8>) {
    let mut bytes = vec![0u8; c_kzg::BYTES_PER_BLOB];
    bytes[31] = 1;
    let blob = c_kzg::Blob::from_bytes(&bytes).unwrap();
    let settings = EnvKzgSettings::Default.get();
    let commitment = settings.blob_to_kzg_commitment(&blob).unwrap().to_bytes();
    let z_bytes = c_kzg::Bytes32::from_bytes(z.as_slice()).unwrap();
    let (proof, y) = settings.compute_kzg_proof(&blob, &z_bytes).unwrap();
    (commitment.to_vec(), B256::from(*y), proof.to_bytes().to_vec())
}

#[test]
fn blob_parts_need_a_valid_opening() {
    let z = B256::with_last_byte(5);
    let (commitment, y, proof) = blob_opening(z);

    let mut oracle = PreimageOracle::default();
    let key = oracle.load_blob_preimage_part(z, y, &commitment, &proof, 0).unwrap();
    assert_eq!(key, PreimageKey::blob(&commitment, z));
    let (part, len) = oracle.read_preimage(key, 0).unwrap();
    assert_eq!(len, 32);
    assert_eq!(part[..8], 32u64.to_be_bytes());
    assert_eq!(part[8..], y[..24]);

    let wrong = B256::from(U256::from_be_bytes(y.0) ^ U256::from(1));
    assert_eq!(
        oracle.load_blob_preimage_part(z, wrong, &commitment, &proof, 0),
        Err(OracleError::InvalidKzgProof)
    );

    let mut input = kzg_to_versioned_hash(&commitment).to_vec();
    input.extend_from_slice(z.as_slice());
    input.extend_from_slice(y.as_slice());
    input.extend_from_slice(&commitment);
    input.extend_from_slice(&proof);
    let out = run_precompile(POINT_EVALUATION_PRECOMPILE, &input).unwrap();
    assert_eq!(out.len(), 65);
    assert_eq!(out[0], 1);
    assert_eq!(U256::from_be_slice(&out[1..33]), U256::from(4096));
}

#[test]
fn store_remembers_how_to_load_each_preimage() {
    let mut store = PreimageStore::new();
    let keccak = store.insert_keccak256(b"data");
    let local = store.insert_local(local::CHAIN_ID, &10u64.to_be_bytes());
    assert_eq!(store.len(), 2);
    assert_eq!(store.get(keccak).unwrap(), b"data");
    assert_eq!(store.oracle_update(keccak), Some(OracleUpdate::Keccak256(b"data".to_vec())));
    assert_eq!(store.oracle_update(local), Some(OracleUpdate::Local { ident: local::CHAIN_ID }));
    assert_eq!(store.lookup(PreimageKey::keccak256(b"other")), Err(OracleError::NotFound(PreimageKey::keccak256(b"other"))));

    store.hint(b"l2-output 0x01");
    assert_eq!(store.hints(), [b"l2-output 0x01".to_vec()]);
}

#[test]
fn global_updates_load_the_requested_part() {
    let mut oracle = PreimageOracle::default();
    let update = OracleUpdate::Sha256(b"payload".to_vec());
    assert_eq!(update.key_type(), PreimageKeyType::Sha256);
    update.apply_global(&mut oracle, 8).unwrap();
    let key = PreimageKey::sha256(b"payload");
    assert_eq!(oracle.read_preimage(key, 8).unwrap().1, 7);

    // local data goes through the game
    OracleUpdate::Local { ident: 1 }.apply_global(&mut oracle, 0).unwrap();
    assert!(oracle.read_preimage(PreimageKey::local(1), 0).is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_client_talks_to_the_async_server() {
    let mut store = PreimageStore::new();
    let key = store.insert_keccak256(b"remote");
    let store = Arc::new(RwLock::new(store));

    let (client, requests) = oracle_channel(8);
    let server = OracleServer::new(store.clone(), RetryConfig::immediate(2));
    let cancel = CancellationToken::new();
    let serving = tokio::spawn({
        let cancel = cancel.clone();
        async move { server.serve(requests, cancel).await }
    });

    let (value, missing) = tokio::task::spawn_blocking(move || {
        let mut client = client;
        client.hint(b"fetch remote");
        let value = client.get(key);
        let missing = client.get(PreimageKey::keccak256(b"absent"));
        (value, missing)
    })
    .await
    .unwrap();

    assert_eq!(value.unwrap(), b"remote");
    assert!(matches!(missing, Err(OracleError::NotFound(_))));
    assert_eq!(store.read().await.hints(), [b"fetch remote".to_vec()]);

    cancel.cancel();
    serving.await.unwrap();
}

#[test]
fn client_fails_once_the_server_is_gone() {
    let (mut client, requests) = oracle_channel(1);
    drop(requests);
    assert_eq!(client.get(PreimageKey::keccak256(b"x")), Err(OracleError::ChannelClosed));
}
