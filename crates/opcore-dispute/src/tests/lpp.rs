use alloy_primitives::{keccak256, B256, U256};

use super::fixtures::addr;
use crate::preimage::{
    lpp::{commitments, merkle_root, verify_leaf, StateMatrix, KECCAK_RATE, MIN_PREIMAGE_SIZE},
    LppConfig, LppError, PreimageKey, PreimageOracle, ProposalStatus,
};

const UUID: u64 = 7;
const PERIOD: u64 = 100;

fn oracle() -> PreimageOracle {
    PreimageOracle::new(LppConfig { min_bond: U256::from(10), challenge_period: PERIOD })
}

/// Twenty full blocks plus a ten byte tail.
fn preimage() -> Vec<u8> {
    (0..MIN_PREIMAGE_SIZE as usize + 10).map(|i| (i % 251) as u8).collect()
}

fn state_after(data: &[u8], blocks: usize) -> StateMatrix {
    commitments(&data[..blocks * KECCAK_RATE], [0u64; 25], false).1
}

/// Propose `data` in three calls, optionally corrupting the commitment of one leaf.
fn propose(oracle: &mut PreimageOracle, data: &[u8], corrupt: Option<usize>, now: u64) {
    let split = 10 * KECCAK_RATE;
    let full = 20 * KECCAK_RATE;
    let (mut first, state) = commitments(&data[..split], [0u64; 25], false);
    let (mut second, state) = commitments(&data[split..full], state, false);
    let (mut last, _) = commitments(&data[full..], state, true);
    if let Some(index) = corrupt {
        let slot = match index {
            i if i < 10 => &mut first[i],
            i if i < 20 => &mut second[i - 10],
            _ => &mut last[0],
        };
        *slot = keccak256(slot.as_slice());
    }

    let claimant = addr(1);
    oracle.init_lpp(claimant, UUID, 8, data.len() as u64, U256::from(10)).unwrap();
    oracle.add_leaves(claimant, UUID, 0, &data[..split], &first, false, now).unwrap();
    oracle.add_leaves(claimant, UUID, 10, &data[split..full], &second, false, now).unwrap();
    oracle.add_leaves(claimant, UUID, 20, &data[full..], &last, true, now).unwrap();
}

#[test]
fn unchallenged_proposal_squeezes_into_a_keccak_preimage() {
    let data = preimage();
    let mut oracle = oracle();
    propose(&mut oracle, &data, None, 1_000);

    let proposal = oracle.proposal(addr(1), UUID).unwrap();
    assert_eq!(proposal.leaves().len(), 21);
    assert_eq!(proposal.bytes_processed(), data.len() as u64);
    assert_eq!(proposal.status, ProposalStatus::Finalized { timestamp: 1_000 });
    let leaves = proposal.leaves().to_vec();
    let (pre_proof, post_proof) = (proposal.proof(19), proposal.proof(20));
    assert_eq!(proposal.root(), merkle_root(&leaves));
    assert!(verify_leaf(proposal.root(), &leaves[7], &proposal.proof(7)));
    assert!(!verify_leaf(proposal.root(), &leaves[7], &proposal.proof(8)));

    let state = state_after(&data, 20);
    assert_eq!(
        oracle.squeeze_lpp(
            addr(1),
            UUID,
            state,
            &leaves[19],
            &pre_proof,
            &leaves[20],
            &post_proof,
            1_000 + PERIOD - 1
        ),
        Err(LppError::ActiveProposal)
    );
    assert_eq!(
        oracle.squeeze_lpp(addr(1), UUID, state, &leaves[18], &proposal_proof(&oracle, 18), &leaves[19], &pre_proof, 1_000 + PERIOD),
        Err(LppError::InvalidLastLeaf)
    );

    let key = oracle
        .squeeze_lpp(addr(1), UUID, state, &leaves[19], &pre_proof, &leaves[20], &post_proof, 1_000 + PERIOD)
        .unwrap();
    assert_eq!(key, PreimageKey::keccak256(&data));
    let (part, len) = oracle.read_preimage(key, 8).unwrap();
    assert_eq!(len, 32);
    assert_eq!(part[..], data[..32]);
    assert_eq!(oracle.preimage_length(key), Some(data.len() as u64));
    assert_eq!(oracle.credit_of(addr(1)), U256::from(10));
    assert_eq!(oracle.proposal(addr(1), UUID).unwrap().status, ProposalStatus::Squeezed);
}

fn proposal_proof(oracle: &PreimageOracle, index: usize) -> Vec<B256> {
    oracle.proposal(addr(1), UUID).unwrap().proof(index)
}

#[test]
fn bad_commitment_is_countered_by_replaying_one_block() {
    let data = preimage();
    let mut oracle = oracle();
    propose(&mut oracle, &data, Some(5), 0);
    let leaves = oracle.proposal(addr(1), UUID).unwrap().leaves().to_vec();

    // wrong pre-state
    assert_eq!(
        oracle.challenge_lpp(
            addr(2),
            addr(1),
            UUID,
            state_after(&data, 4),
            &leaves[4],
            &proposal_proof(&oracle, 4),
            &leaves[5],
            &proposal_proof(&oracle, 5)
        ),
        Err(LppError::StatePreimageMismatch)
    );
    // honest leaves cannot be countered; leaf i commits to the state after i + 1 blocks
    assert_eq!(
        oracle.challenge_lpp(
            addr(2),
            addr(1),
            UUID,
            state_after(&data, 4),
            &leaves[3],
            &proposal_proof(&oracle, 3),
            &leaves[4],
            &proposal_proof(&oracle, 4)
        ),
        Err(LppError::PostStateMatches)
    );
    assert_eq!(
        oracle.challenge_lpp(
            addr(2),
            addr(1),
            UUID,
            state_after(&data, 4),
            &leaves[4],
            &proposal_proof(&oracle, 4),
            &leaves[6],
            &proposal_proof(&oracle, 6)
        ),
        Err(LppError::StatesNotContiguous)
    );

    oracle
        .challenge_lpp(
            addr(2),
            addr(1),
            UUID,
            state_after(&data, 5),
            &leaves[4],
            &proposal_proof(&oracle, 4),
            &leaves[5],
            &proposal_proof(&oracle, 5),
        )
        .unwrap();
    assert_eq!(
        oracle.proposal(addr(1), UUID).unwrap().status,
        ProposalStatus::Countered { challenger: addr(2) }
    );
    assert_eq!(oracle.credit_of(addr(2)), U256::from(10));

    let state = state_after(&data, 20);
    assert_eq!(
        oracle.squeeze_lpp(
            addr(1),
            UUID,
            state,
            &leaves[19],
            &proposal_proof(&oracle, 19),
            &leaves[20],
            &proposal_proof(&oracle, 20),
            PERIOD
        ),
        Err(LppError::BadProposal)
    );
}

#[test]
fn bad_first_commitment_is_countered_from_the_empty_state() {
    let data = preimage();
    let mut oracle = oracle();
    propose(&mut oracle, &data, None, 0);
    let leaves = oracle.proposal(addr(1), UUID).unwrap().leaves().to_vec();
    assert_eq!(
        oracle.challenge_first_lpp(addr(2), addr(1), UUID, &leaves[0], &proposal_proof(&oracle, 0)),
        Err(LppError::PostStateMatches)
    );

    let mut oracle = self::oracle();
    propose(&mut oracle, &data, Some(0), 0);
    let leaves = oracle.proposal(addr(1), UUID).unwrap().leaves().to_vec();
    oracle
        .challenge_first_lpp(addr(2), addr(1), UUID, &leaves[0], &proposal_proof(&oracle, 0))
        .unwrap();
    assert_eq!(oracle.credit_of(addr(2)), U256::from(10));
}

#[test]
fn proposals_check_bond_and_size() {
    let mut oracle = oracle();
    assert_eq!(
        oracle.init_lpp(addr(1), UUID, 0, MIN_PREIMAGE_SIZE, U256::from(9)),
        Err(LppError::InsufficientBond)
    );
    assert_eq!(
        oracle.init_lpp(addr(1), UUID, 0, MIN_PREIMAGE_SIZE - 1, U256::from(10)),
        Err(LppError::InvalidInputSize)
    );
    assert_eq!(
        oracle.init_lpp(addr(1), UUID, MIN_PREIMAGE_SIZE + 8, MIN_PREIMAGE_SIZE, U256::from(10)),
        Err(LppError::PartOffsetOob)
    );
    oracle.init_lpp(addr(1), UUID, 0, MIN_PREIMAGE_SIZE, U256::from(10)).unwrap();
    assert_eq!(
        oracle.init_lpp(addr(1), UUID, 0, MIN_PREIMAGE_SIZE, U256::from(10)),
        Err(LppError::AlreadyInitialized)
    );

    let block = [1u8; KECCAK_RATE];
    let (commitment, _) = commitments(&block, [0u64; 25], false);
    assert_eq!(
        oracle.add_leaves(addr(1), UUID, 1, &block, &commitment, false, 0),
        Err(LppError::WrongStartingBlock)
    );
    assert_eq!(
        oracle.add_leaves(addr(1), UUID, 0, &block[..100], &commitment, false, 0),
        Err(LppError::InvalidInputSize)
    );
    // finalizing short of the claimed size
    assert_eq!(
        oracle.add_leaves(addr(1), UUID, 0, &block, &commitment, true, 0),
        Err(LppError::InvalidInputSize)
    );
    assert_eq!(
        oracle.add_leaves(addr(9), UUID, 0, &block, &commitment, false, 0),
        Err(LppError::UnknownProposal)
    );
}
