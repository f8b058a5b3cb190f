use std::sync::Arc;

use alloy_primitives::{Address, B256, U256};
use alloy_sol_types::SolValue;
use tokio::sync::Mutex;

use super::fixtures::*;
use crate::{
    contract::claim_from_abi, preimage::PreimageOracle, Anchor, Clock, ContractError, FaultDisputeGame,
    GameContract, GameError, GameRecord, GameStatus, LocalGame, Position,
};

fn new_game(chain: &OutputChain) -> FaultDisputeGame {
    let anchor = Anchor { root: chain.root(100), block_number: 100 };
    FaultDisputeGame::new(small_config(2), addr(0xAA), addr(1), hash(1), hash(0x11), anchor, 104, U256::from(1), 0)
        .unwrap()
}

fn record_of(game: &FaultDisputeGame) -> GameRecord {
    GameRecord {
        config: *game.config(),
        address: game.address(),
        l1_head: hash(0x11),
        anchor: game.anchor(),
        l2_block_number: game.l2_block_number(),
        created_at: game.created_at(),
        claims: game.claims().to_vec(),
        resolved: Vec::new(),
        status: game.status(),
    }
}

#[test]
fn claim_data_decodes_the_root_and_its_packed_clock() {
    let clock = (7u128 << 64) | 1_700_000_000;
    let data = (u32::MAX, Address::ZERO, addr(3), 8u128, hash(5), 1u128, clock).abi_encode_params();
    let claim = claim_from_abi(&data).unwrap();
    assert!(claim.is_root());
    assert_eq!(claim.countered_by, None);
    assert_eq!(claim.claimant, addr(3));
    assert_eq!(claim.bond, U256::from(8));
    assert_eq!(claim.value, hash(5));
    assert_eq!(claim.position, Position::ROOT);
    assert_eq!(claim.clock, Clock { duration: 7, timestamp: 1_700_000_000 });

    let data = (4u32, addr(9), addr(3), 0u128, B256::ZERO, 5u128, 0u128).abi_encode_params();
    let claim = claim_from_abi(&data).unwrap();
    assert_eq!(claim.parent_index, Some(4));
    assert_eq!(claim.countered_by, Some(addr(9)));
    assert_eq!(claim.position, Position::new(2, 1));

    assert!(matches!(claim_from_abi(&data[..64]), Err(ContractError::Abi(_))));
}

#[test]
fn record_rebuilds_the_move_tree() {
    let chain = OutputChain::new(100, 104);
    let mut game = new_game(&chain);
    let config = *game.config();
    game.attack(addr(2), 0, hash(2), config.required_bond(Position::new(1, 0)), 10).unwrap();
    game.attack(addr(1), 1, hash(3), config.required_bond(Position::new(2, 0)), 20).unwrap();

    let mut rebuilt = FaultDisputeGame::from_record(record_of(&game)).unwrap();
    assert_eq!(rebuilt.claims(), game.claims());
    assert!(rebuilt.claim_exists(hash(3), Position::new(2, 0), 1));
    assert_eq!(
        rebuilt.attack(addr(4), 1, hash(3), config.required_bond(Position::new(2, 0)), 21),
        Err(GameError::ClaimAlreadyExists)
    );

    // Children are known, so the root waits for its subgame.
    let late = 20 + config.max_clock_duration;
    assert_eq!(rebuilt.resolve_claim(0, late), Err(GameError::OutOfOrderResolution));
    rebuilt.resolve_claim(2, late).unwrap();
    rebuilt.resolve_claim(1, late).unwrap();
    rebuilt.resolve_claim(0, late).unwrap();
    assert_eq!(rebuilt.claims()[1].countered_by, Some(addr(1)));
    assert_eq!(rebuilt.resolve(late), Ok(GameStatus::DefenderWins));

    let mut record = record_of(&game);
    record.claims.swap(1, 2);
    assert_eq!(FaultDisputeGame::from_record(record).unwrap_err(), GameError::UnknownClaim(1));
    let mut record = record_of(&game);
    record.claims.clear();
    assert_eq!(FaultDisputeGame::from_record(record).unwrap_err(), GameError::UnknownClaim(0));
}

#[tokio::test]
async fn local_game_plays_through_the_contract_interface() {
    let chain = OutputChain::new(100, 104);
    let contract = LocalGame::new(new_game(&chain), Arc::new(Mutex::new(PreimageOracle::default())), addr(2));
    assert_eq!(contract.address(), addr(0xAA));
    let bond = contract.snapshot().await.unwrap().config().required_bond(Position::new(1, 0));

    contract.make_move(0, hash(2), true, bond, 5).await.unwrap();
    let err = contract.make_move(0, hash(2), true, bond, 6).await.unwrap_err();
    assert!(matches!(err, ContractError::Game(GameError::ClaimAlreadyExists)));

    let snapshot = contract.snapshot().await.unwrap();
    assert_eq!(snapshot.claims().len(), 2);
    assert_eq!(snapshot.claims()[1].claimant, addr(2));

    let late = 5 + snapshot.config().max_clock_duration;
    assert!(matches!(contract.resolve(late).await, Err(ContractError::Game(GameError::OutOfOrderResolution))));
    contract.resolve_claim(1, late).await.unwrap();
    contract.resolve_claim(0, late).await.unwrap();
    assert_eq!(contract.resolve(late).await.unwrap(), GameStatus::ChallengerWins);
    assert_eq!(contract.claim_credit().await.unwrap(), U256::from(3));
}
