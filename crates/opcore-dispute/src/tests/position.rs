use alloy_primitives::U256;

use super::fixtures::*;
use crate::{
    trace::{OutputTraceProvider, SplitTraceProvider, TraceAccessor, TraceCache, TraceError, VmTraceCreator},
    Anchor, FaultDisputeGame, Position,
};

#[test]
fn depth_and_index_follow_the_generalized_index() {
    let pos = Position::new(5, 9);
    assert_eq!(pos.gindex(), (1 << 5) | 9);
    assert_eq!(pos.depth(), 5);
    assert_eq!(pos.index_at_depth(), 9);
    assert_eq!(pos.to_string(), "(5, 9)");
    assert_eq!(Position::ROOT.depth(), 0);
    assert!(Position::ROOT.is_root());
}

#[test]
fn attack_and_defend_land_on_the_expected_children() {
    let pos = Position::new(5, 9);
    assert_eq!(pos.attack(), Position::new(6, 18));
    assert_eq!(pos.defend(), Position::new(6, 20));
    assert_eq!(pos.make_move(true), pos.attack());
    assert_eq!(pos.attack().parent(), pos);
}

#[test]
fn trace_index_is_the_rightmost_leaf() {
    // depth 2 of a 4-deep tree covers 4 leaves each
    let pos = Position::new(2, 1);
    assert_eq!(pos.right_index(4), Position::new(4, 7));
    assert_eq!(pos.trace_index(4), 7);
    assert_eq!(Position::ROOT.trace_index(4), 15);
    // attacking halves towards the left, defending moves right
    assert_eq!(pos.attack().trace_index(4), 5);
    assert_eq!(pos.defend().trace_index(4), 9);
}

#[test]
fn rightmost_positions() {
    assert!(Position::ROOT.is_rightmost());
    assert!(Position::new(3, 7).is_rightmost());
    assert!(!Position::new(3, 6).is_rightmost());
}

#[test]
fn relative_positions_drop_the_prefix() {
    let pos = Position::new(6, 0b101101);
    assert_eq!(pos.ancestor_at(3), Position::new(3, 0b101));
    assert_eq!(pos.relative_to(3), Position::new(3, 0b101));
    assert_eq!(pos.relative_to(6), Position::ROOT);
    assert_eq!(Position::new(4, 0b1011).relative_to(2), Position::new(2, 0b11));
}

#[tokio::test]
async fn split_game_positions_map_to_blocks_then_execution() {
    const SPLIT: u8 = 5;
    let chain = OutputChain::new(20, 40);
    let config = small_config(SPLIT);
    let top = OutputTraceProvider::new(MockRollup::new(chain.roots.clone()), 20, 40, SPLIT);

    // index 9 of 32 at the split depth is the tenth block after the anchor
    let claim = Position::new(5, 9);
    assert_eq!(top.block_number(claim).unwrap(), 30);
    assert_eq!(top.block_number(Position::new(1, 0)).unwrap(), 36);
    assert_eq!(top.block_number(Position::new(5, 31)).unwrap(), 40);

    // attacking it leaves the output trace for the root of an execution sub-game
    let attack = claim.attack();
    assert_eq!(attack, Position::new(6, 18));
    assert!(attack.depth() > SPLIT);
    assert_eq!(attack.ancestor_at(SPLIT), claim);
    assert_eq!(attack.relative_to(SPLIT + 1), Position::ROOT);
    assert_eq!(config.exec_trace_index(attack), (1 << config.exec_depth()) - 1);

    let bottom = TraceCache::new(VmTraceCreator::new(successor_program(), chain.store(), config.exec_depth()));
    let trace = SplitTraceProvider::new(top, bottom, SPLIT);
    let anchor = Anchor { root: chain.root(20), block_number: 20 };
    let game = FaultDisputeGame::new(
        config,
        addr(0xAA),
        addr(1),
        chain.root(40),
        hash(0x11),
        anchor,
        40,
        U256::from(1),
        0,
    )
    .unwrap();

    assert_eq!(trace.get(&game, 0, claim).await.unwrap(), chain.root(30));
    // below the split the trace needs the output claim the sub-game hangs off
    assert!(matches!(trace.get(&game, 0, attack).await, Err(TraceError::Game(_))));
    assert_eq!(trace.bottom().len().await, 0);
}
