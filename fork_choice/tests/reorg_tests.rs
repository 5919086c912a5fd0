//! Tip selection and branch switching

use containers::*;
use fork_choice::*;
use pretty_assertions::assert_eq;
use rstest::rstest;

mod common;
use common::*;

#[test]
fn test_shorter_side_branch_does_not_switch() {
    let params = test_params();
    let mut store = get_forkchoice_store(params.clone());
    let genesis = params.genesis_block();

    let main = extend(&genesis, 3, 1);
    for block in &main {
        on_block(&mut store, block.clone()).unwrap();
    }

    let side = extend(&genesis, 2, 2);
    for block in &side {
        let outcome = on_block(&mut store, block.clone()).unwrap();
        assert!(!outcome.is_new_tip);
    }

    assert_eq!(store.head.hash, main[2].hash());
    assert!(!store.is_main_chain(&side[1].hash()));
}

#[rstest]
#[case::one_deep(1, 2)]
#[case::three_deep(3, 4)]
#[case::from_genesis(5, 6)]
fn test_longer_branch_reorganizes(#[case] main_len: usize, #[case] side_len: usize) {
    let params = test_params();
    let mut store = get_forkchoice_store(params.clone());
    let genesis = params.genesis_block();

    let main = extend(&genesis, main_len, 1);
    for block in &main {
        on_block(&mut store, block.clone()).unwrap();
    }

    let side = extend(&genesis, side_len, 2);
    let mut reorg = None;
    for block in &side {
        let outcome = on_block(&mut store, block.clone()).unwrap();
        if outcome.reorg.is_some() {
            reorg = outcome.reorg;
        }
    }

    let reorg = reorg.expect("longer branch must trigger a reorg");
    assert_eq!(reorg.depth(), main_len);
    assert_eq!(reorg.disconnected[0].hash(), main[main_len - 1].hash());
    assert_eq!(reorg.connected.len(), main_len + 1);
    assert_eq!(reorg.connected[0].hash(), side[0].hash());

    assert_eq!(store.head, ChainTip::new(side[side_len - 1].hash(), Height(side_len as u64)));
    assert!(store.is_main_chain(&side[0].hash()));
    assert!(!store.is_main_chain(&main[0].hash()));
    assert_eq!(get_ancestor(&store, &store.head.hash, Height(0)), Some(params.genesis_hash()));
}

#[test]
fn test_fork_point_of_side_block() {
    let params = test_params();
    let mut store = get_forkchoice_store(params.clone());
    let genesis = params.genesis_block();

    let main = extend(&genesis, 4, 1);
    for block in &main {
        on_block(&mut store, block.clone()).unwrap();
    }
    let side = extend(&main[1], 1, 2);
    on_block(&mut store, side[0].clone()).unwrap();

    assert_eq!(find_fork_point(&store, &side[0].hash()), Some(main[1].hash()));
    assert_eq!(find_fork_point(&store, &main[3].hash()), Some(main[3].hash()));
}
