use approx::assert_relative_eq;
use phylo_search::config::BranchLengthMode;
use phylo_search::distances::{kuhner_felsenstein, weighted_robinson_foulds};
use phylo_search::random::get_random_number_generator;
use phylo_search::{Tree, robinson_foulds};
use rstest::rstest;

#[rstest]
#[case(BranchLengthMode::Uniform)]
#[case(BranchLengthMode::Fixed)]
#[case(BranchLengthMode::Exponential)]
fn random_tree_depends_only_on_seed(#[case] mode: BranchLengthMode) {
    let a = Tree::generate_random(25, mode, 42).unwrap();
    let b = Tree::generate_random(25, mode, 42).unwrap();
    assert_eq!(a.to_newick(), b.to_newick());
    assert_eq!(a.num_leaves(), 25);
    assert!(a.is_binary());
    assert_eq!(a.num_edges(), 2 * 25 - 3);
}

#[test]
fn newick_round_trip_keeps_topology_and_lengths() {
    let tree = Tree::generate_random(30, BranchLengthMode::Exponential, 7).unwrap();
    let parsed = Tree::from_newick(&tree.to_newick()).unwrap();
    assert_eq!(robinson_foulds(&tree, &parsed).unwrap(), 0);
    assert_relative_eq!(tree.total_length(), parsed.total_length(), epsilon = 1e-6);
    assert!(weighted_robinson_foulds(&tree, &parsed).unwrap() < 1e-6);
}

#[test]
fn single_nni_changes_one_split() {
    let tree = Tree::generate_random(20, BranchLengthMode::Uniform, 3).unwrap();
    let mut rng = get_random_number_generator(11);
    for _ in 0..10 {
        let mv = tree.random_nni(&mut rng).unwrap();
        let moved = tree.apply_move(mv).unwrap();
        assert_eq!(robinson_foulds(&tree, &moved).unwrap(), 2);
        assert_eq!(robinson_foulds(&moved, &tree).unwrap(), 2);
    }
}

#[test]
fn distances_to_self_are_zero() {
    let tree = Tree::generate_random(12, BranchLengthMode::Uniform, 5).unwrap();
    assert_eq!(robinson_foulds(&tree, &tree).unwrap(), 0);
    assert_eq!(kuhner_felsenstein(&tree, &tree).unwrap(), 0.0);
}

#[test]
fn spr_keeps_taxa() {
    let tree = Tree::generate_random(15, BranchLengthMode::Uniform, 9).unwrap();
    let mut rng = get_random_number_generator(2);
    let mv = tree.random_spr(&mut rng, 3).unwrap();
    let moved = tree.apply_move(mv).unwrap();
    let mut before = tree.leaf_labels();
    let mut after = moved.leaf_labels();
    before.sort();
    after.sort();
    assert_eq!(before, after);
    assert!(moved.is_binary());
}
