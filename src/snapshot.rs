//! Extract split snapshots from unrooted trees.
//!
//! # Overview
//! A TreeSnapshot captures all non-trivial bipartitions (splits) of a tree
//! along with their branch lengths. Snapshots are immutable and can be
//! compared with each other in parallel.
//!
//! # What is a bipartition?
//! Each internal branch divides the leaves into two groups:
//! ```text
//!   A           C
//!    \         /
//!     u ----- v        branch u-v creates {A,B} | {C,D}
//!    /         \
//!   B           D
//! ```
//!
//! Only one side of each split is stored: the side without taxon 0.
//!
//! # Taxon names, not node ids
//! Node ids depend on how a tree was parsed or built. Leaves are sorted
//! alphabetically by name so identical taxa map to the same bit in every tree.

use std::collections::{HashMap, HashSet};

use crate::bitset::Bitset;
use crate::error::{PhyloError, Result};
use crate::tree::{NodeId, Tree};

/// An immutable snapshot of the splits of an unrooted tree.
///
/// # Canonicalization
/// A split {A,B}|{C,D} can be read from either side of its branch. The side
/// containing taxon 0 (the first name alphabetically) is always flipped to
/// its complement, so identical splits have identical bitsets.
#[derive(Debug, Clone)]
pub struct TreeSnapshot {
    /// Canonical non-trivial splits.
    pub parts: HashSet<Bitset>,

    /// Branch length of each split.
    pub lengths: HashMap<Bitset, f64>,

    /// Leaf names, sorted; bit `i` is `taxa[i]`.
    pub taxa: Vec<String>,

    /// Number of u64 words in each bitset
    pub words: usize,
}

impl TreeSnapshot {
    /// Extract a snapshot from a tree.
    ///
    /// # Algorithm
    /// 1. Sort leaf names and map each leaf node to its rank
    /// 2. Post-order traversal from the neighbour of the first leaf, OR-ing
    ///    child bitsets into their parent
    /// 3. Every non-root node yields the split across its parent branch
    /// 4. Drop trivial splits and canonicalize the rest
    ///
    /// # Errors
    /// `MalformedInput` if a leaf has no name.
    pub fn from_tree(tree: &Tree) -> Result<Self> {
        let mut leaf_names: Vec<(NodeId, &str)> = tree
            .leaves()
            .into_iter()
            .map(|leaf| {
                tree.label(leaf)
                    .map(|name| (leaf, name))
                    .ok_or_else(|| PhyloError::MalformedInput("tree has an unnamed leaf".to_string()))
            })
            .collect::<Result<_>>()?;
        leaf_names.sort_by(|a, b| a.1.cmp(b.1));

        let num_leaves = leaf_names.len();
        let mut bits: Vec<Bitset> = vec![Bitset::empty(num_leaves); tree.num_nodes()];
        for (idx, &(leaf, _)) in leaf_names.iter().enumerate() {
            bits[leaf].insert(idx);
        }

        let mut parts = HashSet::new();
        let mut lengths = HashMap::new();
        let root = match leaf_names.first() {
            Some(&(leaf, _)) => tree.other_end(tree.node(leaf).edges[0], leaf),
            None => 0,
        };
        for (node, parent_edge) in tree.postorder(root) {
            let Some(edge) = parent_edge else { continue };
            let parent = tree.other_end(edge, node);
            let below = bits[node].clone();
            bits[parent].union_with(&below);
            if below.is_trivial(num_leaves) {
                continue;
            }
            let canonical = below.canonical(num_leaves);
            lengths.insert(canonical.clone(), tree.length(edge));
            parts.insert(canonical);
        }

        Ok(TreeSnapshot {
            parts,
            lengths,
            taxa: leaf_names.into_iter().map(|(_, name)| name.to_string()).collect(),
            words: Bitset::words_for(num_leaves),
        })
    }

    pub fn num_leaves(&self) -> usize {
        self.taxa.len()
    }

    /// Sorted splits: equal for two trees exactly when their topologies match.
    pub fn topology_key(&self) -> Vec<Bitset> {
        let mut key: Vec<Bitset> = self.parts.iter().cloned().collect();
        key.sort_unstable();
        key
    }

    /// # Errors
    /// `TaxonSetMismatch` naming a taxon that only one snapshot has.
    pub fn check_same_taxa(&self, other: &TreeSnapshot) -> Result<()> {
        if self.taxa == other.taxa {
            return Ok(());
        }
        let theirs: HashSet<&String> = other.taxa.iter().collect();
        let ours: HashSet<&String> = self.taxa.iter().collect();
        let culprit = self
            .taxa
            .iter()
            .find(|t| !theirs.contains(t))
            .or_else(|| other.taxa.iter().find(|t| !ours.contains(t)));
        Err(PhyloError::TaxonSetMismatch(match culprit {
            Some(name) => format!("taxon '{name}' is present in only one of the trees"),
            None => "trees have different taxon sets".to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn bits(idx: &[usize], num_taxa: usize) -> Bitset {
        Bitset::from_indices(num_taxa, idx.iter().copied())
    }

    /// Asymmetric tree with distinct splits
    ///
    /// ```text
    ///              root
    ///             /    \
    ///         node1     E
    ///         /   \
    ///     node2    D
    ///     /   \
    ///    A    node3
    ///         /   \
    ///        B     C
    /// ```
    ///
    /// Unrooted, the root disappears and node1 joins D, E and node2.
    /// Splits: {B,C} (no A, kept) and {A,B,C} (flipped to {D,E}).
    #[test]
    fn test_asymmetric_tree_splits() {
        let tree = Tree::from_newick("(((A:1,(B:1,C:1):0.3):0.2,D:1):1,E:1);").unwrap();
        let snap = TreeSnapshot::from_tree(&tree).unwrap();
        assert_eq!(snap.taxa, vec!["A", "B", "C", "D", "E"]);

        let bc = bits(&[1, 2], 5);
        let de = bits(&[3, 4], 5);
        assert_eq!(snap.parts.len(), 2);
        assert!(snap.parts.contains(&bc));
        assert!(snap.parts.contains(&de));
        assert_eq!(snap.lengths[&bc], 0.3);
        assert_eq!(snap.lengths[&de], 0.2);
    }

    /// The same split read from either side of its branch canonicalizes identically.
    ///
    /// ```text
    /// Tree 1: ((A,B),(C,D))   stores {C,D} = 0b1100
    /// Tree 2: ((C,D),(B,A))   stores {C,D} = 0b1100
    /// ```
    #[test]
    fn test_canonicalization() {
        let t1 = Tree::from_newick("((A,B),(C,D));").unwrap();
        let t2 = Tree::from_newick("((C,D),(B,A));").unwrap();
        let s1 = TreeSnapshot::from_tree(&t1).unwrap();
        let s2 = TreeSnapshot::from_tree(&t2).unwrap();
        assert_eq!(s1.topology_key(), vec![bits(&[2, 3], 4)]);
        assert_eq!(s1.topology_key(), s2.topology_key());
    }

    /// Leaf order in the file does not matter; names decide the bits.
    #[test]
    fn test_taxon_names_decide_bits() {
        let t1 = Tree::from_newick("((Human,Chimp),Gorilla,(Pongo,Hylobates));").unwrap();
        let t2 = Tree::from_newick("((Pongo,Hylobates),(Chimp,Human),Gorilla);").unwrap();
        let s1 = TreeSnapshot::from_tree(&t1).unwrap();
        let s2 = TreeSnapshot::from_tree(&t2).unwrap();
        assert_eq!(s1.taxa, s2.taxa);
        assert_eq!(s1.topology_key(), s2.topology_key());
    }

    #[test]
    fn test_star_tree_has_no_splits() {
        let tree = Tree::from_newick("(A,B,C,D,E);").unwrap();
        let snap = TreeSnapshot::from_tree(&tree).unwrap();
        assert!(snap.parts.is_empty());
    }

    #[test]
    fn test_large_tree_uses_two_words() {
        let tree = Tree::generate_random(70, crate::config::BranchLengthMode::Fixed, 11).unwrap();
        let snap = TreeSnapshot::from_tree(&tree).unwrap();
        assert_eq!(snap.words, 2);
        assert_eq!(snap.parts.len(), 70 - 3);
        assert!(snap.parts.iter().all(|p| !p.contains(0)));
    }

    #[test]
    fn test_taxon_mismatch() {
        let a = TreeSnapshot::from_tree(&Tree::from_newick("((A,B),(C,D));").unwrap()).unwrap();
        let b = TreeSnapshot::from_tree(&Tree::from_newick("((A,B),(C,E));").unwrap()).unwrap();
        let err = a.check_same_taxa(&b).unwrap_err();
        assert!(matches!(err, PhyloError::TaxonSetMismatch(msg) if msg.contains("'D'")));
    }
}
