//! Tree distance metrics using bitset-based snapshots.
//!
//! This module implements three phylogenetic tree distance measures:
//!
//! 1. **Robinson-Foulds (RF)**: Counts the number of bipartitions that differ
//!    between two trees. Range: [0, 2n-6] where n is the number of leaves.
//!
//! 2. **Weighted Robinson-Foulds**: Like RF but considers branch lengths.
//!    For shared partitions, adds |length_a - length_b|.
//!    For unique partitions, adds the full branch length.
//!
//! 3. **Kuhner-Felsenstein (Branch Score)**: Similar to weighted RF but uses
//!    squared differences: sqrt(Σ(length_a - length_b)²)
//!
//! All metrics require both trees to have the same taxon set.

use std::fmt;
use std::str::FromStr;

use rayon::prelude::*;

use crate::error::{PhyloError, Result};
use crate::snapshot::TreeSnapshot;
use crate::tree::Tree;

/// Distance measure reported by `rf-distance`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Metric {
    Rf,
    Weighted,
    BranchScore,
}

impl FromStr for Metric {
    type Err = PhyloError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rf" => Ok(Metric::Rf),
            "weighted" | "wrf" => Ok(Metric::Weighted),
            "kf" | "branch-score" | "bs" => Ok(Metric::BranchScore),
            other => Err(PhyloError::InvalidParameter(format!("unknown distance metric '{other}'"))),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Metric::Rf => "RF",
            Metric::Weighted => "Weighted",
            Metric::BranchScore => "KF",
        })
    }
}

/// Compute Robinson-Foulds distance between two trees.
///
/// # Algorithm
/// RF = |A ∪ B| - |A ∩ B| = |A| + |B| - 2|A ∩ B|
///
/// Where A and B are the sets of bipartitions in each tree.
///
/// # Example
/// ```
/// # use phylo_search::tree::Tree;
/// # use phylo_search::distances::robinson_foulds;
/// let t1 = Tree::from_newick("((A,B),(C,D),E);").unwrap();
/// let t2 = Tree::from_newick("((A,C),(B,D),E);").unwrap();
/// assert_eq!(robinson_foulds(&t1, &t1).unwrap(), 0);
/// assert_eq!(robinson_foulds(&t1, &t2).unwrap(), 4);
/// ```
///
/// # Errors
/// `TaxonSetMismatch` if the trees have different leaf sets.
pub fn robinson_foulds(tree_a: &Tree, tree_b: &Tree) -> Result<usize> {
    let snap_a = TreeSnapshot::from_tree(tree_a)?;
    let snap_b = TreeSnapshot::from_tree(tree_b)?;
    snap_a.check_same_taxa(&snap_b)?;

    Ok(rf_from_snapshots(&snap_a, &snap_b))
}

/// Compute Robinson-Foulds distance from two pre-computed snapshots over the
/// same taxa, using HashSet intersection.
pub fn rf_from_snapshots(a: &TreeSnapshot, b: &TreeSnapshot) -> usize {
    let inter = a.parts.intersection(&b.parts).count();
    a.parts.len() + b.parts.len() - 2 * inter
}

/// Compute Weighted Robinson-Foulds distance between two trees.
///
/// # Algorithm
/// For each partition:
/// - If in both trees: add |length_a - length_b|
/// - If only in A: add length_a
/// - If only in B: add length_b
///
/// # Errors
/// `TaxonSetMismatch` if the trees have different leaf sets.
pub fn weighted_robinson_foulds(tree_a: &Tree, tree_b: &Tree) -> Result<f64> {
    let snap_a = TreeSnapshot::from_tree(tree_a)?;
    let snap_b = TreeSnapshot::from_tree(tree_b)?;
    snap_a.check_same_taxa(&snap_b)?;

    Ok(weighted_rf_from_snapshots(&snap_a, &snap_b))
}

pub fn weighted_rf_from_snapshots(a: &TreeSnapshot, b: &TreeSnapshot) -> f64 {
    let mut distance = 0.0;

    for part in &a.parts {
        let length_a = a.lengths.get(part).unwrap_or(&0.0);

        if let Some(length_b) = b.lengths.get(part) {
            distance += (length_a - length_b).abs();
        } else {
            distance += length_a;
        }
    }

    for part in &b.parts {
        if !a.parts.contains(part) {
            distance += b.lengths.get(part).unwrap_or(&0.0);
        }
    }

    distance
}

/// Compute Kuhner-Felsenstein (Branch Score) distance between two trees.
///
/// # Algorithm
/// Like Weighted RF but uses squared differences:
/// distance = sqrt(Σ (length_a - length_b)²)
///
/// # Errors
/// `TaxonSetMismatch` if the trees have different leaf sets.
pub fn kuhner_felsenstein(tree_a: &Tree, tree_b: &Tree) -> Result<f64> {
    let snap_a = TreeSnapshot::from_tree(tree_a)?;
    let snap_b = TreeSnapshot::from_tree(tree_b)?;
    snap_a.check_same_taxa(&snap_b)?;

    Ok(kf_from_snapshots(&snap_a, &snap_b))
}

pub fn kf_from_snapshots(a: &TreeSnapshot, b: &TreeSnapshot) -> f64 {
    let mut sum_squared = 0.0;

    for part in &a.parts {
        let length_a = a.lengths.get(part).unwrap_or(&0.0);

        if let Some(length_b) = b.lengths.get(part) {
            let diff = length_a - length_b;
            sum_squared += diff * diff;
        } else {
            sum_squared += length_a * length_a;
        }
    }

    for part in &b.parts {
        if !a.parts.contains(part) {
            let length_b = b.lengths.get(part).unwrap_or(&0.0);
            sum_squared += length_b * length_b;
        }
    }

    sum_squared.sqrt()
}

pub fn distance_from_snapshots(metric: Metric, a: &TreeSnapshot, b: &TreeSnapshot) -> f64 {
    match metric {
        Metric::Rf => rf_from_snapshots(a, b) as f64,
        Metric::Weighted => weighted_rf_from_snapshots(a, b),
        Metric::BranchScore => kf_from_snapshots(a, b),
    }
}

/// Snapshot every tree in parallel, checking that all share the first tree's taxa.
pub fn build_snapshots(trees: &[Tree]) -> Result<Vec<TreeSnapshot>> {
    let snaps: Vec<TreeSnapshot> = trees
        .par_iter()
        .map(TreeSnapshot::from_tree)
        .collect::<Result<_>>()?;
    if let Some(first) = snaps.first() {
        for snap in &snaps[1..] {
            first.check_same_taxa(snap)?;
        }
    }
    Ok(snaps)
}

/// Distances between every tree of `rows` and every tree of `cols`.
///
/// Pairs are evaluated in parallel; each entry only depends on its two snapshots.
pub fn cross_distance_matrix(metric: Metric, rows: &[TreeSnapshot], cols: &[TreeSnapshot]) -> Result<Vec<Vec<f64>>> {
    if let (Some(a), Some(b)) = (rows.first(), cols.first()) {
        a.check_same_taxa(b)?;
    }
    let m = cols.len();
    let cells: Vec<(usize, usize, f64)> = (0..rows.len())
        .into_par_iter()
        .flat_map_iter(|i| (0..m).map(move |j| (i, j)))
        .map(|(i, j)| (i, j, distance_from_snapshots(metric, &rows[i], &cols[j])))
        .collect();

    let mut matrix = vec![vec![0.0; m]; rows.len()];
    for (i, j, d) in cells {
        matrix[i][j] = d;
    }
    Ok(matrix)
}

/// Symmetric all-pairs matrix over one tree set.
pub fn pairwise_distance_matrix(metric: Metric, snaps: &[TreeSnapshot]) -> Vec<Vec<f64>> {
    let n = snaps.len();
    let pairs: Vec<(usize, usize, f64)> = (0..n)
        .into_par_iter()
        .flat_map_iter(|i| (i + 1..n).map(move |j| (i, j)))
        .map(|(i, j)| (i, j, distance_from_snapshots(metric, &snaps[i], &snaps[j])))
        .collect();

    let mut matrix = vec![vec![0.0; n]; n];
    for (i, j, d) in pairs {
        matrix[i][j] = d;
        matrix[j][i] = d;
    }
    matrix
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use itertools::Itertools;
    use pretty_assertions::assert_eq;

    // Trees and expected distances according to
    // https://evolution.genetics.washington.edu/phylip/doc/treedist.html
    const TREEDIST_TREES: [&str; 12] = [
        "(A:0.1,(B:0.1,(H:0.1,(D:0.1,(J:0.1,(((G:0.1,E:0.1):0.1,(F:0.1,I:0.1):0.1):0.1,C:0.1):0.1):0.1):0.1):0.1):0.1);",
        "(A:0.1,(B:0.1,(D:0.1,((J:0.1,H:0.1):0.1,(((G:0.1,E:0.1):0.1,(F:0.1,I:0.1):0.1):0.1,C:0.1):0.1):0.1):0.1):0.1);",
        "(A:0.1,(B:0.1,(D:0.1,(H:0.1,(J:0.1,(((G:0.1,E:0.1):0.1,(F:0.1,I:0.1):0.1):0.1,C:0.1):0.1):0.1):0.1):0.1):0.1);",
        "(A:0.1,(B:0.1,(E:0.1,(G:0.1,((F:0.1,I:0.1):0.1,((J:0.1,(H:0.1,D:0.1):0.1):0.1,C:0.1):0.1):0.1):0.1):0.1):0.1);",
        "(A:0.1,(B:0.1,(E:0.1,(G:0.1,((F:0.1,I:0.1):0.1,(((J:0.1,H:0.1):0.1,D:0.1):0.1,C:0.1):0.1):0.1):0.1):0.1):0.1);",
        "(A:0.1,(B:0.1,(E:0.1,((F:0.1,I:0.1):0.1,(G:0.1,((J:0.1,(H:0.1,D:0.1):0.1):0.1,C:0.1):0.1):0.1):0.1):0.1):0.1);",
        "(A:0.1,(B:0.1,(E:0.1,((F:0.1,I:0.1):0.1,(G:0.1,(((J:0.1,H:0.1):0.1,D:0.1):0.1,C:0.1):0.1):0.1):0.1):0.1):0.1);",
        "(A:0.1,(B:0.1,(E:0.1,((G:0.1,(F:0.1,I:0.1):0.1):0.1,((J:0.1,(H:0.1,D:0.1):0.1):0.1,C:0.1):0.1):0.1):0.1):0.1);",
        "(A:0.1,(B:0.1,(E:0.1,((G:0.1,(F:0.1,I:0.1):0.1):0.1,(((J:0.1,H:0.1):0.1,D:0.1):0.1,C:0.1):0.1):0.1):0.1):0.1);",
        "(A:0.1,(B:0.1,(E:0.1,(G:0.1,((F:0.1,I:0.1):0.1,((J:0.1,(H:0.1,D:0.1):0.1):0.1,C:0.1):0.1):0.1):0.1):0.1):0.1);",
        "(A:0.1,(B:0.1,(D:0.1,(H:0.1,(J:0.1,(((G:0.1,E:0.1):0.1,(F:0.1,I:0.1):0.1):0.1,C:0.1):0.1):0.1):0.1):0.1):0.1);",
        "(A:0.1,(B:0.1,(E:0.1,((G:0.1,(F:0.1,I:0.1):0.1):0.1,((J:0.1,(H:0.1,D:0.1):0.1):0.1,C:0.1):0.1):0.1):0.1):0.1);",
    ];

    const TREEDIST_RF: [[usize; 12]; 12] = [
        [0, 4, 2, 10, 10, 10, 10, 10, 10, 10, 2, 10],
        [4, 0, 2, 10, 8, 10, 8, 10, 8, 10, 2, 10],
        [2, 2, 0, 10, 10, 10, 10, 10, 10, 10, 0, 10],
        [10, 10, 10, 0, 2, 2, 4, 2, 4, 0, 10, 2],
        [10, 8, 10, 2, 0, 4, 2, 4, 2, 2, 10, 4],
        [10, 10, 10, 2, 4, 0, 2, 2, 4, 2, 10, 2],
        [10, 8, 10, 4, 2, 2, 0, 4, 2, 4, 10, 4],
        [10, 10, 10, 2, 4, 2, 4, 0, 2, 2, 10, 0],
        [10, 8, 10, 4, 2, 4, 2, 2, 0, 4, 10, 2],
        [10, 10, 10, 0, 2, 2, 4, 2, 4, 0, 10, 2],
        [2, 2, 0, 10, 10, 10, 10, 10, 10, 10, 0, 10],
        [10, 10, 10, 2, 4, 2, 4, 0, 2, 2, 10, 0],
    ];

    const TREEDIST_WEIGHTED: [[f64; 12]; 12] = [
        [0., 0.4, 0.2, 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.2, 0.9999999999999999],
        [0.4, 0., 0.2, 0.9999999999999999, 0.7999999999999999, 0.9999999999999999, 0.7999999999999999, 0.9999999999999999, 0.7999999999999999, 0.9999999999999999, 0.2, 0.9999999999999999],
        [0.2, 0.2, 0., 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0., 0.9999999999999999],
        [0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0., 0.2, 0.2, 0.4, 0.2, 0.4, 0., 0.9999999999999999, 0.2],
        [0.9999999999999999, 0.7999999999999999, 0.9999999999999999, 0.2, 0., 0.4, 0.2, 0.4, 0.2, 0.2, 0.9999999999999999, 0.4],
        [0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.2, 0.4, 0., 0.2, 0.2, 0.4, 0.2, 0.9999999999999999, 0.2],
        [0.9999999999999999, 0.7999999999999999, 0.9999999999999999, 0.4, 0.2, 0.2, 0., 0.4, 0.2, 0.4, 0.9999999999999999, 0.4],
        [0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.2, 0.4, 0.2, 0.4, 0., 0.2, 0.2, 0.9999999999999999, 0.],
        [0.9999999999999999, 0.7999999999999999, 0.9999999999999999, 0.4, 0.2, 0.4, 0.2, 0.2, 0., 0.4, 0.9999999999999999, 0.2],
        [0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0., 0.2, 0.2, 0.4, 0.2, 0.4, 0., 0.9999999999999999, 0.2],
        [0.2, 0.2, 0., 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0., 0.9999999999999999],
        [0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.2, 0.4, 0.2, 0.4, 0., 0.2, 0.2, 0.9999999999999999, 0.],
    ];

    const TREEDIST_BRANCH_SCORE: [[f64; 12]; 12] = [
        [0., 0.2, 0.14142135623730953, 0.316227766016838, 0.316227766016838, 0.316227766016838, 0.316227766016838, 0.316227766016838, 0.316227766016838, 0.316227766016838, 0.14142135623730953, 0.316227766016838],
        [0.2, 0., 0.14142135623730953, 0.316227766016838, 0.28284271247461906, 0.316227766016838, 0.28284271247461906, 0.316227766016838, 0.28284271247461906, 0.316227766016838, 0.14142135623730953, 0.316227766016838],
        [0.14142135623730953, 0.14142135623730953, 0., 0.316227766016838, 0.316227766016838, 0.316227766016838, 0.316227766016838, 0.316227766016838, 0.316227766016838, 0.316227766016838, 0., 0.316227766016838],
        [0.316227766016838, 0.316227766016838, 0.316227766016838, 0., 0.14142135623730953, 0.14142135623730953, 0.2, 0.14142135623730953, 0.2, 0., 0.316227766016838, 0.14142135623730953],
        [0.316227766016838, 0.28284271247461906, 0.316227766016838, 0.14142135623730953, 0., 0.2, 0.14142135623730953, 0.2, 0.14142135623730953, 0.14142135623730953, 0.316227766016838, 0.2],
        [0.316227766016838, 0.316227766016838, 0.316227766016838, 0.14142135623730953, 0.2, 0., 0.14142135623730953, 0.14142135623730953, 0.2, 0.14142135623730953, 0.316227766016838, 0.14142135623730953],
        [0.316227766016838, 0.28284271247461906, 0.316227766016838, 0.2, 0.14142135623730953, 0.14142135623730953, 0., 0.2, 0.14142135623730953, 0.2, 0.316227766016838, 0.2],
        [0.316227766016838, 0.316227766016838, 0.316227766016838, 0.14142135623730953, 0.2, 0.14142135623730953, 0.2, 0., 0.14142135623730953, 0.14142135623730953, 0.316227766016838, 0.],
        [0.316227766016838, 0.28284271247461906, 0.316227766016838, 0.2, 0.14142135623730953, 0.2, 0.14142135623730953, 0.14142135623730953, 0., 0.2, 0.316227766016838, 0.14142135623730953],
        [0.316227766016838, 0.316227766016838, 0.316227766016838, 0., 0.14142135623730953, 0.14142135623730953, 0.2, 0.14142135623730953, 0.2, 0., 0.316227766016838, 0.14142135623730953],
        [0.14142135623730953, 0.14142135623730953, 0., 0.316227766016838, 0.316227766016838, 0.316227766016838, 0.316227766016838, 0.316227766016838, 0.316227766016838, 0.316227766016838, 0., 0.316227766016838],
        [0.316227766016838, 0.316227766016838, 0.316227766016838, 0.14142135623730953, 0.2, 0.14142135623730953, 0.2, 0., 0.14142135623730953, 0.14142135623730953, 0.316227766016838, 0.],
    ];

    fn treedist_trees() -> Vec<Tree> {
        TREEDIST_TREES.iter().map(|s| Tree::from_newick(s).unwrap()).collect()
    }

    #[test]
    fn robinson_foulds_treedist() {
        let trees = treedist_trees();
        for indices in (0..trees.len()).combinations(2) {
            let (i0, i1) = (indices[0], indices[1]);
            assert_eq!(robinson_foulds(&trees[i0], &trees[i1]).unwrap(), TREEDIST_RF[i0][i1]);
        }
    }

    #[test]
    fn weighted_robinson_foulds_treedist() {
        let trees = treedist_trees();
        for indices in (0..trees.len()).combinations(2) {
            let (i0, i1) = (indices[0], indices[1]);
            let d = weighted_robinson_foulds(&trees[i0], &trees[i1]).unwrap();
            assert_abs_diff_eq!(d, TREEDIST_WEIGHTED[i0][i1], epsilon = 1e-12);
        }
    }

    #[test]
    fn kuhner_felsenstein_treedist() {
        let trees = treedist_trees();
        for indices in (0..trees.len()).combinations(2) {
            let (i0, i1) = (indices[0], indices[1]);
            let d = kuhner_felsenstein(&trees[i0], &trees[i1]).unwrap();
            assert_abs_diff_eq!(d, TREEDIST_BRANCH_SCORE[i0][i1], epsilon = 1e-12);
        }
    }

    #[test]
    fn pairwise_matrix_matches_single_calls() {
        let trees = treedist_trees();
        let snaps = build_snapshots(&trees).unwrap();
        let matrix = pairwise_distance_matrix(Metric::Rf, &snaps);
        for i in 0..trees.len() {
            for j in 0..trees.len() {
                assert_eq!(matrix[i][j] as usize, TREEDIST_RF[i][j]);
            }
        }
        let cross = cross_distance_matrix(Metric::Rf, &snaps[..2], &snaps).unwrap();
        assert_eq!(cross.len(), 2);
        assert_eq!(cross[1], matrix[1]);
    }

    #[test]
    fn distance_to_self_is_zero() {
        let t = Tree::generate_random(15, crate::config::BranchLengthMode::Exponential, 8).unwrap();
        assert_eq!(robinson_foulds(&t, &t).unwrap(), 0);
        assert_eq!(weighted_robinson_foulds(&t, &t).unwrap(), 0.0);
        assert_eq!(kuhner_felsenstein(&t, &t).unwrap(), 0.0);
    }

    #[test]
    fn different_taxa_are_rejected() {
        let a = Tree::from_newick("((A,B),(C,D));").unwrap();
        let b = Tree::from_newick("((A,B),(C,X));").unwrap();
        assert!(matches!(robinson_foulds(&a, &b), Err(PhyloError::TaxonSetMismatch(_))));
        assert!(matches!(build_snapshots(&[a, b]), Err(PhyloError::TaxonSetMismatch(_))));
    }

    #[test]
    fn metric_names() {
        assert_eq!("rf".parse::<Metric>().unwrap(), Metric::Rf);
        assert_eq!("KF".parse::<Metric>().unwrap(), Metric::BranchScore);
        assert!("euclid".parse::<Metric>().is_err());
    }
}
