//! Starting trees from pairwise distances.
//!
//! # Algorithm
//! Distances are Jukes-Cantor corrected p-distances generalized to `n` states
//! (`d = -(n-1)/n · ln(1 - n/(n-1) · p)`), counted over columns where both
//! taxa have a resolved state. The tree is built by BIONJ (Gascuel 1997):
//! neighbour joining where the joined node's distances are a variance-weighted
//! average of its children's.
//!
//! ```text
//! Q(a,b)  = (n-2)·d(a,b) - R(a) - R(b)                 pick the minimum
//! δa      = d(a,b)/2 + (R(a) - R(b)) / (2(n-2))          branch to a
//! λ       = 1/2 + Σ_i (V(b,i) - V(a,i)) / (2(n-2)·V(a,b)), clamped to [0,1]
//! d(c,i)  = λ·d(a,i) + (1-λ)·d(b,i) - λ·δa - (1-λ)·δb
//! V(c,i)  = λ·V(a,i) + (1-λ)·V(b,i) - λ(1-λ)·V(a,b)
//! ```

use log::debug;
use rayon::prelude::*;

use crate::alignment::SitePatterns;
use crate::error::{PhyloError, Result};
use crate::tree::{NodeId, Tree};

/// Distance given to pairs with no comparable sites or saturated differences.
pub const MAX_DISTANCE: f64 = 10.0;

/// JC-corrected distance matrix between the taxa of `patterns`.
pub fn jc_distances(patterns: &SitePatterns) -> Vec<Vec<f64>> {
    let n = patterns.num_taxa;
    let k = patterns.num_states as f64;
    let cells: Vec<(usize, usize, f64)> = (0..n)
        .into_par_iter()
        .flat_map_iter(|i| (i + 1..n).map(move |j| (i, j)))
        .map(|(i, j)| {
            let (mut compared, mut differ) = (0.0, 0.0);
            for ((&a, &b), &w) in patterns.states[i].iter().zip(&patterns.states[j]).zip(&patterns.weights) {
                if a.count_ones() == 1 && b.count_ones() == 1 {
                    compared += w;
                    if a != b {
                        differ += w;
                    }
                }
            }
            let d = if compared == 0.0 {
                MAX_DISTANCE
            } else {
                let p = differ / compared;
                let arg = 1.0 - k / (k - 1.0) * p;
                if arg <= 0.0 { MAX_DISTANCE } else { (-(k - 1.0) / k * arg.ln()).min(MAX_DISTANCE) }
            };
            (i, j, d)
        })
        .collect();

    let mut matrix = vec![vec![0.0; n]; n];
    for (i, j, d) in cells {
        matrix[i][j] = d;
        matrix[j][i] = d;
    }
    matrix
}

/// BIONJ tree from a symmetric distance matrix. Negative branch lengths are
/// set to 0.
///
/// # Errors
/// `InvalidParameter` for fewer than 3 taxa or a matrix of the wrong shape.
pub fn bionj(names: &[String], distances: &[Vec<f64>]) -> Result<Tree> {
    let n0 = names.len();
    if n0 < 3 {
        return Err(PhyloError::InvalidParameter(format!("BIONJ needs at least 3 taxa, got {n0}")));
    }
    if distances.len() != n0 || distances.iter().any(|row| row.len() != n0) {
        return Err(PhyloError::InvalidParameter(format!(
            "distance matrix is not {n0} x {n0}"
        )));
    }

    let mut d: Vec<Vec<f64>> = distances.to_vec();
    let mut v: Vec<Vec<f64>> = distances.to_vec();
    // active[row] = arena node of that row
    let mut active: Vec<NodeId> = (0..n0).collect();
    let mut labels: Vec<Option<String>> = names.iter().cloned().map(Some).collect();
    let mut edges: Vec<(NodeId, NodeId, f64)> = Vec::with_capacity(2 * n0 - 3);

    while active.len() > 3 {
        let n = active.len();
        let nf = n as f64;
        let totals: Vec<f64> = (0..n).map(|i| d[i].iter().sum()).collect();

        let (mut a, mut b, mut best) = (0, 1, f64::INFINITY);
        for i in 0..n {
            for j in i + 1..n {
                let q = (nf - 2.0) * d[i][j] - totals[i] - totals[j];
                if q < best {
                    (a, b, best) = (i, j, q);
                }
            }
        }

        let dab = d[a][b];
        let la = 0.5 * dab + (totals[a] - totals[b]) / (2.0 * (nf - 2.0));
        let lb = dab - la;
        let vab = v[a][b];
        let lambda = if vab == 0.0 {
            0.5
        } else {
            let sum: f64 = (0..n).filter(|&i| i != a && i != b).map(|i| v[b][i] - v[a][i]).sum();
            (0.5 + sum / (2.0 * (nf - 2.0) * vab)).clamp(0.0, 1.0)
        };
        let mu = 1.0 - lambda;

        let c = labels.len();
        labels.push(None);
        edges.push((active[a], c, la.max(0.0)));
        edges.push((active[b], c, lb.max(0.0)));

        for i in 0..n {
            if i == a || i == b {
                continue;
            }
            let dci = lambda * d[a][i] + mu * d[b][i] - lambda * la - mu * lb;
            let vci = lambda * v[a][i] + mu * v[b][i] - lambda * mu * vab;
            d[a][i] = dci;
            d[i][a] = dci;
            v[a][i] = vci;
            v[i][a] = vci;
        }
        d[a][a] = 0.0;
        v[a][a] = 0.0;
        active[a] = c;

        active.remove(b);
        d.remove(b);
        v.remove(b);
        for row in d.iter_mut().chain(v.iter_mut()) {
            row.remove(b);
        }
    }

    let centre = labels.len();
    labels.push(None);
    let half = |x: f64| 0.5 * x;
    let lengths = [
        half(d[0][1]) + half(d[0][2]) - half(d[1][2]),
        half(d[0][1]) + half(d[1][2]) - half(d[0][2]),
        half(d[0][2]) + half(d[1][2]) - half(d[0][1]),
    ];
    for (row, length) in lengths.into_iter().enumerate() {
        edges.push((active[row], centre, length.max(0.0)));
    }
    debug!("BIONJ joined {n0} taxa");
    Tree::from_edges(labels, &edges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::parse_alignment;
    use crate::distances::robinson_foulds;
    use approx::assert_abs_diff_eq;

    fn names(n: usize) -> Vec<String> {
        ["A", "B", "C", "D", "E", "F"][..n].iter().map(|s| s.to_string()).collect()
    }

    /// Additive distances of ((A:1,B:2):1,C:3,(D:1,E:1):2) are recovered exactly.
    #[test]
    fn recovers_additive_tree() {
        let truth = Tree::from_newick("((A:1,B:2):1,C:3,(D:1,E:1):2);").unwrap();
        let tips: Vec<String> = names(5);
        let path = |x: &str, y: &str| -> f64 {
            let table = [
                ("A", "B", 3.0),
                ("A", "C", 5.0),
                ("A", "D", 5.0),
                ("A", "E", 5.0),
                ("B", "C", 6.0),
                ("B", "D", 6.0),
                ("B", "E", 6.0),
                ("C", "D", 6.0),
                ("C", "E", 6.0),
                ("D", "E", 2.0),
            ];
            table
                .iter()
                .find(|(a, b, _)| (*a == x && *b == y) || (*a == y && *b == x))
                .map_or(0.0, |t| t.2)
        };
        let matrix: Vec<Vec<f64>> = tips.iter().map(|x| tips.iter().map(|y| path(x, y)).collect()).collect();
        let tree = bionj(&tips, &matrix).unwrap();
        assert!(tree.is_binary());
        assert_eq!(robinson_foulds(&tree, &truth).unwrap(), 0);
        assert_abs_diff_eq!(tree.total_length(), truth.total_length(), epsilon = 1e-9);
    }

    #[test]
    fn three_taxa_star() {
        let m = vec![vec![0.0, 0.3, 0.4], vec![0.3, 0.0, 0.5], vec![0.4, 0.5, 0.0]];
        let tree = bionj(&names(3), &m).unwrap();
        assert_eq!(tree.num_edges(), 3);
        assert_abs_diff_eq!(tree.total_length(), 0.6, epsilon = 1e-12);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(bionj(&names(2), &[vec![0.0, 1.0], vec![1.0, 0.0]]).is_err());
        assert!(bionj(&names(3), &[vec![0.0; 3]]).is_err());
    }

    #[test]
    fn jc_distance_values() {
        let aln = parse_alignment("3 4\nA ACGT\nB ACGA\nC AC--\n", "t", None).unwrap();
        let sites: Vec<usize> = (0..4).collect();
        let d = jc_distances(&aln.patterns(&sites));
        let expected = -0.75 * (1.0 - 4.0 / 3.0 * 0.25_f64).ln();
        assert_abs_diff_eq!(d[0][1], expected, epsilon = 1e-12);
        assert_abs_diff_eq!(d[0][2], 0.0, epsilon = 1e-12);
        assert_eq!(d[1][0], d[0][1]);
    }
}
