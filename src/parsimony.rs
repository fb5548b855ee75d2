//! Multistate Fitch parsimony.
//!
//! # Algorithm
//! Site states are [`StateSet`] bitmasks, so Fitch's pass is a fold of
//! bitwise operations. At a node with `k` children every state is counted
//! over the children's sets; the node keeps the states seen most often and
//! the pattern pays `k - best_count` changes (Hartigan's generalization,
//! equal to Fitch for binary nodes). Unknown cells have every bit set and
//! never cost anything.
//!
//! Parsimony trees are built by stepwise addition in a random taxon order,
//! each taxon on the branch that costs least, then improved by NNI.

use std::collections::HashMap;

use log::debug;
use rand::Rng;
use rand::seq::SliceRandom;

use crate::alignment::{SitePatterns, StateSet};
use crate::error::{PhyloError, Result};
use crate::tree::{DEFAULT_BRANCH_LENGTH, Tree};

/// Scores trees against one set of site patterns.
pub struct Parsimony<'a> {
    patterns: &'a SitePatterns,
    rows: HashMap<&'a str, usize>,
    names: &'a [String],
}

impl<'a> Parsimony<'a> {
    /// `names[i]` is the taxon of `patterns.states[i]`.
    pub fn new(patterns: &'a SitePatterns, names: &'a [String]) -> Self {
        let rows = names.iter().enumerate().map(|(i, n)| (n.as_str(), i)).collect();
        Parsimony { patterns, rows, names }
    }

    pub fn names(&self) -> &[String] {
        self.names
    }

    /// Weighted number of changes `tree` needs.
    ///
    /// # Errors
    /// `TaxonSetMismatch` if a leaf is not one of the taxa.
    pub fn score(&self, tree: &Tree) -> Result<f64> {
        let npat = self.patterns.num_patterns();
        let mut sets: Vec<Vec<StateSet>> = vec![Vec::new(); tree.num_nodes()];
        let mut cost = vec![0.0; npat];
        let root = tree
            .edge(tree.reference_edge())
            .ends
            .into_iter()
            .find(|&n| !tree.is_leaf(n))
            .unwrap_or(0);

        for (node, _) in tree.postorder(root) {
            if tree.is_leaf(node) {
                let label = tree.label(node).unwrap_or("");
                let row = self.rows.get(label).ok_or_else(|| {
                    PhyloError::TaxonSetMismatch(format!("tree taxon '{label}' is not in the alignment"))
                })?;
                sets[node] = self.patterns.states[*row].clone();
                continue;
            }
            let children: Vec<usize> = tree
                .node(node)
                .edges
                .iter()
                .map(|&e| tree.other_end(e, node))
                .filter(|c| !sets[*c].is_empty())
                .collect();
            let mut merged = Vec::with_capacity(npat);
            for p in 0..npat {
                let (set, changes) = fitch_merge(children.iter().map(|&c| sets[c][p]));
                merged.push(set);
                cost[p] += changes as f64;
            }
            for c in children {
                sets[c] = Vec::new();
            }
            sets[node] = merged;
        }
        Ok(cost.iter().zip(&self.patterns.weights).map(|(c, w)| c * w).sum())
    }
}

/// States kept at a node and the changes paid, from its children's sets.
fn fitch_merge(children: impl Iterator<Item = StateSet>) -> (StateSet, u32) {
    let mut counts = [0u32; 64];
    let mut k = 0;
    for set in children {
        k += 1;
        let mut bits = set;
        while bits != 0 {
            counts[bits.trailing_zeros() as usize] += 1;
            bits &= bits - 1;
        }
    }
    let best = counts.iter().copied().max().unwrap_or(0);
    let set = counts
        .iter()
        .enumerate()
        .filter(|&(_, &c)| c == best && best > 0)
        .fold(0, |acc, (i, _)| acc | (1 << i));
    (set, k - best)
}

/// Randomized stepwise addition: taxa in shuffled order, each placed on the
/// cheapest branch (first one on ties).
///
/// # Errors
/// `InvalidParameter` for fewer than 3 taxa.
pub fn stepwise_addition(scorer: &Parsimony<'_>, rng: &mut impl Rng) -> Result<Tree> {
    let mut order: Vec<String> = scorer.names().to_vec();
    if order.len() < 3 {
        return Err(PhyloError::InvalidParameter(format!(
            "a parsimony tree needs at least 3 taxa, got {}",
            order.len()
        )));
    }
    order.shuffle(rng);

    let first: [String; 3] = [order[0].clone(), order[1].clone(), order[2].clone()];
    let mut placed: Vec<String> = first.to_vec();
    let mut tree = Tree::triplet(first, DEFAULT_BRANCH_LENGTH);
    for taxon in &order[3..] {
        placed.push(taxon.clone());
        let sub_names = placed.clone();
        let sub_rows: Vec<usize> = sub_names.iter().filter_map(|n| scorer.rows.get(n.as_str()).copied()).collect();
        let sub_patterns = SitePatterns {
            num_taxa: sub_rows.len(),
            num_states: scorer.patterns.num_states,
            states: sub_rows.iter().map(|&r| scorer.patterns.states[r].clone()).collect(),
            weights: scorer.patterns.weights.clone(),
            constant: scorer.patterns.constant.clone(),
            num_sites: scorer.patterns.num_sites,
        };
        let partial_scorer = Parsimony::new(&sub_patterns, &sub_names);

        let mut best: Option<(f64, Tree)> = None;
        for edge in 0..tree.num_edges() {
            let mut candidate = tree.clone();
            candidate.insert_leaf(edge, taxon.clone(), DEFAULT_BRANCH_LENGTH);
            let score = partial_scorer.score(&candidate)?;
            if best.as_ref().is_none_or(|(s, _)| score < *s) {
                best = Some((score, candidate));
            }
        }
        if let Some((_, t)) = best {
            tree = t;
        }
    }
    debug!("Stepwise addition placed {} taxa", order.len());
    Ok(tree)
}

/// Apply the best improving NNI until none improves. Returns the final score.
pub fn parsimony_nni(scorer: &Parsimony<'_>, tree: &mut Tree) -> Result<f64> {
    let mut current = scorer.score(tree)?;
    loop {
        let mut best: Option<(f64, Tree)> = None;
        for mv in tree.nni_moves() {
            let candidate = tree.apply_move(mv)?;
            let score = scorer.score(&candidate)?;
            if score < current && best.as_ref().is_none_or(|(s, _)| score < *s) {
                best = Some((score, candidate));
            }
        }
        match best {
            Some((score, t)) => {
                debug!("Parsimony NNI: {current} -> {score}");
                current = score;
                *tree = t;
            }
            None => return Ok(current),
        }
    }
}

/// Stepwise addition followed by parsimony NNI.
pub fn parsimony_tree(scorer: &Parsimony<'_>, rng: &mut impl Rng) -> Result<(Tree, f64)> {
    let mut tree = stepwise_addition(scorer, rng)?;
    let score = parsimony_nni(scorer, &mut tree)?;
    Ok((tree, score))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::parse_alignment;
    use crate::random::get_random_number_generator;

    const ALN: &str = "5 6\nA AAAAAC\nB AAAACC\nC CCAAGC\nD CCCAGT\nE CCCCGT\n";

    #[test]
    fn fitch_merge_rules() {
        assert_eq!(fitch_merge([0b0001, 0b0011].into_iter()), (0b0001, 0));
        assert_eq!(fitch_merge([0b0001, 0b0010].into_iter()), (0b0011, 1));
        assert_eq!(fitch_merge([0b0001, 0b0010, 0b0010].into_iter()), (0b0010, 1));
        assert_eq!(fitch_merge([0b1111, 0b0100].into_iter()), (0b0100, 0));
    }

    #[test]
    fn score_of_known_tree() {
        let aln = parse_alignment(ALN, "t", None).unwrap();
        let sites: Vec<usize> = (0..aln.num_sites()).collect();
        let patterns = aln.patterns(&sites);
        let scorer = Parsimony::new(&patterns, aln.names());
        let good = Tree::from_newick("((A,B),C,(D,E));").unwrap();
        let bad = Tree::from_newick("((A,E),C,(D,B));").unwrap();
        // one change per column except ACGGG, which needs two
        assert_eq!(scorer.score(&good).unwrap(), 7.0);
        assert!(scorer.score(&bad).unwrap() > 7.0);
    }

    #[test]
    fn search_finds_optimal_tree() {
        let aln = parse_alignment(ALN, "t", None).unwrap();
        let sites: Vec<usize> = (0..aln.num_sites()).collect();
        let patterns = aln.patterns(&sites);
        let scorer = Parsimony::new(&patterns, aln.names());
        let mut rng = get_random_number_generator(1);
        let (tree, score) = parsimony_tree(&scorer, &mut rng).unwrap();
        assert_eq!(score, 7.0);
        assert_eq!(tree.num_leaves(), 5);
        assert!(tree.is_binary());
    }

    #[test]
    fn same_seed_same_tree() {
        let aln = parse_alignment(ALN, "t", None).unwrap();
        let sites: Vec<usize> = (0..aln.num_sites()).collect();
        let patterns = aln.patterns(&sites);
        let scorer = Parsimony::new(&patterns, aln.names());
        let a = stepwise_addition(&scorer, &mut get_random_number_generator(9)).unwrap();
        let b = stepwise_addition(&scorer, &mut get_random_number_generator(9)).unwrap();
        assert_eq!(a.to_newick(), b.to_newick());
    }

    #[test]
    fn unknown_leaf() {
        let aln = parse_alignment(ALN, "t", None).unwrap();
        let patterns = aln.patterns(&[0, 1]);
        let scorer = Parsimony::new(&patterns, aln.names());
        let tree = Tree::from_newick("((A,B),C,(D,Z));").unwrap();
        assert!(matches!(scorer.score(&tree), Err(PhyloError::TaxonSetMismatch(_))));
    }
}
