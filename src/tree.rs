//! Unrooted phylogenetic trees stored as an arena of nodes and edges.
//!
//! # Representation
//! Nodes and edges live in two vectors and refer to each other by index.
//! A node with exactly one edge is a leaf and carries the taxon label;
//! internal nodes are unlabeled and have degree 3 once a tree is fully
//! built (degree 3 is required by the topology moves). Edge and node indices
//! are stable under [`Move`]s, which only rewire endpoints, so cached data
//! keyed by index stays addressable across a search.
//!
//! ```text
//!   A           C
//!    \         /
//!     u ----- v        edges: A-u, B-u, u-v, v-C, v-D
//!    /         \
//!   B           D
//! ```
//!
//! # Newick
//! Parsing goes through `phylotree`; degree-2 nodes (including a rooted
//! tree's root) are suppressed and their branch lengths summed. Writing roots
//! the tree at the outgroup's neighbour and prints lengths with the shortest
//! representation that round-trips exactly.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write as _;

use log::warn;
use rand::Rng;
use rand_distr::{Distribution, Exp};
use serde::{Deserialize, Serialize};

use crate::config::BranchLengthMode;
use crate::error::{PhyloError, Result};
use crate::io::strip_newick_comments;
use crate::random::{get_random_number_generator, random_choice_maybe};

pub type NodeId = usize;
pub type EdgeId = usize;

/// Branch length given to new edges before optimization.
pub const DEFAULT_BRANCH_LENGTH: f64 = 0.1;

/// Bounds used by random branch lengths.
const RANDOM_LENGTH_MIN: f64 = 0.000001;
const RANDOM_LENGTH_MEAN: f64 = 0.1;
const RANDOM_LENGTH_MAX: f64 = 0.999999;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub label: Option<String>,
    pub edges: Vec<EdgeId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub ends: [NodeId; 2],
    pub length: f64,
}

/// One topology rearrangement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Move {
    /// Nearest-neighbour interchange around internal `edge`. With `u`,`v`
    /// its ends and `a < b`, `c < d` the other edges at `u` and `v`,
    /// variant 0 swaps `b` with `c` and variant 1 swaps `b` with `d`.
    Nni { edge: EdgeId, variant: u8 },
    /// Subtree prune and regraft: detach the subtree rooted at `subtree`
    /// (an end of `prune_edge`) and reattach it on `regraft_edge`.
    Spr {
        prune_edge: EdgeId,
        subtree: NodeId,
        regraft_edge: EdgeId,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
}

impl Tree {
    /// Three leaves around one internal node.
    pub fn triplet(labels: [String; 3], length: f64) -> Tree {
        let mut nodes = vec![Node { label: None, edges: vec![0, 1, 2] }];
        let mut edges = Vec::with_capacity(3);
        for (i, label) in labels.into_iter().enumerate() {
            nodes.push(Node { label: Some(label), edges: vec![i] });
            edges.push(Edge { ends: [0, i + 1], length });
        }
        Tree { nodes, edges }
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id]
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    #[inline]
    pub fn is_leaf(&self, node: NodeId) -> bool {
        self.nodes[node].edges.len() == 1
    }

    pub fn leaves(&self) -> Vec<NodeId> {
        (0..self.nodes.len()).filter(|&n| self.is_leaf(n)).collect()
    }

    pub fn num_leaves(&self) -> usize {
        self.nodes.iter().filter(|n| n.edges.len() == 1).count()
    }

    pub fn label(&self, node: NodeId) -> Option<&str> {
        self.nodes[node].label.as_deref()
    }

    pub fn leaf_labels(&self) -> Vec<String> {
        self.leaves()
            .into_iter()
            .filter_map(|n| self.nodes[n].label.clone())
            .collect()
    }

    pub fn find_leaf(&self, label: &str) -> Option<NodeId> {
        self.leaves()
            .into_iter()
            .find(|&n| self.nodes[n].label.as_deref() == Some(label))
    }

    #[inline]
    pub fn other_end(&self, edge: EdgeId, node: NodeId) -> NodeId {
        let [a, b] = self.edges[edge].ends;
        if a == node { b } else { a }
    }

    /// Index (0 or 1) of `node` within `edge.ends`.
    #[inline]
    pub fn side_of(&self, edge: EdgeId, node: NodeId) -> usize {
        if self.edges[edge].ends[0] == node { 0 } else { 1 }
    }

    pub fn is_internal_edge(&self, edge: EdgeId) -> bool {
        let [a, b] = self.edges[edge].ends;
        !self.is_leaf(a) && !self.is_leaf(b)
    }

    pub fn internal_edges(&self) -> Vec<EdgeId> {
        (0..self.edges.len()).filter(|&e| self.is_internal_edge(e)).collect()
    }

    pub fn length(&self, edge: EdgeId) -> f64 {
        self.edges[edge].length
    }

    pub fn set_length(&mut self, edge: EdgeId, length: f64) {
        self.edges[edge].length = length;
    }

    pub fn total_length(&self) -> f64 {
        self.edges.iter().map(|e| e.length).sum()
    }

    pub fn is_binary(&self) -> bool {
        self.nodes.iter().all(|n| n.edges.len() == 1 || n.edges.len() == 3)
    }

    /// Edge used as the evaluation point for whole-tree scores: the branch of
    /// the leaf with the smallest node index.
    pub fn reference_edge(&self) -> EdgeId {
        self.leaves()
            .first()
            .map(|&leaf| self.nodes[leaf].edges[0])
            .unwrap_or(0)
    }

    /// Post-order traversal from `root`: every node after all nodes below it,
    /// paired with the edge leading to its parent.
    pub fn postorder(&self, root: NodeId) -> Vec<(NodeId, Option<EdgeId>)> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![(root, None, false)];
        while let Some((node, parent_edge, expanded)) = stack.pop() {
            if expanded {
                order.push((node, parent_edge));
                continue;
            }
            stack.push((node, parent_edge, true));
            for &e in self.nodes[node].edges.iter().rev() {
                if Some(e) != parent_edge {
                    stack.push((self.other_end(e, node), Some(e), false));
                }
            }
        }
        order
    }

    /// Split `edge` in two and hang a new leaf from the midpoint.
    pub fn insert_leaf(&mut self, edge: EdgeId, label: String, length: f64) -> NodeId {
        let [u, v] = self.edges[edge].ends;
        let half = self.edges[edge].length / 2.0;
        let w = self.nodes.len();
        let x = w + 1;
        let f = self.edges.len();
        let g = f + 1;

        self.edges[edge].ends = [u, w];
        self.edges[edge].length = half;
        self.edges.push(Edge { ends: [w, v], length: half });
        self.edges.push(Edge { ends: [w, x], length });
        replace_edge(&mut self.nodes[v].edges, edge, f);
        self.nodes.push(Node { label: None, edges: vec![edge, f, g] });
        self.nodes.push(Node { label: Some(label), edges: vec![g] });
        x
    }

    /// Random binary topology: leaves inserted one by one on uniformly chosen edges.
    pub fn random_topology(labels: &[String], rng: &mut impl Rng) -> Result<Tree> {
        if labels.len() < 3 {
            return Err(PhyloError::InvalidParameter(format!(
                "a tree needs at least 3 taxa, got {}",
                labels.len()
            )));
        }
        let mut tree = Tree::triplet(
            [labels[0].clone(), labels[1].clone(), labels[2].clone()],
            DEFAULT_BRANCH_LENGTH,
        );
        for label in &labels[3..] {
            let edge = rng.gen_range(0..tree.num_edges());
            tree.insert_leaf(edge, label.clone(), DEFAULT_BRANCH_LENGTH);
        }
        Ok(tree)
    }

    /// Random tree over taxa `T1..Tn`, fully determined by `seed`.
    ///
    /// # Errors
    /// `InvalidParameter` if `num_taxa < 3`.
    pub fn generate_random(num_taxa: usize, mode: BranchLengthMode, seed: u64) -> Result<Tree> {
        if num_taxa < 3 {
            return Err(PhyloError::InvalidParameter(format!(
                "random tree needs at least 3 taxa, got {num_taxa}"
            )));
        }
        let mut rng = get_random_number_generator(seed);
        let labels: Vec<String> = (1..=num_taxa).map(|i| format!("T{i}")).collect();
        let mut tree = Tree::random_topology(&labels, &mut rng)?;
        tree.assign_random_lengths(mode, &mut rng)?;
        Ok(tree)
    }

    fn assign_random_lengths(&mut self, mode: BranchLengthMode, rng: &mut impl Rng) -> Result<()> {
        let exp = Exp::new(1.0 / RANDOM_LENGTH_MEAN)
            .map_err(|e| PhyloError::InvalidParameter(format!("exponential branch lengths: {e}")))?;
        for edge in &mut self.edges {
            edge.length = match mode {
                BranchLengthMode::Fixed => RANDOM_LENGTH_MEAN,
                BranchLengthMode::Uniform => rng.gen_range(RANDOM_LENGTH_MIN..=2.0 * RANDOM_LENGTH_MEAN),
                BranchLengthMode::Exponential => {
                    exp.sample(rng).clamp(RANDOM_LENGTH_MIN, RANDOM_LENGTH_MAX)
                }
            };
        }
        Ok(())
    }

    /// Build from an adjacency list, suppressing unlabeled nodes of degree 1 or 2.
    /// Leaves are numbered first, in input order.
    fn from_adjacency(labels: Vec<Option<String>>, mut adj: Vec<Vec<(usize, f64)>>) -> Result<Tree> {
        let n = labels.len();
        let mut alive = vec![true; n];
        let mut work: Vec<usize> = (0..n).collect();
        while let Some(i) = work.pop() {
            if !alive[i] || labels[i].is_some() {
                continue;
            }
            match adj[i].len() {
                1 => {
                    let (j, _) = adj[i][0];
                    adj[j].retain(|&(k, _)| k != i);
                    adj[i].clear();
                    alive[i] = false;
                    work.push(j);
                }
                2 => {
                    let (a, la) = adj[i][0];
                    let (b, lb) = adj[i][1];
                    adj[a].retain(|&(k, _)| k != i);
                    adj[b].retain(|&(k, _)| k != i);
                    adj[a].push((b, la + lb));
                    adj[b].push((a, la + lb));
                    adj[i].clear();
                    alive[i] = false;
                    work.push(a);
                    work.push(b);
                }
                _ => {}
            }
        }

        let mut seen = HashSet::new();
        for (i, label) in labels.iter().enumerate() {
            if !alive[i] {
                continue;
            }
            match label {
                Some(l) => {
                    if adj[i].len() != 1 {
                        return Err(PhyloError::MalformedInput(format!(
                            "taxon '{l}' is not a leaf"
                        )));
                    }
                    if !seen.insert(l.clone()) {
                        return Err(PhyloError::MalformedInput(format!("duplicate taxon '{l}' in tree")));
                    }
                }
                None if adj[i].len() <= 1 => {
                    return Err(PhyloError::MalformedInput("tree has an unnamed leaf".to_string()));
                }
                None => {}
            }
        }
        if seen.len() < 3 {
            return Err(PhyloError::MalformedInput(format!(
                "tree needs at least 3 taxa, found {}",
                seen.len()
            )));
        }

        let order: Vec<usize> = (0..n)
            .filter(|&i| alive[i] && labels[i].is_some())
            .chain((0..n).filter(|&i| alive[i] && labels[i].is_none()))
            .collect();
        let mut new_id = vec![usize::MAX; n];
        for (k, &i) in order.iter().enumerate() {
            new_id[i] = k;
        }

        let mut nodes: Vec<Node> = order
            .iter()
            .map(|&i| Node { label: labels[i].clone(), edges: Vec::new() })
            .collect();
        let mut edges = Vec::new();
        for &i in &order {
            for &(j, len) in &adj[i] {
                if new_id[i] < new_id[j] {
                    let id = edges.len();
                    let length = if len < 0.0 {
                        warn!("negative branch length {len} set to 0");
                        0.0
                    } else {
                        len
                    };
                    edges.push(Edge { ends: [new_id[i], new_id[j]], length });
                    nodes[new_id[i]].edges.push(id);
                    nodes[new_id[j]].edges.push(id);
                }
            }
        }
        Ok(Tree { nodes, edges })
    }

    /// Build from labeled nodes and `(a, b, length)` edges, e.g. the joins of
    /// a clustering method.
    ///
    /// # Errors
    /// `MalformedInput` for unnamed or duplicate leaves or fewer than 3 taxa.
    pub fn from_edges(labels: Vec<Option<String>>, edges: &[(NodeId, NodeId, f64)]) -> Result<Tree> {
        let mut adj: Vec<Vec<(usize, f64)>> = vec![Vec::new(); labels.len()];
        for &(a, b, length) in edges {
            adj[a].push((b, length));
            adj[b].push((a, length));
        }
        Tree::from_adjacency(labels, adj)
    }

    /// Parse one Newick tree. Missing branch lengths become 0.
    ///
    /// # Errors
    /// `MalformedInput` for unparsable text, unnamed or duplicate leaves, or
    /// fewer than 3 taxa.
    pub fn from_newick(text: &str) -> Result<Tree> {
        let cleaned = strip_newick_comments(text.trim());
        let (cleaned, quoted) = extract_quoted_labels(&cleaned)?;
        let parsed = phylotree::tree::Tree::from_newick(&cleaned)?;
        let root = parsed.get_root()?;

        let mut labels: Vec<Option<String>> = Vec::new();
        let mut adj: Vec<Vec<(usize, f64)>> = Vec::new();
        let mut stack: Vec<(usize, Option<usize>)> = vec![(root, None)];
        while let Some((phylo_id, parent)) = stack.pop() {
            let node = parsed.get(&phylo_id)?;
            let local = labels.len();
            let is_leaf = node.children.is_empty();
            let name = node.name.as_deref().filter(|s| !s.is_empty());
            labels.push(if is_leaf { name.map(|n| quoted.get(n).cloned().unwrap_or_else(|| n.to_string())) } else { None });
            adj.push(Vec::new());
            if let Some(p) = parent {
                let len = node.parent_edge.unwrap_or(0.0);
                adj[p].push((local, len));
                adj[local].push((p, len));
            }
            for &child in node.children.iter().rev() {
                stack.push((child, Some(local)));
            }
        }
        Tree::from_adjacency(labels, adj)
    }

    /// Newick text rooted at the first leaf's neighbour.
    pub fn to_newick(&self) -> String {
        match self.leaves().first() {
            Some(&leaf) => self.newick_from_leaf(leaf),
            None => ";".to_string(),
        }
    }

    /// Newick text with `outgroup` printed first at the root.
    ///
    /// # Errors
    /// `InvalidParameter` if the outgroup is not a leaf of this tree.
    pub fn to_newick_rooted(&self, outgroup: Option<&str>) -> Result<String> {
        match outgroup {
            None => Ok(self.to_newick()),
            Some(name) => {
                let leaf = self.find_leaf(name).ok_or_else(|| {
                    PhyloError::InvalidParameter(format!("outgroup '{name}' is not in the tree"))
                })?;
                Ok(self.newick_from_leaf(leaf))
            }
        }
    }

    fn newick_from_leaf(&self, leaf: NodeId) -> String {
        let first_edge = self.nodes[leaf].edges[0];
        let root = self.other_end(first_edge, leaf);
        let mut text: Vec<String> = vec![String::new(); self.nodes.len()];

        for (node, parent_edge) in self.postorder(root) {
            let mut s = String::new();
            if self.is_leaf(node) {
                s.push_str(&quote_label(self.nodes[node].label.as_deref().unwrap_or("")));
            } else {
                let mut children: Vec<EdgeId> = self.nodes[node]
                    .edges
                    .iter()
                    .copied()
                    .filter(|&e| Some(e) != parent_edge)
                    .collect();
                if node == root {
                    children.sort_by_key(|&e| e != first_edge);
                }
                s.push('(');
                for (k, e) in children.iter().enumerate() {
                    if k > 0 {
                        s.push(',');
                    }
                    let child = self.other_end(*e, node);
                    s.push_str(&std::mem::take(&mut text[child]));
                }
                s.push(')');
            }
            if let Some(e) = parent_edge {
                let _ = write!(s, ":{}", self.edges[e].length);
            }
            text[node] = s;
        }
        let mut out = std::mem::take(&mut text[root]);
        out.push(';');
        out
    }

    /// Check that the leaves are exactly `names`.
    ///
    /// # Errors
    /// `TaxonSetMismatch` naming a taxon present on one side only.
    pub fn check_taxa(&self, names: &[String]) -> Result<()> {
        let leaves: HashSet<String> = self.leaf_labels().into_iter().collect();
        let expected: HashSet<&String> = names.iter().collect();
        if let Some(missing) = names.iter().find(|n| !leaves.contains(*n)) {
            return Err(PhyloError::TaxonSetMismatch(format!("taxon '{missing}' is not in the tree")));
        }
        if let Some(extra) = leaves.iter().find(|l| !expected.contains(l)) {
            return Err(PhyloError::TaxonSetMismatch(format!("tree taxon '{extra}' is not in the alignment")));
        }
        Ok(())
    }

    /// Rename leaves through a translation table; unknown keys keep their label.
    pub fn relabel_leaves(&mut self, translate: &HashMap<String, String>) {
        for node in &mut self.nodes {
            if let Some(new) = node.label.as_ref().and_then(|l| translate.get(l)) {
                node.label = Some(new.clone());
            }
        }
    }

    /// Split nodes of degree > 3 into chains of degree-3 nodes joined by `length` edges.
    pub fn resolve_polytomies(&mut self, length: f64) {
        let mut x = 0;
        while x < self.nodes.len() {
            while self.nodes[x].edges.len() > 3 {
                let y = self.nodes.len();
                let new_edge = self.edges.len();
                let keep = self.nodes[x].edges.len() - 2;
                let moved: Vec<EdgeId> = self.nodes[x].edges.split_off(keep);
                for &e in &moved {
                    let side = self.side_of(e, x);
                    self.edges[e].ends[side] = y;
                }
                self.edges.push(Edge { ends: [x, y], length });
                self.nodes[x].edges.push(new_edge);
                let mut y_edges = moved;
                y_edges.insert(0, new_edge);
                self.nodes.push(Node { label: None, edges: y_edges });
            }
            x += 1;
        }
    }

    /// All NNI moves of the tree, in edge order.
    pub fn nni_moves(&self) -> Vec<Move> {
        self.internal_edges()
            .into_iter()
            .filter(|&e| self.nni_sides(e).is_ok())
            .flat_map(|edge| [0u8, 1u8].map(|variant| Move::Nni { edge, variant }))
            .collect()
    }

    /// Edges hanging off both ends of internal `edge`, each pair sorted.
    pub fn nni_sides(&self, edge: EdgeId) -> Result<([EdgeId; 2], [EdgeId; 2])> {
        let [u, v] = self.edges[edge].ends;
        let side = |n: NodeId| -> Result<[EdgeId; 2]> {
            let mut other: Vec<EdgeId> =
                self.nodes[n].edges.iter().copied().filter(|&f| f != edge).collect();
            if other.len() != 2 {
                return Err(PhyloError::InvalidParameter(format!(
                    "NNI needs branch {edge} to join two degree-3 nodes"
                )));
            }
            other.sort_unstable();
            Ok([other[0], other[1]])
        };
        Ok((side(u)?, side(v)?))
    }

    /// Apply one move to a copy of this tree.
    ///
    /// # Errors
    /// `InvalidParameter` if the move does not fit this topology.
    pub fn apply_move(&self, mv: Move) -> Result<Tree> {
        let mut out = self.clone();
        out.apply_move_in_place(mv)?;
        Ok(out)
    }

    pub fn apply_move_in_place(&mut self, mv: Move) -> Result<()> {
        match mv {
            Move::Nni { edge, variant } => self.nni_in_place(edge, variant),
            Move::Spr { prune_edge, subtree, regraft_edge } => {
                self.spr_in_place(prune_edge, subtree, regraft_edge)
            }
        }
    }

    fn check_edge(&self, edge: EdgeId) -> Result<()> {
        if edge >= self.edges.len() {
            return Err(PhyloError::InvalidParameter(format!("branch {edge} does not exist")));
        }
        Ok(())
    }

    fn nni_in_place(&mut self, edge: EdgeId, variant: u8) -> Result<()> {
        self.check_edge(edge)?;
        if variant > 1 {
            return Err(PhyloError::InvalidParameter(format!("NNI variant {variant} is not 0 or 1")));
        }
        let (at_u, at_v) = self.nni_sides(edge)?;
        let [u, v] = self.edges[edge].ends;
        let b = at_u[1];
        let c = at_v[variant as usize];

        let bi = self.side_of(b, u);
        self.edges[b].ends[bi] = v;
        let ci = self.side_of(c, v);
        self.edges[c].ends[ci] = u;
        replace_edge(&mut self.nodes[u].edges, b, c);
        replace_edge(&mut self.nodes[v].edges, c, b);
        Ok(())
    }

    /// Edges of the subtree hanging from `subtree` away from `edge`, including `edge`.
    fn subtree_edges(&self, edge: EdgeId, subtree: NodeId) -> HashSet<EdgeId> {
        let mut seen = HashSet::from([edge]);
        let mut queue = VecDeque::from([subtree]);
        while let Some(n) = queue.pop_front() {
            for &e in &self.nodes[n].edges {
                if seen.insert(e) {
                    queue.push_back(self.other_end(e, n));
                }
            }
        }
        seen
    }

    fn spr_in_place(&mut self, prune_edge: EdgeId, subtree: NodeId, regraft_edge: EdgeId) -> Result<()> {
        self.check_edge(prune_edge)?;
        self.check_edge(regraft_edge)?;
        let invalid = |msg: String| Err(PhyloError::InvalidParameter(msg));
        if !self.edges[prune_edge].ends.contains(&subtree) {
            return invalid(format!("node {subtree} is not an end of branch {prune_edge}"));
        }
        let w = self.other_end(prune_edge, subtree);
        if self.nodes[w].edges.len() != 3 {
            return invalid(format!("SPR needs node {w} to have degree 3"));
        }
        let mut others: Vec<EdgeId> =
            self.nodes[w].edges.iter().copied().filter(|&e| e != prune_edge).collect();
        others.sort_unstable();
        let (e1, e2) = (others[0], others[1]);
        if regraft_edge == e1 || regraft_edge == e2 {
            return invalid("SPR regraft branch is adjacent to the pruned subtree".to_string());
        }
        if self.subtree_edges(prune_edge, subtree).contains(&regraft_edge) {
            return invalid("SPR regraft branch lies inside the pruned subtree".to_string());
        }

        // Dissolve w: e1 now spans x-y, e2 is free.
        let y = self.other_end(e2, w);
        let merged = self.edges[e1].length + self.edges[e2].length;
        let wi = self.side_of(e1, w);
        self.edges[e1].ends[wi] = y;
        self.edges[e1].length = merged;
        replace_edge(&mut self.nodes[y].edges, e2, e1);

        // Split the regraft branch a-b into a-w and w-b.
        let [a, b] = self.edges[regraft_edge].ends;
        let half = self.edges[regraft_edge].length / 2.0;
        self.edges[regraft_edge].ends = [a, w];
        self.edges[regraft_edge].length = half;
        self.edges[e2].ends = [w, b];
        self.edges[e2].length = half;
        replace_edge(&mut self.nodes[b].edges, regraft_edge, e2);
        self.nodes[w].edges = vec![prune_edge, regraft_edge, e2];
        Ok(())
    }

    /// Branches within `radius` steps of the attachment point of a pruned
    /// subtree, excluding the no-op positions.
    pub fn spr_regraft_candidates(&self, prune_edge: EdgeId, subtree: NodeId, radius: usize) -> Vec<EdgeId> {
        let w = self.other_end(prune_edge, subtree);
        let mut visited: HashSet<EdgeId> = self.nodes[w].edges.iter().copied().collect();
        let mut out = Vec::new();
        let mut queue: VecDeque<(NodeId, usize)> = self.nodes[w]
            .edges
            .iter()
            .filter(|&&e| e != prune_edge)
            .map(|&e| (self.other_end(e, w), 1))
            .collect();
        while let Some((n, depth)) = queue.pop_front() {
            if depth > radius {
                continue;
            }
            for &e in &self.nodes[n].edges {
                if visited.insert(e) {
                    out.push(e);
                    queue.push_back((self.other_end(e, n), depth + 1));
                }
            }
        }
        out.sort_unstable();
        out
    }

    pub fn random_nni(&self, rng: &mut impl Rng) -> Option<Move> {
        let edge = random_choice_maybe(
            self.internal_edges().into_iter().filter(|&e| self.nni_sides(e).is_ok()),
            rng,
        )?;
        let variant = rng.gen_range(0..2u8);
        Some(Move::Nni { edge, variant })
    }

    pub fn random_spr(&self, rng: &mut impl Rng, radius: usize) -> Option<Move> {
        let mut starts: Vec<(EdgeId, NodeId)> = Vec::new();
        for (e, edge) in self.edges.iter().enumerate() {
            for &s in &edge.ends {
                let w = self.other_end(e, s);
                if self.nodes[w].edges.len() == 3 {
                    starts.push((e, s));
                }
            }
        }
        for _ in 0..8 {
            let &(prune_edge, subtree) = random_choice_maybe(starts.iter(), rng)?;
            let candidates = self.spr_regraft_candidates(prune_edge, subtree, radius);
            if let Some(regraft_edge) = random_choice_maybe(candidates, rng) {
                return Some(Move::Spr { prune_edge, subtree, regraft_edge });
            }
        }
        None
    }
}

fn replace_edge(list: &mut [EdgeId], old: EdgeId, new: EdgeId) {
    if let Some(slot) = list.iter_mut().find(|e| **e == old) {
        *slot = new;
    }
}

/// Swap every `'...'` label for a plain placeholder name, returning the
/// rewritten text and the placeholder-to-label table. `''` inside quotes is a
/// literal quote.
fn extract_quoted_labels(text: &str) -> Result<(String, HashMap<String, String>)> {
    let mut prefix = String::from("qlabel");
    while text.contains(&prefix) {
        prefix.push('x');
    }
    let mut out = String::with_capacity(text.len());
    let mut table = HashMap::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\'' {
            out.push(c);
            continue;
        }
        let mut label = String::new();
        loop {
            match chars.next() {
                Some('\'') if chars.peek() == Some(&'\'') => {
                    chars.next();
                    label.push('\'');
                }
                Some('\'') => break,
                Some(ch) => label.push(ch),
                None => {
                    return Err(PhyloError::MalformedInput(format!("unterminated quoted label '{label}")));
                }
            }
        }
        let key = format!("{prefix}{}", table.len());
        out.push_str(&key);
        table.insert(key, label);
    }
    Ok((out, table))
}

fn quote_label(label: &str) -> String {
    let needs_quotes = label
        .chars()
        .any(|c| matches!(c, '(' | ')' | ',' | ':' | ';' | '[' | ']' | '\'') || c.is_whitespace());
    if needs_quotes {
        format!("'{}'", label.replace('\'', "''"))
    } else {
        label.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distances::robinson_foulds;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn quartet() -> Tree {
        Tree::from_newick("((A:0.1,B:0.2):0.3,(C:0.4,D:0.5):0.6);").unwrap()
    }

    #[test]
    fn test_rooted_input_is_unrooted() {
        let t = quartet();
        assert_eq!(t.num_leaves(), 4);
        assert_eq!(t.num_edges(), 5);
        assert!(t.is_binary());
        let internal = t.internal_edges();
        assert_eq!(internal.len(), 1);
        assert_abs_diff_eq!(t.length(internal[0]), 0.9, epsilon = 1e-12);
    }

    #[test]
    fn test_quoted_labels_round_trip() {
        let t = Tree::from_newick("('a b':0.1,'c''d':0.2,'sp(1)':0.3,e:0.4);").unwrap();
        let mut labels = t.leaf_labels();
        labels.sort();
        assert_eq!(labels, vec!["a b", "c'd", "e", "sp(1)"]);

        let back = Tree::from_newick(&t.to_newick()).unwrap();
        let mut again = back.leaf_labels();
        again.sort();
        assert_eq!(again, labels);
        assert_eq!(robinson_foulds(&t, &back).unwrap(), 0);
        assert!(Tree::from_newick("('open:0.1,B,C);").is_err());
    }

    #[test]
    fn test_newick_round_trip() {
        let text = "(A:0.1234567,(B:0.2,C:1e-7):0.05,(D:0.3,E:0.4):0.000001);";
        let t = Tree::from_newick(text).unwrap();
        let back = Tree::from_newick(&t.to_newick()).unwrap();
        assert_eq!(robinson_foulds(&t, &back).unwrap(), 0);
        let mut a: Vec<f64> = t.edges().iter().map(|e| e.length).collect();
        let mut b: Vec<f64> = back.edges().iter().map(|e| e.length).collect();
        a.sort_by(f64::total_cmp);
        b.sort_by(f64::total_cmp);
        for (x, y) in a.iter().zip(&b) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-6);
        }
    }

    #[rstest]
    #[case("(A,B);")]
    #[case("((A,B),(A,C));")]
    #[case("((A,B),(C,D)")]
    fn test_bad_newick(#[case] text: &str) {
        assert!(matches!(Tree::from_newick(text), Err(PhyloError::MalformedInput(_))));
    }

    #[test]
    fn test_outgroup_first() {
        let t = quartet();
        let s = t.to_newick_rooted(Some("C")).unwrap();
        assert!(s.starts_with("(C:"), "{s}");
        assert!(matches!(t.to_newick_rooted(Some("Z")), Err(PhyloError::InvalidParameter(_))));
    }

    #[test]
    fn test_random_tree_is_reproducible() {
        let a = Tree::generate_random(10, BranchLengthMode::Uniform, 42).unwrap();
        let b = Tree::generate_random(10, BranchLengthMode::Uniform, 42).unwrap();
        assert_eq!(a.to_newick(), b.to_newick());
        assert_eq!(a.num_leaves(), 10);
        assert_eq!(a.num_edges(), 17);
        assert!(a.is_binary());
        let c = Tree::generate_random(10, BranchLengthMode::Uniform, 43).unwrap();
        assert_ne!(a.to_newick(), c.to_newick());
    }

    #[rstest]
    #[case(BranchLengthMode::Fixed)]
    #[case(BranchLengthMode::Uniform)]
    #[case(BranchLengthMode::Exponential)]
    fn test_random_lengths_in_range(#[case] mode: BranchLengthMode) {
        let t = Tree::generate_random(25, mode, 1).unwrap();
        assert!(t.edges().iter().all(|e| e.length >= RANDOM_LENGTH_MIN && e.length <= RANDOM_LENGTH_MAX));
    }

    #[test]
    fn test_random_tree_needs_three_taxa() {
        let err = Tree::generate_random(2, BranchLengthMode::Fixed, 1).unwrap_err();
        assert!(matches!(err, PhyloError::InvalidParameter(_)));
    }

    #[test]
    fn test_nni_on_twenty_taxa_changes_one_split() {
        let t = Tree::generate_random(20, BranchLengthMode::Fixed, 3).unwrap();
        for mv in t.nni_moves() {
            let moved = t.apply_move(mv).unwrap();
            assert!(moved.is_binary());
            assert_eq!(robinson_foulds(&t, &moved).unwrap(), 2);
        }
    }

    #[test]
    fn test_apply_move_is_pure() {
        let t = quartet();
        let before = t.clone();
        let e = t.internal_edges()[0];
        let _ = t.apply_move(Move::Nni { edge: e, variant: 1 }).unwrap();
        assert_eq!(t, before);
    }

    #[test]
    fn test_invalid_moves() {
        let t = quartet();
        let leaf_edge = t.node(t.leaves()[0]).edges[0];
        assert!(t.apply_move(Move::Nni { edge: leaf_edge, variant: 0 }).is_err());
        assert!(t.apply_move(Move::Nni { edge: 99, variant: 0 }).is_err());
    }

    #[test]
    fn test_spr_keeps_tree_binary_and_total_length() {
        let t = Tree::generate_random(12, BranchLengthMode::Uniform, 9).unwrap();
        let mut rng = get_random_number_generator(5);
        for _ in 0..20 {
            let mv = t.random_spr(&mut rng, 4).unwrap();
            let moved = t.apply_move(mv).unwrap();
            assert!(moved.is_binary());
            assert_eq!(moved.num_leaves(), 12);
            assert_abs_diff_eq!(moved.total_length(), t.total_length(), epsilon = 1e-9);
            assert!(robinson_foulds(&t, &moved).unwrap() >= 2);
        }
    }

    #[test]
    fn test_resolve_polytomies() {
        let mut t = Tree::from_newick("(A:1,B:1,C:1,D:1,E:1);").unwrap();
        assert!(!t.is_binary());
        t.resolve_polytomies(1e-6);
        assert!(t.is_binary());
        assert_eq!(t.num_edges(), 7);
    }

    #[test]
    fn test_check_taxa() {
        let t = quartet();
        let names: Vec<String> = ["A", "B", "C", "D"].iter().map(|s| s.to_string()).collect();
        t.check_taxa(&names).unwrap();
        let fewer = names[..3].to_vec();
        assert!(matches!(t.check_taxa(&fewer), Err(PhyloError::TaxonSetMismatch(_))));
    }
}
