//! Tree log-likelihood by Felsenstein's pruning algorithm.
//!
//! # Overview
//! Every branch has two *directional partials*: the conditional likelihoods
//! of the subtree on either side of it, looking away from the branch. The
//! log-likelihood can be read off any branch from its two partials, which
//! makes single-branch optimization and NNI scoring cheap. Partials are
//! computed lazily and invalidated when a branch length or the topology near
//! them changes.
//!
//! ```text
//!   subtree at ends[0]         subtree at ends[1]
//!        partial[e][0] ---e--- partial[e][1]
//! ```
//!
//! # Numerics
//! Each partial carries a per-pattern log scale. A pattern is rescaled when
//! its largest entry drops below [`SCALE_THRESHOLD`], or at every node in
//! safe mode. Per-pattern values are gathered in pattern order and summed
//! sequentially, so results do not depend on the number of threads.
//!
//! Branches shorter than the minimum branch length are evaluated at the
//! minimum. A non-finite result is retried in safe mode and then with a
//! larger minimum before giving up with `NumericalFailure`.

use std::cell::RefCell;
use std::sync::Arc;

use argmin::core::{CostFunction, Error as ArgminError, Executor, State};
use argmin::solver::brent::BrentOpt;
use log::{debug, warn};
use ndarray::Array2;
use rayon::prelude::*;

use crate::alignment::{Alignment, SitePatterns};
use crate::config::MAX_BRANCH_LENGTH;
use crate::error::{PhyloError, Result};
use crate::model::{Model, Param};
use crate::tree::{EdgeId, Move, NodeId, Tree};

/// Patterns per rayon task.
const PATTERN_CHUNK: usize = 64;

/// Partials whose largest entry falls below this are rescaled.
pub const SCALE_THRESHOLD: f64 = 1e-100;

const MAX_NUMERICAL_RETRIES: usize = 3;
const MAX_OPTIMIZATION_ROUNDS: usize = 50;
const BRENT_MAX_ITERS: u64 = 100;

struct CostFunctionWrapper<F>
where
    F: Fn(f64) -> f64,
{
    problem: F,
}

impl<F> CostFunction for CostFunctionWrapper<F>
where
    F: Fn(f64) -> f64,
{
    type Param = f64;
    type Output = f64;

    fn cost(&self, x: &Self::Param) -> std::result::Result<Self::Output, ArgminError> {
        Ok((self.problem)(*x))
    }
}

/// Minimize `problem` on `bounds` with Brent's method. Returns the minimizer
/// and the minimum.
pub fn minimize_scalar_brent_bounded(problem: impl Fn(f64) -> f64, bounds: (f64, f64)) -> Result<(f64, f64)> {
    let problem = CostFunctionWrapper { problem };
    let solver = BrentOpt::new(bounds.0, bounds.1);
    let result = Executor::new(problem, solver)
        .configure(|state| state.max_iters(BRENT_MAX_ITERS))
        .run()
        .map_err(|err| PhyloError::NumericalFailure(format!("Brent optimization: {err}")))?;
    let param = *result
        .state()
        .get_best_param()
        .ok_or_else(|| PhyloError::NumericalFailure("Brent optimization returned no parameter".to_string()))?;
    Ok((param, result.state().get_best_cost()))
}

/// Negated objective for minimization; non-finite values become the worst cost.
fn as_cost(log_likelihood: f64) -> f64 {
    if log_likelihood.is_finite() { -log_likelihood } else { f64::MAX }
}

fn log_add_exp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let m = a.max(b);
    m + ((a - m).exp() + (b - m).exp()).ln()
}

/// Conditional likelihoods of one subtree: `values[(p * cats + c) * states + i]`
/// and the log scale factor of each pattern.
#[derive(Clone, Debug, Default)]
struct Partial {
    values: Vec<f64>,
    ln_scale: Vec<f64>,
}

fn rescale(block: &mut [f64], ln_scale: &mut f64, always: bool) {
    let max = block.iter().copied().fold(0.0, f64::max);
    if max > 0.0 && (always || max < SCALE_THRESHOLD) {
        for v in block.iter_mut() {
            *v /= max;
        }
        *ln_scale += max.ln();
    }
}

#[derive(Clone, Debug)]
struct PartitionLikelihood {
    name: String,
    patterns: Arc<SitePatterns>,
    model: Model,
    cache: Vec<[Option<Arc<Partial>>; 2]>,
}

impl PartitionLikelihood {
    fn block(&self) -> usize {
        self.model.num_states() * self.model.category_rates().len()
    }

    fn slot(&self, edge: EdgeId, side: usize) -> Result<&Arc<Partial>> {
        self.cache
            .get(edge)
            .and_then(|s| s[side].as_ref())
            .ok_or_else(|| {
                PhyloError::NumericalFailure(format!(
                    "partial likelihood of branch {edge} used before it was computed"
                ))
            })
    }
}

/// Minimum branch length and scaling policy of an [`Evaluator`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EvalOptions {
    pub min_branch_length: f64,
    /// Rescale partials at every node.
    pub safe: bool,
}

/// Likelihood of one tree over a set of partitions with joint branch lengths.
///
/// An evaluator is bound to one tree at a time with [`Evaluator::bind`]; its
/// cached partials refer to that tree's branch indices. Cloning is cheap,
/// partials are shared until recomputed.
#[derive(Clone, Debug)]
pub struct Evaluator {
    parts: Vec<PartitionLikelihood>,
    taxa: Vec<String>,
    leaf_rows: Vec<Option<usize>>,
    options: EvalOptions,
    evaluations: u64,
}

impl Evaluator {
    /// `taxa` are the alignment row names in row order.
    pub fn new(parts: Vec<(String, Arc<SitePatterns>, Model)>, taxa: Vec<String>, options: EvalOptions) -> Self {
        Evaluator {
            parts: parts
                .into_iter()
                .map(|(name, patterns, model)| PartitionLikelihood {
                    name,
                    patterns,
                    model,
                    cache: Vec::new(),
                })
                .collect(),
            taxa,
            leaf_rows: Vec::new(),
            options,
            evaluations: 0,
        }
    }

    pub fn models(&self) -> Vec<&Model> {
        self.parts.iter().map(|p| &p.model).collect()
    }

    pub fn partition_names(&self) -> Vec<&str> {
        self.parts.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn set_model(&mut self, part: usize, model: Model) {
        self.parts[part].model = model;
        self.invalidate_partition(part);
    }

    /// Number of likelihood evaluations so far.
    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    /// Bytes held by the cached partials.
    pub fn cached_bytes(&self) -> u64 {
        self.parts
            .iter()
            .flat_map(|p| p.cache.iter().flatten().flatten())
            .map(|partial| ((partial.values.len() + partial.ln_scale.len()) * 8) as u64)
            .sum()
    }

    pub fn num_sites(&self) -> usize {
        self.parts.iter().map(|p| p.patterns.num_sites).sum()
    }

    /// Model parameters plus one length per branch.
    pub fn num_free_params(&self) -> usize {
        let branches = 2 * self.taxa.len().max(3) - 3;
        self.parts.iter().map(|p| p.model.num_free_params()).sum::<usize>() + branches
    }

    /// Attach to `tree`, dropping every cached partial.
    ///
    /// # Errors
    /// `TaxonSetMismatch` if the leaves are not exactly the alignment taxa.
    pub fn bind(&mut self, tree: &Tree) -> Result<()> {
        tree.check_taxa(&self.taxa)?;
        self.leaf_rows = (0..tree.num_nodes())
            .map(|n| {
                tree.label(n)
                    .filter(|_| tree.is_leaf(n))
                    .and_then(|l| self.taxa.iter().position(|t| t == l))
            })
            .collect();
        let num_edges = tree.num_edges();
        for part in &mut self.parts {
            part.cache = vec![[None, None]; num_edges];
        }
        Ok(())
    }

    fn is_bound_to(&self, tree: &Tree) -> bool {
        self.leaf_rows.len() == tree.num_nodes() && self.parts.iter().all(|p| p.cache.len() == tree.num_edges())
    }

    fn ensure_bound(&mut self, tree: &Tree) -> Result<()> {
        if self.is_bound_to(tree) { Ok(()) } else { self.bind(tree) }
    }

    pub fn invalidate_all(&mut self) {
        for part in 0..self.parts.len() {
            self.invalidate_partition(part);
        }
    }

    fn invalidate_partition(&mut self, part: usize) {
        for slot in &mut self.parts[part].cache {
            *slot = [None, None];
        }
    }

    /// Drop partials whose subtree contains `edge`.
    fn invalidate_toward(&mut self, tree: &Tree, edge: EdgeId) {
        let mut stack: Vec<(NodeId, EdgeId)> = tree.edge(edge).ends.iter().map(|&x| (x, edge)).collect();
        while let Some((x, via)) = stack.pop() {
            for &f in &tree.node(x).edges {
                if f == via {
                    continue;
                }
                let side = tree.side_of(f, x);
                for part in &mut self.parts {
                    part.cache[f][side] = None;
                }
                stack.push((tree.other_end(f, x), f));
            }
        }
    }

    /// Drop the partials of `edge` and of every subtree containing it, after
    /// a topology change at that branch.
    pub fn invalidate_around(&mut self, tree: &Tree, edge: EdgeId) {
        for part in &mut self.parts {
            part.cache[edge] = [None, None];
        }
        self.invalidate_toward(tree, edge);
    }

    fn transition_matrices(&self, model: &Model, t: f64) -> Vec<Array2<f64>> {
        let t = t.max(self.options.min_branch_length);
        model.category_rates().iter().map(|r| model.transition_matrix(t * r)).collect()
    }

    fn tip(&self, part: &PartitionLikelihood, node: NodeId) -> Result<Partial> {
        let row = self.leaf_rows.get(node).copied().flatten().ok_or_else(|| {
            PhyloError::TaxonSetMismatch(format!("leaf node {node} has no alignment row"))
        })?;
        let n = part.model.num_states();
        let cats = part.model.category_rates().len();
        let block = n * cats;
        let states = &part.patterns.states[row];
        let mut values = vec![0.0; states.len() * block];
        for (p, &s) in states.iter().enumerate() {
            for c in 0..cats {
                for i in 0..n {
                    if (s >> i) & 1 == 1 {
                        values[p * block + c * n + i] = 1.0;
                    }
                }
            }
        }
        Ok(Partial { values, ln_scale: vec![0.0; states.len()] })
    }

    /// Partial of a node from the partials of its children and their branch lengths.
    fn combine(&self, part: &PartitionLikelihood, children: &[(&Partial, f64)]) -> Partial {
        let n = part.model.num_states();
        let block = part.block();
        let npat = part.patterns.num_patterns();
        let mats: Vec<Vec<Array2<f64>>> =
            children.iter().map(|(_, t)| self.transition_matrices(&part.model, *t)).collect();
        let safe = self.options.safe;

        let mut values = vec![1.0; npat * block];
        let mut ln_scale = vec![0.0; npat];
        values
            .par_chunks_mut(block)
            .zip(ln_scale.par_iter_mut())
            .enumerate()
            .with_min_len(PATTERN_CHUNK)
            .for_each(|(p, (out, scale))| {
                for ((child, _), pm) in children.iter().zip(&mats) {
                    let cv = &child.values[p * block..(p + 1) * block];
                    for (c, m) in pm.iter().enumerate() {
                        for i in 0..n {
                            let mut s = 0.0;
                            for j in 0..n {
                                s += m[[i, j]] * cv[c * n + j];
                            }
                            out[c * n + i] *= s;
                        }
                    }
                    *scale += child.ln_scale[p];
                }
                rescale(out, scale, safe);
            });
        Partial { values, ln_scale }
    }

    /// Partial of the subtree at `ends[side]` of `edge`, from cached children.
    fn compute(&self, part: usize, tree: &Tree, edge: EdgeId, side: usize) -> Result<Partial> {
        let part = &self.parts[part];
        let x = tree.edge(edge).ends[side];
        if tree.is_leaf(x) {
            return self.tip(part, x);
        }
        let children = tree
            .node(x)
            .edges
            .iter()
            .filter(|&&f| f != edge)
            .map(|&f| {
                let y = tree.other_end(f, x);
                Ok((part.slot(f, tree.side_of(f, y))?.as_ref(), tree.length(f)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(self.combine(part, &children))
    }

    /// Make sure the partial `[edge][side]` and everything it depends on is cached.
    fn ensure(&mut self, tree: &Tree, edge: EdgeId, side: usize) -> Result<()> {
        for part in 0..self.parts.len() {
            let mut stack = vec![(edge, side, false)];
            while let Some((e, s, ready)) = stack.pop() {
                if self.parts[part].cache[e][s].is_some() {
                    continue;
                }
                let x = tree.edge(e).ends[s];
                if ready || tree.is_leaf(x) {
                    let partial = self.compute(part, tree, e, s)?;
                    self.parts[part].cache[e][s] = Some(Arc::new(partial));
                    continue;
                }
                stack.push((e, s, true));
                for &f in &tree.node(x).edges {
                    if f == e {
                        continue;
                    }
                    let y = tree.other_end(f, x);
                    let fs = tree.side_of(f, y);
                    if self.parts[part].cache[f][fs].is_none() {
                        stack.push((f, fs, false));
                    }
                }
            }
        }
        Ok(())
    }

    fn ensure_edge(&mut self, tree: &Tree, edge: EdgeId) -> Result<()> {
        self.ensure(tree, edge, 0)?;
        self.ensure(tree, edge, 1)
    }

    /// Per-pattern log-likelihoods with the two partials of one branch of length `t`.
    fn site_log_likelihoods(&self, part: &PartitionLikelihood, a: &Partial, b: &Partial, t: f64) -> Vec<f64> {
        let model = &part.model;
        let n = model.num_states();
        let block = part.block();
        let mats = self.transition_matrices(model, t);
        let pi = model.freqs();
        let weight = model.category_weight();
        let pinv = model.pinv();
        let constant = &part.patterns.constant;

        (0..part.patterns.num_patterns())
            .into_par_iter()
            .with_min_len(PATTERN_CHUNK)
            .map(|p| {
                let av = &a.values[p * block..(p + 1) * block];
                let bv = &b.values[p * block..(p + 1) * block];
                let mut inner = 0.0;
                for (c, m) in mats.iter().enumerate() {
                    for i in 0..n {
                        let ai = av[c * n + i];
                        if ai == 0.0 {
                            continue;
                        }
                        let mut s = 0.0;
                        for j in 0..n {
                            s += m[[i, j]] * bv[c * n + j];
                        }
                        inner += pi[i] * ai * s;
                    }
                }
                let variable = (inner * weight).ln() + a.ln_scale[p] + b.ln_scale[p];
                let mask = constant[p];
                if pinv > 0.0 && mask != 0 {
                    let mass: f64 = (0..n).filter(|i| (mask >> i) & 1 == 1).map(|i| pi[i]).sum();
                    log_add_exp(variable, (pinv * mass).ln())
                } else {
                    variable
                }
            })
            .collect()
    }

    fn partition_edge_log_likelihood(&self, part: usize, edge: EdgeId, t: f64) -> Result<f64> {
        let p = &self.parts[part];
        let (a, b) = (p.slot(edge, 0)?, p.slot(edge, 1)?);
        let sites = self.site_log_likelihoods(p, a, b, t);
        Ok(sites.iter().zip(&p.patterns.weights).map(|(l, w)| l * w).sum())
    }

    fn edge_log_likelihood(&self, edge: EdgeId, t: f64) -> Result<f64> {
        let mut total = 0.0;
        for part in 0..self.parts.len() {
            total += self.partition_edge_log_likelihood(part, edge, t)?;
        }
        Ok(total)
    }

    /// Log-likelihood of each partition.
    pub fn partition_log_likelihoods(&mut self, tree: &Tree) -> Result<Vec<f64>> {
        self.log_likelihood(tree)?;
        let edge = tree.reference_edge();
        (0..self.parts.len())
            .map(|part| self.partition_edge_log_likelihood(part, edge, tree.length(edge)))
            .collect()
    }

    /// Log-likelihood of `tree` summed over partitions.
    ///
    /// # Errors
    /// `NumericalFailure` if the value stays non-finite after the retries,
    /// `TaxonSetMismatch` if the tree does not fit the alignment.
    pub fn log_likelihood(&mut self, tree: &Tree) -> Result<f64> {
        self.ensure_bound(tree)?;
        let edge = tree.reference_edge();
        for attempt in 0..=MAX_NUMERICAL_RETRIES {
            self.ensure_edge(tree, edge)?;
            self.evaluations += 1;
            let ll = self.edge_log_likelihood(edge, tree.length(edge))?;
            if ll.is_finite() {
                return Ok(ll);
            }
            if attempt == MAX_NUMERICAL_RETRIES {
                break;
            }
            if self.options.safe {
                self.options.min_branch_length = (self.options.min_branch_length * 10.0).min(MAX_BRANCH_LENGTH / 10.0);
                warn!(
                    "Non-finite log-likelihood, retrying with minimum branch length {}",
                    self.options.min_branch_length
                );
            } else {
                warn!("Non-finite log-likelihood, switching to safe scaling");
                self.options.safe = true;
            }
            self.invalidate_all();
        }
        Err(PhyloError::NumericalFailure(format!(
            "log-likelihood is not finite after {MAX_NUMERICAL_RETRIES} retries"
        )))
    }

    /// Optimize the length of one branch; returns the new log-likelihood.
    pub fn optimize_branch(&mut self, tree: &mut Tree, edge: EdgeId) -> Result<f64> {
        self.ensure_bound(tree)?;
        self.ensure_edge(tree, edge)?;
        let current = tree.length(edge);
        let current_ll = self.edge_log_likelihood(edge, current)?;
        let lo = self.options.min_branch_length;
        let (t, cost) = minimize_scalar_brent_bounded(
            |t| self.edge_log_likelihood(edge, t).map_or(f64::MAX, as_cost),
            (lo, MAX_BRANCH_LENGTH),
        )?;
        self.evaluations += 1;
        if -cost > current_ll {
            tree.set_length(edge, t);
            self.invalidate_toward(tree, edge);
            Ok(-cost)
        } else {
            if current < lo {
                tree.set_length(edge, lo);
            }
            Ok(current_ll)
        }
    }

    /// Branches in preorder from the reference branch.
    fn traversal_edges(tree: &Tree) -> Vec<EdgeId> {
        let edge = tree.reference_edge();
        let root = tree.edge(edge).ends[0];
        let mut order: Vec<EdgeId> = tree.postorder(root).into_iter().filter_map(|(_, e)| e).collect();
        order.reverse();
        order
    }

    /// Optimize every branch length `passes` times, stopping early when a pass
    /// gains less than `epsilon`.
    pub fn optimize_branches(&mut self, tree: &mut Tree, passes: usize, epsilon: f64) -> Result<f64> {
        let mut ll = self.log_likelihood(tree)?;
        for _ in 0..passes {
            let before = ll;
            for edge in Self::traversal_edges(tree) {
                ll = self.optimize_branch(tree, edge)?;
            }
            if ll - before < epsilon {
                break;
            }
        }
        self.log_likelihood(tree)
    }

    fn partition_log_likelihood(&mut self, tree: &Tree, part: usize) -> Result<f64> {
        let edge = tree.reference_edge();
        self.ensure_edge(tree, edge)?;
        self.evaluations += 1;
        self.partition_edge_log_likelihood(part, edge, tree.length(edge))
    }

    /// Optimize the free model parameters of every partition, one at a time.
    pub fn optimize_model_params(&mut self, tree: &Tree) -> Result<f64> {
        self.ensure_bound(tree)?;
        for part in 0..self.parts.len() {
            for param in self.parts[part].model.free_params() {
                let start_value = self.parts[part].model.param(param);
                let start_ll = self.partition_log_likelihood(tree, part)?;
                let bounds = self.parts[part].model.param_bounds(param);
                if bounds.1 <= bounds.0 {
                    continue;
                }
                let (best, cost) = {
                    let cell = RefCell::new(&mut *self);
                    minimize_scalar_brent_bounded(
                        |x| {
                            let mut ev = cell.borrow_mut();
                            match ev.try_param(tree, part, param, x) {
                                Ok(ll) => as_cost(ll),
                                Err(_) => f64::MAX,
                            }
                        },
                        bounds,
                    )?
                };
                let value = if -cost > start_ll { best } else { start_value };
                self.parts[part].model.set_param(param, value)?;
                self.invalidate_partition(part);
                debug!("{}: {param:?} = {value:.6}", self.parts[part].name);
            }
        }
        self.log_likelihood(tree)
    }

    fn try_param(&mut self, tree: &Tree, part: usize, param: Param, value: f64) -> Result<f64> {
        self.parts[part].model.set_param(param, value)?;
        self.invalidate_partition(part);
        self.partition_log_likelihood(tree, part)
    }

    /// Alternate model-parameter and branch-length optimization until a round
    /// gains less than `epsilon`.
    pub fn optimize_all(&mut self, tree: &mut Tree, epsilon: f64) -> Result<f64> {
        let mut ll = self.log_likelihood(tree)?;
        for round in 0..MAX_OPTIMIZATION_ROUNDS {
            let before = ll;
            self.optimize_model_params(tree)?;
            ll = self.optimize_branches(tree, 1, epsilon)?;
            debug!("Optimization round {}: {ll:.6}", round + 1);
            if ll - before < epsilon {
                break;
            }
        }
        Ok(ll)
    }

    /// Cache every partial needed by [`Evaluator::nni_score`].
    pub fn prepare_nni(&mut self, tree: &Tree) -> Result<()> {
        self.ensure_bound(tree)?;
        for edge in 0..tree.num_edges() {
            self.ensure_edge(tree, edge)?;
        }
        Ok(())
    }

    /// Log-likelihood after an NNI with the central branch re-optimized and
    /// every other branch kept. Read-only; call [`Evaluator::prepare_nni`] first.
    pub fn nni_score(&self, tree: &Tree, mv: Move) -> Result<f64> {
        let Move::Nni { edge, variant } = mv else {
            return Err(PhyloError::InvalidParameter("only NNI moves can be scored locally".to_string()));
        };
        let (at_u, at_v) = tree.nni_sides(edge)?;
        let v = variant as usize;
        let u_side = [at_u[0], at_v[v]];
        let v_side = [at_u[1], at_v[1 - v]];
        let [u, w] = tree.edge(edge).ends;
        let far = |f: EdgeId, near: NodeId| {
            let y = tree.other_end(f, near);
            tree.side_of(f, y)
        };
        let owners = [(u_side[0], u), (u_side[1], w), (v_side[0], u), (v_side[1], w)];

        let mut pairs = Vec::with_capacity(self.parts.len());
        for part in &self.parts {
            let child = |i: usize| -> Result<(&Partial, f64)> {
                let (f, near) = owners[i];
                Ok((part.slot(f, far(f, near))?.as_ref(), tree.length(f)))
            };
            let a = self.combine(part, &[child(0)?, child(1)?]);
            let b = self.combine(part, &[child(2)?, child(3)?]);
            pairs.push((a, b));
        }
        let score = |t: f64| -> f64 {
            self.parts
                .iter()
                .zip(&pairs)
                .map(|(part, (a, b))| {
                    let sites = self.site_log_likelihoods(part, a, b, t);
                    sites.iter().zip(&part.patterns.weights).map(|(l, w)| l * w).sum::<f64>()
                })
                .sum()
        };
        let (_, cost) = minimize_scalar_brent_bounded(
            |t| as_cost(score(t)),
            (self.options.min_branch_length, MAX_BRANCH_LENGTH),
        )?;
        Ok((-cost).max(score(tree.length(edge))))
    }

    /// Apply an NNI in place and re-optimize the five branches around it.
    pub fn apply_nni(&mut self, tree: &mut Tree, mv: Move) -> Result<f64> {
        let Move::Nni { edge, .. } = mv else {
            return Err(PhyloError::InvalidParameter("expected an NNI move".to_string()));
        };
        tree.apply_move_in_place(mv)?;
        self.invalidate_around(tree, edge);
        let (at_u, at_v) = tree.nni_sides(edge)?;
        let mut ll = self.optimize_branch(tree, edge)?;
        for f in at_u.into_iter().chain(at_v) {
            ll = self.optimize_branch(tree, f)?;
        }
        Ok(ll)
    }
}

/// Bytes of partials an evaluator needs for a tree of `num_taxa` leaves and
/// partitions given as `(patterns, categories, states)`.
pub fn estimate_memory_bytes(num_taxa: usize, parts: &[(usize, usize, usize)]) -> u64 {
    let slots = 2 * (2 * num_taxa.max(3) as u64 - 3);
    parts
        .iter()
        .map(|&(patterns, cats, states)| {
            let per_partial = (patterns * cats * states + patterns) as u64 * 8;
            slots * per_partial
        })
        .sum()
}

/// Log-likelihood of `tree` with one model over the whole alignment, branch
/// lengths taken as given.
///
/// # Example
/// ```
/// # use phylo_search::alignment::{parse_alignment, SeqType};
/// # use phylo_search::likelihood::evaluate;
/// # use phylo_search::model::Model;
/// # use phylo_search::tree::Tree;
/// let aln = parse_alignment("3 4\nA ACGT\nB ACGA\nC ACGT\n", "inline", None).unwrap();
/// let sites: Vec<usize> = (0..aln.num_sites()).collect();
/// let model = Model::new(&"JC".parse().unwrap(), SeqType::Dna, &aln.patterns(&sites), None).unwrap();
/// let tree = Tree::from_newick("(A:0.1,B:0.1,C:0.1);").unwrap();
/// let ll = evaluate(&tree, &model, &aln, 1e-6).unwrap();
/// assert!(ll < 0.0);
/// ```
pub fn evaluate(tree: &Tree, model: &Model, alignment: &Alignment, min_branch_length: f64) -> Result<f64> {
    let sites: Vec<usize> = (0..alignment.num_sites()).collect();
    let patterns = Arc::new(alignment.patterns(&sites));
    let mut evaluator = Evaluator::new(
        vec![("all".to_string(), patterns, model.clone())],
        alignment.names().to_vec(),
        EvalOptions { min_branch_length, safe: false },
    );
    evaluator.bind(tree)?;
    evaluator.log_likelihood(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::{SeqType, parse_alignment};
    use crate::config::BranchLengthMode;
    use approx::assert_abs_diff_eq;

    const ALN: &str = "5 12\nA ACGTACGTAAAC\nB ACGTACGAAAAC\nC ACGAACTTAAGC\nD ACCTACTTAAGC\nE ACCTTCTTGAGC\n";

    fn setup(model: &str) -> (Alignment, Evaluator) {
        let aln = parse_alignment(ALN, "t", None).unwrap();
        let sites: Vec<usize> = (0..aln.num_sites()).collect();
        let patterns = Arc::new(aln.patterns(&sites));
        let model = Model::new(&model.parse().unwrap(), SeqType::Dna, &patterns, None).unwrap();
        let ev = Evaluator::new(
            vec![("all".to_string(), patterns, model)],
            aln.names().to_vec(),
            EvalOptions { min_branch_length: 1e-6, safe: false },
        );
        (aln, ev)
    }

    fn tree() -> Tree {
        Tree::from_newick("((A:0.1,B:0.05):0.2,C:0.15,(D:0.1,E:0.3):0.05);").unwrap()
    }

    #[test]
    fn two_taxa_jc_closed_form() {
        // A three-leaf tree where C is all unknown reduces to a pair A-B.
        let aln = parse_alignment("3 4\nA ACGT\nB ACGA\nC ----\n", "t", None).unwrap();
        let sites: Vec<usize> = (0..4).collect();
        let model = Model::new(&"JC".parse().unwrap(), SeqType::Dna, &aln.patterns(&sites), None).unwrap();
        let tree = Tree::from_newick("(A:0.1,B:0.2,C:0.3);").unwrap();
        let ll = evaluate(&tree, &model, &aln, 1e-6).unwrap();
        let t = 0.3_f64;
        let same = 0.25 * (0.25 + 0.75 * (-4.0 * t / 3.0).exp());
        let diff = 0.25 * (0.25 - 0.25 * (-4.0 * t / 3.0).exp());
        assert_abs_diff_eq!(ll, 3.0 * same.ln() + diff.ln(), epsilon = 1e-10);
    }

    #[test]
    fn value_does_not_depend_on_evaluation_branch() {
        let (_, mut ev) = setup("HKY+G4");
        let t = tree();
        ev.bind(&t).unwrap();
        let reference = ev.log_likelihood(&t).unwrap();
        for edge in 0..t.num_edges() {
            ev.ensure_edge(&t, edge).unwrap();
            let ll = ev.edge_log_likelihood(edge, t.length(edge)).unwrap();
            assert_abs_diff_eq!(ll, reference, epsilon = 1e-9);
        }
    }

    #[test]
    fn safe_scaling_gives_same_value() {
        let (aln, mut ev) = setup("GTR+F+I+G4");
        let t = tree();
        let plain = ev.log_likelihood(&t).unwrap();
        let mut safe = Evaluator::new(
            ev.parts.iter().map(|p| (p.name.clone(), p.patterns.clone(), p.model.clone())).collect(),
            aln.names().to_vec(),
            EvalOptions { min_branch_length: 1e-6, safe: true },
        );
        assert_abs_diff_eq!(safe.log_likelihood(&t).unwrap(), plain, epsilon = 1e-9);
    }

    #[test]
    fn branch_optimization_improves() {
        let (_, mut ev) = setup("JC");
        let mut t = tree();
        let before = ev.log_likelihood(&t).unwrap();
        let after = ev.optimize_branches(&mut t, 3, 1e-6).unwrap();
        assert!(after >= before - 1e-9);
        let mut fresh = ev.clone();
        fresh.bind(&t).unwrap();
        assert_abs_diff_eq!(fresh.log_likelihood(&t).unwrap(), after, epsilon = 1e-9);
    }

    #[test]
    fn full_optimization_improves() {
        let (_, mut ev) = setup("HKY+G4");
        let mut t = tree();
        let before = ev.log_likelihood(&t).unwrap();
        let after = ev.optimize_all(&mut t, 1e-3).unwrap();
        assert!(after > before);
    }

    #[test]
    fn nni_score_matches_applied_move() {
        let (_, mut ev) = setup("JC");
        let t = tree();
        ev.prepare_nni(&t).unwrap();
        for mv in t.nni_moves() {
            let score = ev.nni_score(&t, mv).unwrap();
            let mut moved = t.apply_move(mv).unwrap();
            let mut check = ev.clone();
            check.bind(&moved).unwrap();
            let Move::Nni { edge, .. } = mv else { unreachable!() };
            let optimized = check.optimize_branch(&mut moved, edge).unwrap();
            assert_abs_diff_eq!(score, optimized, epsilon = 1e-4);
        }
    }

    #[test]
    fn taxa_must_match() {
        let (_, mut ev) = setup("JC");
        let t = Tree::generate_random(5, BranchLengthMode::Fixed, 1).unwrap();
        assert!(matches!(ev.bind(&t), Err(PhyloError::TaxonSetMismatch(_))));
    }

    #[test]
    fn memory_estimate_scales_with_taxa() {
        let small = estimate_memory_bytes(10, &[(100, 4, 4)]);
        let large = estimate_memory_bytes(20, &[(100, 4, 4)]);
        assert!(large > 2 * small);

        let (_, mut ev) = setup("HKY+G4");
        let t = tree();
        assert_eq!(ev.cached_bytes(), 0);
        ev.prepare_nni(&t).unwrap();
        let npat = ev.parts[0].patterns.num_patterns();
        assert!(ev.cached_bytes() > 0);
        assert!(ev.cached_bytes() <= estimate_memory_bytes(5, &[(npat, 4, 4)]));
    }
}
