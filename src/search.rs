//! Tree search for one run.
//!
//! # Overview
//! A run keeps a pool of the `nbest` best distinct topologies. Every
//! iteration picks a pool tree at random, perturbs it with random moves,
//! re-optimizes its branch lengths and climbs to an NNI local optimum. The
//! result enters the pool when it is a new topology that beats the worst
//! entry.
//!
//! ```text
//! INIT ──► SEARCHING ──► CONVERGED
//!              │
//!              └──► STOPPED   (interrupt, memory ceiling, numerical failure)
//! ```
//!
//! # Convergence
//! Checked at every iteration boundary, first match wins:
//! 1. stop flag set: STOPPED
//! 2. cached partials over the memory ceiling: STOPPED
//! 3. `nstop` consecutive iterations without improving the best score
//! 4. `cmin > 0` and the pool topologies unchanged for `cmin` iterations
//! 5. the pool is full and every entry is within `epsilon` of the best
//! 6. `max_iterations` reached
//!
//! A checkpoint is written after every improvement, every
//! `checkpoint_interval` iterations and when the run ends. Each iteration
//! starts from a freshly bound evaluator and draws only from the run's own
//! generator, so a resumed run repeats the uninterrupted trajectory exactly.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use rand::Rng;
use rayon::prelude::*;

use crate::bitset::Bitset;
use crate::checkpoint::{CHECKPOINT_VERSION, PoolEntry, RunCheckpoint, SearchStatus, write_checkpoint};
use crate::config::SearchParams;
use crate::error::{PhyloError, Result};
use crate::likelihood::Evaluator;
use crate::model::Model;
use crate::random::SearchRng;
use crate::run_log::RunLog;
use crate::snapshot::TreeSnapshot;
use crate::tree::{Move, Tree};

/// Neighbourhood of the random SPR that opens each perturbation.
pub const SPR_RADIUS: usize = 3;

/// Branch-length passes after a hill climb.
const FINAL_BRANCH_PASSES: usize = 2;

/// Shared, read-only settings of the runs of one analysis.
pub struct SearchContext<'a> {
    pub params: &'a SearchParams,
    pub epsilon: f64,
    pub input_hash: &'a str,
    pub log: &'a RunLog,
    pub stop: &'a AtomicBool,
    pub memory_limit: Option<u64>,
}

/// Final state of a run.
#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub run: usize,
    pub status: SearchStatus,
    pub best: PoolEntry,
    pub models: Vec<Model>,
    pub iterations: usize,
    pub evaluations: u64,
    pub stop_reason: Option<String>,
}

/// One run's search state. Owned exclusively by the thread driving it.
pub struct SearchRun {
    run: usize,
    status: SearchStatus,
    evaluator: Evaluator,
    rng: SearchRng,
    pool: Vec<PoolEntry>,
    iteration: usize,
    unsuccessful: usize,
    stable_rounds: usize,
    evaluations: u64,
    stop_reason: Option<String>,
    checkpoint_path: PathBuf,
}

impl SearchRun {
    /// INIT: optimize the starting trees and fill the pool. Model parameters
    /// are optimized on the first tree only.
    pub fn start(
        run: usize,
        evaluator: Evaluator,
        rng: SearchRng,
        initial: Vec<Tree>,
        checkpoint_path: PathBuf,
        ctx: &SearchContext<'_>,
    ) -> Result<Self> {
        if initial.is_empty() {
            return Err(PhyloError::InvalidParameter(format!("run {run} has no starting tree")));
        }
        let mut search = SearchRun {
            run,
            status: SearchStatus::Init,
            evaluator,
            rng,
            pool: Vec::new(),
            iteration: 0,
            unsuccessful: 0,
            stable_rounds: 0,
            evaluations: 0,
            stop_reason: None,
            checkpoint_path,
        };

        for (i, mut tree) in initial.into_iter().enumerate() {
            search.evaluator.bind(&tree)?;
            let start = if i == 0 {
                search.evaluator.optimize_all(&mut tree, ctx.epsilon)?
            } else {
                search.evaluator.optimize_branches(&mut tree, FINAL_BRANCH_PASSES, ctx.epsilon)?
            };
            let ll = search.hill_climb(&mut tree, ctx.epsilon)?;
            debug!("Run {run}: starting tree {i}: {start:.6} -> {ll:.6}");
            search.offer(tree, ll, ctx.params.nbest)?;
        }
        search.status = SearchStatus::Searching;
        ctx.log.append_run(run, format!("Initial log-likelihood: {:.6}", search.best_log_likelihood()))?;
        search.write(ctx)?;
        Ok(search)
    }

    /// Continue from a checkpoint. `evaluator` supplies the data; its models
    /// are replaced by the checkpointed ones.
    pub fn resume(checkpoint: RunCheckpoint, mut evaluator: Evaluator, checkpoint_path: PathBuf) -> Result<Self> {
        let num_parts = evaluator.models().len();
        if checkpoint.models.len() != num_parts || checkpoint.pool.is_empty() {
            return Err(PhyloError::CorruptCheckpoint(format!(
                "{}: expected {num_parts} models and a non-empty pool",
                checkpoint_path.display()
            )));
        }
        for (i, model) in checkpoint.models.into_iter().enumerate() {
            evaluator.set_model(i, model);
        }
        for entry in &checkpoint.pool {
            evaluator.bind(&entry.tree)?;
        }
        let status = match checkpoint.status {
            SearchStatus::Converged => SearchStatus::Converged,
            _ => SearchStatus::Searching,
        };
        Ok(SearchRun {
            run: checkpoint.run,
            status,
            evaluator,
            rng: checkpoint.rng,
            pool: checkpoint.pool,
            iteration: checkpoint.iteration,
            unsuccessful: checkpoint.unsuccessful,
            stable_rounds: checkpoint.stable_rounds,
            evaluations: checkpoint.evaluations,
            stop_reason: checkpoint.stop_reason,
            checkpoint_path,
        })
    }

    pub fn status(&self) -> SearchStatus {
        self.status
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn pool(&self) -> &[PoolEntry] {
        &self.pool
    }

    pub fn best_log_likelihood(&self) -> f64 {
        self.pool.first().map_or(f64::NEG_INFINITY, |e| e.log_likelihood)
    }

    /// SEARCHING until CONVERGED or STOPPED. A run that was already converged
    /// returns immediately.
    ///
    /// # Errors
    /// `NumericalFailure` after the run has been checkpointed as STOPPED;
    /// I/O errors from the checkpoint or log.
    pub fn search(&mut self, ctx: &SearchContext<'_>) -> Result<()> {
        while self.status == SearchStatus::Searching {
            if let Some((status, reason)) = self.check_convergence(ctx) {
                self.finish(status, reason, ctx)?;
                break;
            }
            match self.iterate(ctx) {
                Ok(()) => {}
                Err(PhyloError::NumericalFailure(msg)) => {
                    warn!("Run {}: {msg}", self.run);
                    self.finish(SearchStatus::Stopped, format!("numerical failure: {msg}"), ctx)?;
                    return Err(PhyloError::NumericalFailure(msg));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn check_convergence(&self, ctx: &SearchContext<'_>) -> Option<(SearchStatus, String)> {
        let params = ctx.params;
        if ctx.stop.load(Ordering::SeqCst) {
            return Some((SearchStatus::Stopped, "interrupted".to_string()));
        }
        if let Some(limit) = ctx.memory_limit {
            let used = self.evaluator.cached_bytes();
            if used > limit {
                return Some((
                    SearchStatus::Stopped,
                    format!("memory ceiling exceeded ({used} > {limit} bytes)"),
                ));
            }
        }
        if self.unsuccessful >= params.nstop {
            return Some((
                SearchStatus::Converged,
                format!("{} iterations without improvement", self.unsuccessful),
            ));
        }
        if params.cmin > 0 && self.stable_rounds >= params.cmin {
            return Some((
                SearchStatus::Converged,
                format!("candidate pool unchanged for {} iterations", self.stable_rounds),
            ));
        }
        let best = self.best_log_likelihood();
        if self.iteration > 0
            && self.pool.len() >= params.nbest
            && self.pool.iter().all(|e| best - e.log_likelihood <= ctx.epsilon)
        {
            return Some((SearchStatus::Converged, format!("all {} candidates within epsilon", params.nbest)));
        }
        if self.iteration >= params.max_iterations {
            return Some((SearchStatus::Converged, format!("reached {} iterations", self.iteration)));
        }
        None
    }

    /// One perturb / optimize / climb step.
    fn iterate(&mut self, ctx: &SearchContext<'_>) -> Result<()> {
        self.iteration += 1;
        let pick = self.rng.gen_range(0..self.pool.len());
        let mut tree = self.pool[pick].tree.clone();
        self.perturb(&mut tree, ctx.params.perturbation_strength)?;

        self.evaluator.bind(&tree)?;
        self.evaluator.optimize_branches(&mut tree, 1, ctx.epsilon)?;
        let ll = self.hill_climb(&mut tree, ctx.epsilon)?;

        let best_before = self.best_log_likelihood();
        let changed = self.offer(tree, ll, ctx.params.nbest)?;
        self.stable_rounds = if changed { 0 } else { self.stable_rounds + 1 };

        let improved = ll > best_before + ctx.epsilon;
        debug!(
            "Run {} iteration {}: {ll:.6} (best {:.6}, pool {})",
            self.run,
            self.iteration,
            self.best_log_likelihood(),
            self.pool.len()
        );
        if improved {
            self.unsuccessful = 0;
            ctx.log.append_run(
                self.run,
                format!("Iteration {}: better tree found, log-likelihood {ll:.6}", self.iteration),
            )?;
            self.write(ctx)?;
        } else {
            self.unsuccessful += 1;
            if self.iteration % ctx.params.checkpoint_interval == 0 {
                self.write(ctx)?;
            }
        }
        Ok(())
    }

    /// One random SPR followed by random NNIs, `strength` of the internal
    /// branches in total.
    fn perturb(&mut self, tree: &mut Tree, strength: f64) -> Result<()> {
        let internal = tree.internal_edges().len();
        if internal == 0 {
            return Ok(());
        }
        let steps = ((strength * internal as f64).round() as usize).max(1);
        if let Some(mv) = tree.random_spr(&mut self.rng, SPR_RADIUS) {
            tree.apply_move_in_place(mv)?;
        }
        for _ in 1..steps {
            if let Some(mv) = tree.random_nni(&mut self.rng) {
                tree.apply_move_in_place(mv)?;
            }
        }
        Ok(())
    }

    /// Apply the best improving NNI until none gains more than `epsilon`,
    /// then polish branch lengths. `tree` must be bound.
    fn hill_climb(&mut self, tree: &mut Tree, epsilon: f64) -> Result<f64> {
        let mut ll = self.evaluator.log_likelihood(tree)?;
        let max_rounds = 2 * tree.num_edges();
        for _ in 0..max_rounds {
            self.evaluator.prepare_nni(tree)?;
            let moves = tree.nni_moves();
            let evaluator = &self.evaluator;
            let current: &Tree = tree;
            let scores: Vec<f64> = moves
                .par_iter()
                .map(|&mv| evaluator.nni_score(current, mv))
                .collect::<Result<_>>()?;
            let mut best: Option<(Move, f64)> = None;
            for (&mv, &score) in moves.iter().zip(&scores) {
                if score > ll + epsilon && best.is_none_or(|(_, s)| score > s) {
                    best = Some((mv, score));
                }
            }
            let Some((mv, _)) = best else { break };
            ll = self.evaluator.apply_nni(tree, mv)?;
        }
        self.evaluator.optimize_branches(tree, FINAL_BRANCH_PASSES, epsilon)
    }

    /// Offer a tree to the pool. Returns whether the set of pool topologies changed.
    fn offer(&mut self, tree: Tree, log_likelihood: f64, nbest: usize) -> Result<bool> {
        let key = topology_key(&tree)?;
        for entry in self.pool.iter_mut() {
            if topology_key(&entry.tree)? == key {
                if log_likelihood > entry.log_likelihood {
                    *entry = PoolEntry { log_likelihood, tree };
                    self.sort_pool();
                }
                return Ok(false);
            }
        }
        let worst = self.pool.last().map_or(f64::NEG_INFINITY, |e| e.log_likelihood);
        if self.pool.len() >= nbest && log_likelihood <= worst {
            return Ok(false);
        }
        self.pool.push(PoolEntry { log_likelihood, tree });
        self.sort_pool();
        self.pool.truncate(nbest);
        Ok(true)
    }

    fn sort_pool(&mut self) {
        self.pool.sort_by(|a, b| b.log_likelihood.total_cmp(&a.log_likelihood));
    }

    /// Leave SEARCHING. A converged run gets a final model and branch-length
    /// optimization on its best tree.
    fn finish(&mut self, status: SearchStatus, reason: String, ctx: &SearchContext<'_>) -> Result<()> {
        if status == SearchStatus::Converged {
            let mut tree = self.pool[0].tree.clone();
            let previous: Vec<Model> = self.evaluator.models().into_iter().cloned().collect();
            self.evaluator.bind(&tree)?;
            let ll = self.evaluator.optimize_all(&mut tree, ctx.epsilon)?;
            if ll > self.pool[0].log_likelihood {
                self.pool[0] = PoolEntry { log_likelihood: ll, tree };
            } else {
                // the stored score belongs to the old parameters
                for (i, model) in previous.into_iter().enumerate() {
                    self.evaluator.set_model(i, model);
                }
            }
            info!("Run {} converged after {} iterations: {reason}", self.run, self.iteration);
        } else {
            warn!("Run {} stopped at iteration {}: {reason}", self.run, self.iteration);
        }
        self.status = status;
        ctx.log.append_run(
            self.run,
            format!(
                "{} after {} iterations ({reason}), best log-likelihood {:.6}",
                if status == SearchStatus::Converged { "Converged" } else { "Stopped" },
                self.iteration,
                self.best_log_likelihood()
            ),
        )?;
        self.stop_reason = Some(reason);
        self.write(ctx)
    }

    pub fn snapshot(&self, input_hash: &str) -> RunCheckpoint {
        RunCheckpoint {
            version: CHECKPOINT_VERSION,
            input_hash: input_hash.to_string(),
            run: self.run,
            status: self.status,
            log_likelihood: self.best_log_likelihood(),
            best_tree: self.pool[0].tree.clone(),
            models: self.evaluator.models().into_iter().cloned().collect(),
            pool: self.pool.clone(),
            iteration: self.iteration,
            unsuccessful: self.unsuccessful,
            stable_rounds: self.stable_rounds,
            evaluations: self.evaluations + self.evaluator.evaluations(),
            rng: self.rng.clone(),
            stop_reason: self.stop_reason.clone(),
        }
    }

    fn write(&self, ctx: &SearchContext<'_>) -> Result<()> {
        write_checkpoint(&self.checkpoint_path, &self.snapshot(ctx.input_hash))
    }

    pub fn outcome(&self) -> RunOutcome {
        RunOutcome {
            run: self.run,
            status: self.status,
            best: self.pool[0].clone(),
            models: self.evaluator.models().into_iter().cloned().collect(),
            iterations: self.iteration,
            evaluations: self.evaluations + self.evaluator.evaluations(),
            stop_reason: self.stop_reason.clone(),
        }
    }
}

fn topology_key(tree: &Tree) -> Result<Vec<Bitset>> {
    Ok(TreeSnapshot::from_tree(tree)?.topology_key())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::{SeqType, parse_alignment};
    use crate::checkpoint::read_checkpoint;
    use crate::likelihood::EvalOptions;
    use crate::random::get_random_number_generator;
    use std::sync::Arc;

    const ALN: &str = "6 20\n\
        A ACGTACGTACGTAAAACCGT\n\
        B ACGTACGTACGAAAAACCGT\n\
        C ACGAACTTACGTTAAACCGA\n\
        D ACCTACTTACGTTAACCCGA\n\
        E TCCTACTTAGGTTAACCTGA\n\
        F TCCTACTAAGGTTTACCTGA\n";

    fn evaluator() -> (Evaluator, Vec<String>) {
        let aln = parse_alignment(ALN, "t", None).unwrap();
        let sites: Vec<usize> = (0..aln.num_sites()).collect();
        let patterns = Arc::new(aln.patterns(&sites));
        let model = Model::new(&"JC".parse().unwrap(), SeqType::Dna, &patterns, None).unwrap();
        let ev = Evaluator::new(
            vec![("all".to_string(), patterns, model)],
            aln.names().to_vec(),
            EvalOptions { min_branch_length: 1e-6, safe: false },
        );
        (ev, aln.names().to_vec())
    }

    fn params() -> SearchParams {
        SearchParams { nstop: 5, nbest: 3, cmin: 0, max_iterations: 30, ..SearchParams::default() }
    }

    fn run_once(dir: &std::path::Path, seed: u64, stop_after: Option<usize>) -> (SearchRun, PathBuf) {
        let (ev, names) = evaluator();
        let path = dir.join("run.ckp.gz");
        let log = RunLog::open(&dir.join("run.log"), false).unwrap();
        let stop = AtomicBool::new(false);
        let p = params();
        let ctx = SearchContext { params: &p, epsilon: 0.01, input_hash: "h", log: &log, stop: &stop, memory_limit: None };
        let mut rng = get_random_number_generator(seed);
        let start = Tree::random_topology(&names, &mut rng).unwrap();
        let mut run = SearchRun::start(0, ev, rng, vec![start], path.clone(), &ctx).unwrap();
        if let Some(n) = stop_after {
            while run.status() == SearchStatus::Searching && run.iteration() < n {
                if let Some((status, reason)) = run.check_convergence(&ctx) {
                    run.finish(status, reason, &ctx).unwrap();
                    break;
                }
                run.iterate(&ctx).unwrap();
            }
            stop.store(true, Ordering::SeqCst);
        }
        run.search(&ctx).unwrap();
        (run, path)
    }

    #[test]
    fn converges_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let (run, path) = run_once(dir.path(), 1, None);
        assert_eq!(run.status(), SearchStatus::Converged);
        let ckp: RunCheckpoint = read_checkpoint(&path).unwrap();
        assert_eq!(ckp.status, SearchStatus::Converged);
        assert_eq!(ckp.log_likelihood, run.best_log_likelihood());
        assert!(run.pool().windows(2).all(|w| w[0].log_likelihood >= w[1].log_likelihood));
        assert!(run.pool().len() <= 3);
    }

    #[test]
    fn same_seed_same_score() {
        let d1 = tempfile::tempdir().unwrap();
        let d2 = tempfile::tempdir().unwrap();
        let (a, _) = run_once(d1.path(), 7, None);
        let (b, _) = run_once(d2.path(), 7, None);
        assert_eq!(a.best_log_likelihood(), b.best_log_likelihood());
        assert_eq!(a.iteration(), b.iteration());
    }

    #[test]
    fn resume_matches_uninterrupted_run() {
        let full_dir = tempfile::tempdir().unwrap();
        let (full, _) = run_once(full_dir.path(), 11, None);

        let dir = tempfile::tempdir().unwrap();
        let (stopped, path) = run_once(dir.path(), 11, Some(2));
        if stopped.status() == SearchStatus::Converged {
            assert_eq!(stopped.best_log_likelihood(), full.best_log_likelihood());
            return;
        }
        assert_eq!(stopped.status(), SearchStatus::Stopped);

        let ckp: RunCheckpoint = read_checkpoint(&path).unwrap();
        assert_eq!(ckp.status, SearchStatus::Stopped);
        let (ev, _) = evaluator();
        let mut resumed = SearchRun::resume(ckp, ev, path).unwrap();
        let log = RunLog::open(&dir.path().join("run.log"), false).unwrap();
        let stop = AtomicBool::new(false);
        let p = params();
        let ctx = SearchContext { params: &p, epsilon: 0.01, input_hash: "h", log: &log, stop: &stop, memory_limit: None };
        resumed.search(&ctx).unwrap();
        assert_eq!(resumed.status(), SearchStatus::Converged);
        assert_eq!(resumed.iteration(), full.iteration());
        assert_eq!(resumed.best_log_likelihood(), full.best_log_likelihood());
    }

    #[test]
    fn memory_ceiling_stops() {
        let dir = tempfile::tempdir().unwrap();
        let (ev, names) = evaluator();
        let log = RunLog::open(&dir.path().join("run.log"), true).unwrap();
        let stop = AtomicBool::new(false);
        let p = params();
        let ctx = SearchContext { params: &p, epsilon: 0.01, input_hash: "h", log: &log, stop: &stop, memory_limit: Some(16) };
        let mut rng = get_random_number_generator(2);
        let start = Tree::random_topology(&names, &mut rng).unwrap();
        let mut run = SearchRun::start(0, ev, rng, vec![start], dir.path().join("c.ckp.gz"), &ctx).unwrap();
        run.search(&ctx).unwrap();
        assert_eq!(run.status(), SearchStatus::Stopped);
        assert!(run.outcome().stop_reason.unwrap().contains("memory"));
    }

    #[test]
    fn pool_keeps_distinct_topologies() {
        let dir = tempfile::tempdir().unwrap();
        let (run_state, _) = run_once(dir.path(), 3, None);
        let keys: Vec<Vec<Bitset>> = run_state.pool().iter().map(|e| topology_key(&e.tree).unwrap()).collect();
        for i in 0..keys.len() {
            for j in i + 1..keys.len() {
                assert_ne!(keys[i], keys[j]);
            }
        }
    }
}
