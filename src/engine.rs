//! The four commands as library functions.
//!
//! Each operation takes the invocation's [`Config`], does its own validation
//! and writes its output files next to the configured prefix. The command
//! line and the Python bindings are thin wrappers around these functions.
//!
//! | operation | output |
//! |---|---|
//! | [`random_tree`] | Newick text, `<prefix>.treefile` when a prefix is set |
//! | [`phylogenetic_analysis`] | `<prefix>.treefile`, `<prefix>.log`, `<prefix>.ckp.gz` |
//! | [`parsimony_multistate`] | `<prefix>.parstree` |
//! | [`rf_distance`] | `<prefix>.rfdist`, `<prefix>.wrfdist`, `<prefix>.bsdist` |

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use itertools::Itertools;
use log::{info, warn};
use rayon::prelude::*;

use crate::alignment::{Alignment, SitePatterns, load};
use crate::checkpoint::{
    CHECKPOINT_VERSION, RunCheckpoint, RunSummary, SearchStatus, SummaryCheckpoint, load_compatible,
    run_checkpoint_path, summary_path, suffixed, write_checkpoint,
};
use crate::config::{BranchLengthMode, Config, StartTree};
use crate::distance_tree::{bionj, jc_distances};
use crate::distances::{Metric, build_snapshots, cross_distance_matrix, pairwise_distance_matrix};
use crate::error::{PhyloError, Result};
use crate::io::{create_output, read_tree_file, write_matrix_tsv};
use crate::likelihood::{EvalOptions, Evaluator, estimate_memory_bytes};
use crate::model::{Model, ModelSpec, is_model_selection};
use crate::model_selection::{SelectionOptions, select_model};
use crate::parsimony::{Parsimony, parsimony_tree};
use crate::partition::{Partition, build_partitions};
use crate::random::{SearchRng, get_random_number_generator, run_seed};
use crate::run_log::RunLog;
use crate::search::{RunOutcome, SearchContext, SearchRun};
use crate::tree::{DEFAULT_BRANCH_LENGTH, Tree};

/// Result of [`phylogenetic_analysis`].
#[derive(Clone, Debug)]
pub struct AnalysisResult {
    pub log_likelihood: f64,
    /// Best tree in Newick form, rooted at the outgroup when one is set.
    pub tree: String,
    /// Final model of each partition.
    pub models: Vec<String>,
    pub best_run: usize,
    pub runs: Vec<RunSummary>,
    pub tree_file: PathBuf,
    pub log_file: PathBuf,
    pub checkpoint_file: PathBuf,
    /// The analysis had already finished and was read from its checkpoint.
    pub from_checkpoint: bool,
}

/// Result of [`parsimony_multistate`].
#[derive(Clone, Debug)]
pub struct ParsimonyResult {
    pub score: f64,
    pub tree: String,
    pub tree_file: PathBuf,
}

/// Result of [`rf_distance`].
#[derive(Clone, Debug)]
pub struct RfResult {
    pub row_names: Vec<String>,
    pub col_names: Vec<String>,
    pub rf: Vec<Vec<f64>>,
    pub weighted_rf: Vec<Vec<f64>>,
    pub branch_score: Vec<Vec<f64>>,
    pub rf_file: PathBuf,
}

fn with_thread_pool<T: Send>(config: &Config, job: impl FnOnce() -> Result<T> + Send) -> Result<T> {
    let threads = config.effective_threads();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| PhyloError::ResourceExhaustion(format!("cannot start {threads} worker threads: {e}")))?;
    pool.install(job)
}

/// Random tree over taxa `T1..Tn` from `config.seed`.
///
/// # Example
/// ```
/// # use phylo_search::config::{BranchLengthMode, Config};
/// # use phylo_search::engine::random_tree;
/// let config = Config { seed: 42, ..Config::default() };
/// let a = random_tree(&config, 10, BranchLengthMode::Uniform).unwrap();
/// let b = random_tree(&config, 10, BranchLengthMode::Uniform).unwrap();
/// assert_eq!(a, b);
/// ```
pub fn random_tree(config: &Config, num_taxa: usize, mode: BranchLengthMode) -> Result<String> {
    config.validate()?;
    let tree = Tree::generate_random(num_taxa, mode, config.seed)?;
    let newick = tree.to_newick_rooted(config.outgroup.as_deref())?;
    if let Some(prefix) = &config.prefix {
        write_tree_file(&suffixed(prefix, ".treefile"), &newick)?;
    }
    Ok(newick)
}

fn write_tree_file(path: &Path, newick: &str) -> Result<()> {
    let mut out = create_output(path)?;
    writeln!(out, "{newick}")?;
    out.flush()?;
    info!("Tree written to {}", path.display());
    Ok(())
}

/// Raw bytes of every input file, for the checkpoint guard.
fn input_files(config: &Config) -> Result<Vec<(PathBuf, Vec<u8>)>> {
    let mut paths = Vec::new();
    if let Some(aln) = &config.alignment {
        if aln.is_dir() {
            let mut files: Vec<PathBuf> = fs::read_dir(aln)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.is_file())
                .collect();
            files.sort();
            paths.extend(files);
        } else {
            paths.push(aln.clone());
        }
    }
    paths.extend(config.partition_file.iter().cloned());
    if let StartTree::File(p) = &config.start_tree {
        paths.push(p.clone());
    }
    paths
        .into_iter()
        .map(|p| {
            let bytes = fs::read(&p)?;
            Ok((p, bytes))
        })
        .collect()
}

fn read_start_tree(path: &Path, taxa: &[String]) -> Result<Tree> {
    let (_, mut tree) = read_tree_file(path)?.into_iter().next().ok_or_else(|| {
        PhyloError::MalformedInput(format!("{}: no tree found", path.display()))
    })?;
    tree.check_taxa(taxa)?;
    tree.resolve_polytomies(DEFAULT_BRANCH_LENGTH);
    Ok(tree)
}

fn all_site_patterns(alignment: &Alignment) -> SitePatterns {
    let sites: Vec<usize> = (0..alignment.num_sites()).collect();
    alignment.patterns(&sites)
}

/// Starting trees of a fresh run: its first tree and `nbest - 1` extra
/// parsimony (or random) trees.
fn initial_trees(
    run: usize,
    config: &Config,
    alignment: &Alignment,
    scorer: &Parsimony<'_>,
    fixed: Option<&Tree>,
    rng: &mut SearchRng,
) -> Result<Vec<Tree>> {
    let random = config.start_tree == StartTree::Random;
    let next = |rng: &mut SearchRng| -> Result<Tree> {
        if random {
            Tree::random_topology(alignment.names(), rng)
        } else {
            Ok(parsimony_tree(scorer, rng)?.0)
        }
    };
    let mut trees = Vec::with_capacity(config.search.nbest);
    match (run, fixed) {
        (0, Some(tree)) => trees.push(tree.clone()),
        _ => trees.push(next(rng)?),
    }
    while trees.len() < config.search.nbest {
        trees.push(next(rng)?);
    }
    Ok(trees)
}

fn partition_models(
    config: &Config,
    partitions: &[Partition],
    alignment: &Alignment,
    tree: &Tree,
    log: &RunLog,
) -> Result<Vec<Model>> {
    let fconst = config.fconst.as_deref();
    let eval = EvalOptions { min_branch_length: config.min_branch_length, safe: config.safe };
    partitions
        .iter()
        .map(|part| {
            let name = part.model.as_deref().unwrap_or(&config.model);
            if !is_model_selection(name) {
                let spec: ModelSpec = name.parse()?;
                return Model::new(&spec, part.seq_type, &part.patterns, fconst);
            }
            let options = SelectionOptions { merit: config.merit, epsilon: config.epsilon, fconst, eval };
            let patterns = Arc::new(part.patterns.clone());
            let selection = select_model(&part.name, part.seq_type, &patterns, alignment.names(), tree, &options)?;
            log.append(format!("Model selection for partition {}:", part.name))?;
            log.append(format!("{:<16} {:>14} {:>4} {:>14} {:>14} {:>14}", "Model", "LogL", "df", "AIC", "AICc", "BIC"))?;
            for fit in &selection.fits {
                log.append(format!(
                    "{:<16} {:>14.4} {:>4} {:>14.4} {:>14.4} {:>14.4}",
                    fit.name, fit.log_likelihood, fit.num_params, fit.aic, fit.aicc, fit.bic
                ))?;
            }
            log.append(format!(
                "Best-fit model according to {}: {}",
                selection.merit, selection.best_fit.name
            ))?;
            Ok(selection.best)
        })
        .collect()
}

struct AnalysisFiles {
    prefix: PathBuf,
    tree: PathBuf,
    log: PathBuf,
    checkpoint: PathBuf,
}

impl AnalysisFiles {
    fn new(prefix: PathBuf) -> Self {
        AnalysisFiles {
            tree: suffixed(&prefix, ".treefile"),
            log: suffixed(&prefix, ".log"),
            checkpoint: summary_path(&prefix),
            prefix,
        }
    }
}

/// Full maximum-likelihood analysis: load, choose models, search every run
/// and write the best tree.
///
/// A compatible finished checkpoint is reported without searching again;
/// unfinished run checkpoints are resumed unless `config.redo` is set.
/// `stop` is polled between search iterations.
///
/// # Errors
/// Input errors before any search starts; `Interrupted` or
/// `ResourceExhaustion` after the runs were checkpointed as STOPPED;
/// `CorruptCheckpoint` for checkpoints of other inputs.
pub fn phylogenetic_analysis(config: &Config, stop: &AtomicBool) -> Result<AnalysisResult> {
    config.validate()?;
    let aln_path = config
        .alignment
        .as_deref()
        .ok_or_else(|| PhyloError::InvalidParameter("an alignment file is required".to_string()))?;
    let alignment = load(aln_path, config.seq_type)?;
    let partitions = build_partitions(&alignment, config.partition_file.as_deref())?;
    if let Some(outgroup) = &config.outgroup {
        if alignment.taxon_index(outgroup).is_none() {
            return Err(PhyloError::InvalidParameter(format!("outgroup '{outgroup}' is not in the alignment")));
        }
    }
    let user_tree = match &config.start_tree {
        StartTree::File(path) => Some(read_start_tree(path, alignment.names())?),
        _ => None,
    };

    let inputs = input_files(config)?;
    let input_refs: Vec<(&Path, &[u8])> = inputs.iter().map(|(p, b)| (p.as_path(), b.as_slice())).collect();
    let input_hash = config.input_hash(&input_refs);
    let files = AnalysisFiles::new(config.output_prefix());

    if !config.redo {
        if let Some(result) = finished_result(config, &files, &input_hash)? {
            let log = RunLog::open(&files.log, false)?;
            log.append("Analysis already finished, reporting the checkpointed result")?;
            log.best_score(result.log_likelihood)?;
            write_tree_file(&files.tree, &result.tree)?;
            return Ok(result);
        }
    }
    let resuming = !config.redo
        && (0..config.runs).any(|k| run_checkpoint_path(&files.prefix, k, config.runs).exists());
    let log = RunLog::open(&files.log, !resuming)?;
    log.append(format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")))?;
    log.append(format!(
        "Alignment: {} ({} taxa, {} sites, {})",
        aln_path.display(),
        alignment.num_taxa(),
        alignment.num_sites(),
        alignment.seq_type()
    ))?;
    log.append(format!(
        "Partitions: {}; seed: {}; runs: {}; threads: {}",
        partitions.len(),
        config.seed,
        config.runs,
        config.effective_threads()
    ))?;
    for part in &partitions {
        let freqs = alignment.state_frequencies(&part.sites);
        log.append(format!(
            "State frequencies of {}: {}",
            part.name,
            freqs.iter().map(|f| format!("{f:.4}")).join(" ")
        ))?;
    }

    with_thread_pool(config, || {
        analyse(config, &alignment, &partitions, user_tree.as_ref(), &files, &input_hash, &log, stop)
    })
}

#[allow(clippy::too_many_arguments)]
fn analyse(
    config: &Config,
    alignment: &Alignment,
    partitions: &[Partition],
    user_tree: Option<&Tree>,
    files: &AnalysisFiles,
    input_hash: &str,
    log: &RunLog,
    stop: &AtomicBool,
) -> Result<AnalysisResult> {
    let all_patterns = all_site_patterns(alignment);
    let fixed_start = match (user_tree, &config.start_tree) {
        (Some(tree), _) => Some(tree.clone()),
        (None, StartTree::Bionj) => Some(bionj(alignment.names(), &jc_distances(&all_patterns))?),
        _ => None,
    };
    let selection_tree = match &fixed_start {
        Some(tree) => tree.clone(),
        None => bionj(alignment.names(), &jc_distances(&all_patterns))?,
    };

    let models = partition_models(config, partitions, alignment, &selection_tree, log)?;
    for (part, model) in partitions.iter().zip(&models) {
        log.append(format!("Model of partition {}: {}", part.name, model.name()))?;
    }

    let footprint: Vec<(usize, usize, usize)> = partitions
        .iter()
        .zip(&models)
        .map(|(p, m)| (p.patterns.num_patterns(), m.category_rates().len(), m.num_states()))
        .collect();
    let per_run = estimate_memory_bytes(alignment.num_taxa(), &footprint);
    let concurrent = config.runs.min(config.effective_threads()) as u64;
    if let Some(limit) = config.memory_limit_bytes() {
        let needed = per_run.saturating_mul(concurrent);
        if needed > limit {
            return Err(PhyloError::ResourceExhaustion(format!(
                "the search needs about {} MB but the ceiling is {} MB",
                needed.div_ceil(1024 * 1024),
                limit / (1024 * 1024)
            )));
        }
    }

    let template = Evaluator::new(
        partitions
            .iter()
            .zip(models)
            .map(|(p, m)| (p.name.clone(), Arc::new(p.patterns.clone()), m))
            .collect(),
        alignment.names().to_vec(),
        EvalOptions { min_branch_length: config.min_branch_length, safe: config.safe },
    );
    let scorer = Parsimony::new(&all_patterns, alignment.names());
    let ctx = SearchContext {
        params: &config.search,
        epsilon: config.epsilon,
        input_hash,
        log,
        stop,
        memory_limit: config.memory_limit_bytes().map(|limit| limit / concurrent.max(1)),
    };

    let results: Vec<Result<RunOutcome>> = (0..config.runs)
        .into_par_iter()
        .map(|run| {
            let path = run_checkpoint_path(&files.prefix, run, config.runs);
            let resumed = if config.redo { None } else { load_compatible::<RunCheckpoint>(&path, input_hash)? };
            let mut search = match resumed {
                Some(checkpoint) => {
                    log.append_run(run, format!("Resuming at iteration {}", checkpoint.iteration))?;
                    SearchRun::resume(checkpoint, template.clone(), path)?
                }
                None => {
                    let mut rng = get_random_number_generator(run_seed(config.seed, run));
                    let initial = initial_trees(run, config, alignment, &scorer, fixed_start.as_ref(), &mut rng)?;
                    SearchRun::start(run, template.clone(), rng, initial, path, &ctx)?
                }
            };
            search.search(&ctx)?;
            Ok(search.outcome())
        })
        .collect();

    let mut outcomes = Vec::with_capacity(results.len());
    for result in results {
        match result {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                log.append(format!("ERROR: {e}"))?;
                return Err(e);
            }
        }
    }

    let best = outcomes
        .iter()
        .fold(None::<&RunOutcome>, |acc, o| match acc {
            Some(b) if b.best.log_likelihood >= o.best.log_likelihood => Some(b),
            _ => Some(o),
        })
        .ok_or_else(|| PhyloError::InvalidParameter("no runs were requested".to_string()))?;
    let tree = best.best.tree.to_newick_rooted(config.outgroup.as_deref())?;
    let models: Vec<String> = best.models.iter().map(Model::name).collect();
    let runs: Vec<RunSummary> = outcomes
        .iter()
        .map(|o| RunSummary {
            run: o.run,
            status: o.status,
            log_likelihood: o.best.log_likelihood,
            iterations: o.iterations,
        })
        .collect();

    let stopped = outcomes.iter().find(|o| o.status == SearchStatus::Stopped);
    let status = if stopped.is_some() { SearchStatus::Stopped } else { SearchStatus::Converged };
    if config.runs > 1 {
        let summary = SummaryCheckpoint {
            version: CHECKPOINT_VERSION,
            input_hash: input_hash.to_string(),
            status,
            log_likelihood: best.best.log_likelihood,
            best_run: best.run,
            tree: tree.clone(),
            models: models.clone(),
            runs: runs.clone(),
        };
        write_checkpoint(&files.checkpoint, &summary)?;
    }

    if let Some(o) = stopped {
        let reason = o.stop_reason.clone().unwrap_or_else(|| "stopped".to_string());
        log.append(format!("Search stopped: {reason}. Rerun the same command to resume."))?;
        warn!("Search stopped: {reason}");
        return Err(if reason == "interrupted" {
            PhyloError::Interrupted(format!("checkpoint written to {}", files.checkpoint.display()))
        } else {
            PhyloError::ResourceExhaustion(reason)
        });
    }

    for model in &best.models {
        log.append(format!("Final model: {}", model.summary()))?;
    }
    if partitions.len() > 1 {
        let mut evaluator = template.clone();
        for (i, model) in best.models.iter().enumerate() {
            evaluator.set_model(i, model.clone());
        }
        evaluator.bind(&best.best.tree)?;
        let per_partition = evaluator.partition_log_likelihoods(&best.best.tree)?;
        for (name, ll) in evaluator.partition_names().into_iter().zip(per_partition) {
            log.append(format!("Partition {name}: log-likelihood {ll:.6}"))?;
        }
    }
    write_tree_file(&files.tree, &tree)?;
    log.append(format!("Best run: {}", best.run))?;
    log.best_score(best.best.log_likelihood)?;
    info!("BEST SCORE FOUND : {:.6}", best.best.log_likelihood);

    Ok(AnalysisResult {
        log_likelihood: best.best.log_likelihood,
        tree,
        models,
        best_run: best.run,
        runs,
        tree_file: files.tree.clone(),
        log_file: files.log.clone(),
        checkpoint_file: files.checkpoint.clone(),
        from_checkpoint: false,
    })
}

/// The result stored in a finished, compatible checkpoint.
fn finished_result(config: &Config, files: &AnalysisFiles, input_hash: &str) -> Result<Option<AnalysisResult>> {
    let make = |log_likelihood, tree, models, best_run, runs| AnalysisResult {
        log_likelihood,
        tree,
        models,
        best_run,
        runs,
        tree_file: files.tree.clone(),
        log_file: files.log.clone(),
        checkpoint_file: files.checkpoint.clone(),
        from_checkpoint: true,
    };
    if config.runs == 1 {
        let Some(ckp) = load_compatible::<RunCheckpoint>(&files.checkpoint, input_hash)? else {
            return Ok(None);
        };
        if !ckp.status.is_finished() {
            return Ok(None);
        }
        let tree = ckp.best_tree.to_newick_rooted(config.outgroup.as_deref())?;
        let models: Vec<String> = ckp.models.iter().map(Model::name).collect();
        let runs = vec![RunSummary {
            run: 0,
            status: ckp.status,
            log_likelihood: ckp.log_likelihood,
            iterations: ckp.iteration,
        }];
        return Ok(Some(make(ckp.log_likelihood, tree, models, 0, runs)));
    }
    let Some(summary) = load_compatible::<SummaryCheckpoint>(&files.checkpoint, input_hash)? else {
        return Ok(None);
    };
    if !summary.status.is_finished() {
        return Ok(None);
    }
    Ok(Some(make(summary.log_likelihood, summary.tree, summary.models, summary.best_run, summary.runs)))
}

/// Fitch score of a given tree (`config.start_tree` is a file) or of a
/// parsimony tree built from `config.seed`; writes `<prefix>.parstree`.
pub fn parsimony_multistate(config: &Config, input_file: &Path) -> Result<ParsimonyResult> {
    config.validate()?;
    let alignment = load(input_file, config.seq_type)?;
    let patterns = all_site_patterns(&alignment);
    let scorer = Parsimony::new(&patterns, alignment.names());
    let (tree, score) = with_thread_pool(config, || match &config.start_tree {
        StartTree::File(path) => {
            let tree = read_start_tree(path, alignment.names())?;
            let score = scorer.score(&tree)?;
            Ok((tree, score))
        }
        _ => parsimony_tree(&scorer, &mut get_random_number_generator(config.seed)),
    })?;
    info!("Parsimony score: {score}");

    let prefix = config.prefix.clone().unwrap_or_else(|| input_file.to_path_buf());
    let tree_file = suffixed(&prefix, ".parstree");
    let newick = tree.to_newick_rooted(config.outgroup.as_deref())?;
    write_tree_file(&tree_file, &newick)?;
    Ok(ParsimonyResult { score, tree: newick, tree_file })
}

/// RF, weighted RF and branch-score distances between every tree of
/// `tree1_file` and every tree of `tree2_file` (or all pairs of
/// `tree1_file`).
///
/// # Errors
/// `TaxonSetMismatch` if any two trees have different leaves.
pub fn rf_distance(config: &Config, tree1_file: &Path, tree2_file: Option<&Path>) -> Result<RfResult> {
    config.validate()?;
    let rows = read_tree_file(tree1_file)?;
    let cols = match tree2_file {
        Some(path) => read_tree_file(path)?,
        None => rows.clone(),
    };
    let split = |named: Vec<(String, Tree)>| -> (Vec<String>, Vec<Tree>) { named.into_iter().unzip() };
    let (row_names, row_trees) = split(rows);
    let (col_names, col_trees) = split(cols);

    let (rf, weighted_rf, branch_score) = with_thread_pool(config, || {
        let row_snaps = build_snapshots(&row_trees)?;
        if tree2_file.is_none() {
            return Ok((
                pairwise_distance_matrix(Metric::Rf, &row_snaps),
                pairwise_distance_matrix(Metric::Weighted, &row_snaps),
                pairwise_distance_matrix(Metric::BranchScore, &row_snaps),
            ));
        }
        let col_snaps = build_snapshots(&col_trees)?;
        Ok((
            cross_distance_matrix(Metric::Rf, &row_snaps, &col_snaps)?,
            cross_distance_matrix(Metric::Weighted, &row_snaps, &col_snaps)?,
            cross_distance_matrix(Metric::BranchScore, &row_snaps, &col_snaps)?,
        ))
    })?;

    let prefix = config.prefix.clone().unwrap_or_else(|| tree1_file.to_path_buf());
    let rf_file = suffixed(&prefix, ".rfdist");
    write_matrix_tsv(&rf_file, &row_names, &col_names, &rf)?;
    write_matrix_tsv(suffixed(&prefix, ".wrfdist"), &row_names, &col_names, &weighted_rf)?;
    write_matrix_tsv(suffixed(&prefix, ".bsdist"), &row_names, &col_names, &branch_score)?;
    info!("{} x {} RF distances written to {}", row_names.len(), col_names.len(), rf_file.display());

    Ok(RfResult { row_names, col_names, rf, weighted_rf, branch_score, rf_file })
}
