//! Python binding layer.
//!
//! One function per command, taking the same options as the command line
//! (general options as keyword arguments) and returning plain Python values.
//! Errors become `ValueError`, or `OSError` for I/O failures.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use pyo3::exceptions::{PyOSError, PyValueError};
use pyo3::prelude::*;

use crate::config::{BranchLengthMode, Config, SearchParams, StartTree};
use crate::engine;
use crate::error::PhyloError;

fn to_py(err: PhyloError) -> PyErr {
    match err {
        PhyloError::Io(e) => PyOSError::new_err(e.to_string()),
        other => PyValueError::new_err(other.to_string()),
    }
}

#[allow(clippy::too_many_arguments)]
fn build_config(
    alignment: Option<String>,
    partition_file: Option<String>,
    start_tree: Option<String>,
    prefix: Option<String>,
    model: Option<String>,
    seed: u64,
    runs: usize,
    num_threads: usize,
    redo: bool,
    nstop: Option<usize>,
    cmin: Option<usize>,
) -> PyResult<Config> {
    let defaults = SearchParams::default();
    let start_tree = match start_tree {
        Some(s) => s.parse::<StartTree>().map_err(to_py)?,
        None => StartTree::Bionj,
    };
    Ok(Config {
        alignment: alignment.map(PathBuf::from),
        partition_file: partition_file.map(PathBuf::from),
        start_tree,
        prefix: prefix.map(PathBuf::from),
        model: model.unwrap_or_else(|| "TEST".to_string()),
        seed,
        runs,
        num_threads,
        redo,
        search: SearchParams {
            nstop: nstop.unwrap_or(defaults.nstop),
            cmin: cmin.unwrap_or(defaults.cmin),
            ..defaults
        },
        ..Config::default()
    })
}

/// Generate a random tree.
///
/// Args:
///     num_taxa: Number of leaves (at least 3)
///     branch_length_mode: uniform-random | fixed-constant | exponential-random
///     seed: Random seed (default: 0)
///
/// Returns:
///     The tree in Newick format
#[pyfunction]
#[pyo3(signature = (num_taxa, branch_length_mode="uniform-random", seed=0, prefix=None))]
fn random_tree(num_taxa: usize, branch_length_mode: &str, seed: u64, prefix: Option<String>) -> PyResult<String> {
    let mode: BranchLengthMode = branch_length_mode.parse().map_err(to_py)?;
    let config = Config { seed, prefix: prefix.map(PathBuf::from), ..Config::default() };
    engine::random_tree(&config, num_taxa, mode).map_err(to_py)
}

/// Run model selection and tree search on an alignment.
///
/// Returns:
///     A dict with `log_likelihood`, `tree`, `models` and the output file paths
#[pyfunction]
#[pyo3(signature = (
    aln_file, partition_file=None, tree_file=None, out_prefix=None, num_threads=1, seed=0,
    model=None, runs=1, redo=false, nstop=None, cmin=None
))]
#[allow(clippy::too_many_arguments)]
fn phylogenetic_analysis(
    py: Python<'_>,
    aln_file: String,
    partition_file: Option<String>,
    tree_file: Option<String>,
    out_prefix: Option<String>,
    num_threads: usize,
    seed: u64,
    model: Option<String>,
    runs: usize,
    redo: bool,
    nstop: Option<usize>,
    cmin: Option<usize>,
) -> PyResult<Py<PyAny>> {
    let config = build_config(
        Some(aln_file),
        partition_file,
        tree_file,
        out_prefix,
        model,
        seed,
        runs,
        num_threads,
        redo,
        nstop,
        cmin,
    )?;
    let stop = AtomicBool::new(false);
    let result = engine::phylogenetic_analysis(&config, &stop).map_err(to_py)?;
    let out = pyo3::types::PyDict::new(py);
    out.set_item("log_likelihood", result.log_likelihood)?;
    out.set_item("tree", result.tree)?;
    out.set_item("models", result.models)?;
    out.set_item("best_run", result.best_run)?;
    out.set_item("tree_file", result.tree_file.display().to_string())?;
    out.set_item("log_file", result.log_file.display().to_string())?;
    out.set_item("checkpoint_file", result.checkpoint_file.display().to_string())?;
    Ok(out.into_any().unbind())
}

/// Multistate parsimony on an alignment.
///
/// Returns:
///     A tuple of (score, newick)
#[pyfunction]
#[pyo3(signature = (input_file, tree_file=None, seed=0, prefix=None))]
fn parsimony_multistate(
    input_file: String,
    tree_file: Option<String>,
    seed: u64,
    prefix: Option<String>,
) -> PyResult<(f64, String)> {
    let config = build_config(None, None, tree_file, prefix, None, seed, 1, 1, false, None, None)?;
    let result = engine::parsimony_multistate(&config, &PathBuf::from(input_file)).map_err(to_py)?;
    Ok((result.score, result.tree))
}

/// Robinson-Foulds distances between the trees of two files.
///
/// Returns:
///     A tuple of (row_names, col_names, distance_matrix)
#[pyfunction]
#[pyo3(signature = (tree1_file, tree2_file=None, prefix=None))]
fn rf_distance(
    tree1_file: String,
    tree2_file: Option<String>,
    prefix: Option<String>,
) -> PyResult<(Vec<String>, Vec<String>, Vec<Vec<usize>>)> {
    let config = Config { prefix: prefix.map(PathBuf::from), ..Config::default() };
    let tree2 = tree2_file.map(PathBuf::from);
    let result =
        engine::rf_distance(&config, &PathBuf::from(tree1_file), tree2.as_deref()).map_err(to_py)?;
    let matrix = result
        .rf
        .iter()
        .map(|row| row.iter().map(|&d| d as usize).collect())
        .collect();
    Ok((result.row_names, result.col_names, matrix))
}

/// Python module definition
#[pymodule]
fn phylo_search(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(random_tree, m)?)?;
    m.add_function(wrap_pyfunction!(phylogenetic_analysis, m)?)?;
    m.add_function(wrap_pyfunction!(parsimony_multistate, m)?)?;
    m.add_function(wrap_pyfunction!(rf_distance, m)?)?;
    Ok(())
}
