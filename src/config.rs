//! Immutable per-invocation configuration.
//!
//! Built once by the command line (or the Python layer) from the general
//! options, validated before any input is read, then passed by reference
//! into every engine operation.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::LevelFilter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::alignment::SeqType;
use crate::error::{PhyloError, Result};

/// Shortest branch length the likelihood code will evaluate.
pub const DEFAULT_MIN_BRANCH_LENGTH: f64 = 1e-6;

/// Longest branch length the optimizer will propose.
pub const MAX_BRANCH_LENGTH: f64 = 10.0;

/// How `random-tree` assigns branch lengths.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchLengthMode {
    /// Uniform in `[min, 2 * mean]`.
    Uniform,
    /// Every branch gets the mean length.
    Fixed,
    /// Exponential with the mean length, clamped to `[min, max]`.
    Exponential,
}

impl FromStr for BranchLengthMode {
    type Err = PhyloError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "uniform" | "uniform-random" => Ok(BranchLengthMode::Uniform),
            "fixed" | "fixed-constant" | "constant" => Ok(BranchLengthMode::Fixed),
            "exponential" | "exponential-random" | "exp" => Ok(BranchLengthMode::Exponential),
            other => Err(PhyloError::InvalidParameter(format!(
                "unknown branch length mode '{other}' (expected uniform-random, fixed-constant or exponential-random)"
            ))),
        }
    }
}

/// Information criterion used by model selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Merit {
    Aic,
    Aicc,
    Bic,
}

impl FromStr for Merit {
    type Err = PhyloError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "AIC" => Ok(Merit::Aic),
            "AICC" => Ok(Merit::Aicc),
            "BIC" => Ok(Merit::Bic),
            other => Err(PhyloError::InvalidParameter(format!(
                "unknown model selection criterion '{other}' (expected AIC, AICc or BIC)"
            ))),
        }
    }
}

impl fmt::Display for Merit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Merit::Aic => "AIC",
            Merit::Aicc => "AICc",
            Merit::Bic => "BIC",
        };
        f.write_str(s)
    }
}

/// Where the first candidate tree of every run comes from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartTree {
    Bionj,
    Parsimony,
    Random,
    File(PathBuf),
}

impl FromStr for StartTree {
    type Err = PhyloError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BIONJ" | "NJ" => Ok(StartTree::Bionj),
            "PARS" | "PARSIMONY" => Ok(StartTree::Parsimony),
            "RAND" | "RANDOM" => Ok(StartTree::Random),
            _ => Ok(StartTree::File(PathBuf::from(s))),
        }
    }
}

/// Console verbosity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Verbosity {
    pub fn from_flags(verbose: bool, quiet: bool) -> Self {
        match (verbose, quiet) {
            (_, true) => Verbosity::Quiet,
            (true, false) => Verbosity::Verbose,
            (false, false) => Verbosity::Normal,
        }
    }

    pub fn level_filter(self) -> LevelFilter {
        match self {
            Verbosity::Quiet => LevelFilter::Error,
            Verbosity::Normal => LevelFilter::Info,
            Verbosity::Verbose => LevelFilter::Debug,
        }
    }
}

/// Stopping rules and perturbation strength of the tree search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    /// Consecutive unsuccessful iterations before convergence.
    pub nstop: usize,
    /// Size of the candidate pool.
    pub nbest: usize,
    /// Rounds the full candidate pool must stay unchanged before convergence (0 disables).
    pub cmin: usize,
    /// Hard cap on iterations per run.
    pub max_iterations: usize,
    /// Fraction of internal branches touched by one perturbation.
    pub perturbation_strength: f64,
    /// Iterations between periodic checkpoints.
    pub checkpoint_interval: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        SearchParams {
            nstop: 100,
            nbest: 5,
            cmin: 0,
            max_iterations: 1000,
            perturbation_strength: 0.5,
            checkpoint_interval: 10,
        }
    }
}

/// One invocation's options after parsing.
#[derive(Clone, Debug)]
pub struct Config {
    pub alignment: Option<PathBuf>,
    pub partition_file: Option<PathBuf>,
    pub seq_type: Option<SeqType>,
    pub start_tree: StartTree,
    pub outgroup: Option<String>,
    pub prefix: Option<PathBuf>,
    pub seed: u64,
    pub safe: bool,
    pub mem_mb: Option<u64>,
    pub runs: usize,
    pub verbosity: Verbosity,
    pub fconst: Option<Vec<f64>>,
    pub epsilon: f64,
    pub num_threads: usize,
    pub threads_max: Option<usize>,
    pub model: String,
    pub merit: Merit,
    pub min_branch_length: f64,
    pub redo: bool,
    pub search: SearchParams,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            alignment: None,
            partition_file: None,
            seq_type: None,
            start_tree: StartTree::Bionj,
            outgroup: None,
            prefix: None,
            seed: 0,
            safe: false,
            mem_mb: None,
            runs: 1,
            verbosity: Verbosity::Normal,
            fconst: None,
            epsilon: 0.01,
            num_threads: 1,
            threads_max: None,
            model: "TEST".to_string(),
            merit: Merit::Bic,
            min_branch_length: DEFAULT_MIN_BRANCH_LENGTH,
            redo: false,
            search: SearchParams::default(),
        }
    }
}

/// Parse `--fconst` as comma or whitespace separated frequencies.
pub fn parse_fconst(text: &str) -> Result<Vec<f64>> {
    text.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f64>().map_err(|_| {
                PhyloError::InvalidParameter(format!("fconst value '{s}' is not a number"))
            })
        })
        .collect()
}

impl Config {
    /// Reject option values no stage could work with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(PhyloError::InvalidParameter(msg));

        if self.runs == 0 {
            return invalid("runs must be at least 1".to_string());
        }
        if self.num_threads == 0 {
            return invalid("number of threads must be at least 1".to_string());
        }
        if self.threads_max == Some(0) {
            return invalid("threads-max must be at least 1".to_string());
        }
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return invalid(format!("epsilon must be a positive number, got {}", self.epsilon));
        }
        if self.mem_mb == Some(0) {
            return invalid("memory ceiling must be positive".to_string());
        }
        if !(self.min_branch_length > 0.0 && self.min_branch_length < MAX_BRANCH_LENGTH) {
            return invalid(format!(
                "minimum branch length must be in (0, {MAX_BRANCH_LENGTH}), got {}",
                self.min_branch_length
            ));
        }
        if let Some(freqs) = &self.fconst {
            if freqs.len() < 2 {
                return invalid("fconst needs one frequency per state".to_string());
            }
            if freqs.iter().any(|f| !(f.is_finite() && *f > 0.0)) {
                return invalid("fconst frequencies must be positive".to_string());
            }
        }
        let s = &self.search;
        if s.nstop == 0 {
            return invalid("nstop must be at least 1".to_string());
        }
        if s.nbest == 0 {
            return invalid("nbest must be at least 1".to_string());
        }
        if s.max_iterations == 0 {
            return invalid("max-iterations must be at least 1".to_string());
        }
        if s.checkpoint_interval == 0 {
            return invalid("checkpoint interval must be at least 1".to_string());
        }
        if !(s.perturbation_strength > 0.0 && s.perturbation_strength <= 1.0) {
            return invalid(format!(
                "perturbation strength must be in (0, 1], got {}",
                s.perturbation_strength
            ));
        }
        if let Some(o) = &self.outgroup {
            if o.trim().is_empty() {
                return invalid("outgroup name is empty".to_string());
            }
        }
        Ok(())
    }

    /// Worker threads actually used: `num_threads` capped by `threads_max`.
    pub fn effective_threads(&self) -> usize {
        match self.threads_max {
            Some(max) => self.num_threads.min(max).max(1),
            None => self.num_threads.max(1),
        }
    }

    /// Memory ceiling in bytes, if any.
    pub fn memory_limit_bytes(&self) -> Option<u64> {
        self.mem_mb.map(|mb| mb.saturating_mul(1024 * 1024))
    }

    /// Output prefix, falling back to the alignment path.
    pub fn output_prefix(&self) -> PathBuf {
        match (&self.prefix, &self.alignment) {
            (Some(p), _) => p.clone(),
            (None, Some(aln)) => aln.clone(),
            (None, None) => PathBuf::from("phylo-search"),
        }
    }

    /// Hex SHA-256 over the raw inputs and every option that changes search results.
    ///
    /// Thread counts and the number of runs are excluded: they never change
    /// the trajectory of an individual run.
    pub fn input_hash(&self, inputs: &[(&Path, &[u8])]) -> String {
        let mut hasher = Sha256::new();
        for (path, bytes) in inputs {
            if let Some(name) = path.file_name() {
                hasher.update(name.to_string_lossy().as_bytes());
            }
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        }
        let options = format!(
            "seqtype={:?};tree={:?};outgroup={:?};seed={};safe={};fconst={:?};eps={};model={};merit={};minbl={};search={:?}",
            self.seq_type,
            self.start_tree,
            self.outgroup,
            self.seed,
            self.safe,
            self.fconst,
            self.epsilon,
            self.model,
            self.merit,
            self.min_branch_length,
            self.search,
        );
        hasher.update(options.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("uniform-random", BranchLengthMode::Uniform)]
    #[case("UNIFORM", BranchLengthMode::Uniform)]
    #[case("fixed-constant", BranchLengthMode::Fixed)]
    #[case("exponential-random", BranchLengthMode::Exponential)]
    fn test_branch_length_mode_parsing(#[case] text: &str, #[case] expected: BranchLengthMode) {
        assert_eq!(text.parse::<BranchLengthMode>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_branch_length_mode() {
        let err = "gaussian".parse::<BranchLengthMode>().unwrap_err();
        assert!(matches!(err, PhyloError::InvalidParameter(_)));
    }

    #[test]
    fn test_start_tree_parsing() {
        assert_eq!("bionj".parse::<StartTree>().unwrap(), StartTree::Bionj);
        assert_eq!("PARS".parse::<StartTree>().unwrap(), StartTree::Parsimony);
        assert_eq!(
            "start.nwk".parse::<StartTree>().unwrap(),
            StartTree::File(PathBuf::from("start.nwk"))
        );
    }

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[rstest]
    #[case(Config { runs: 0, ..Config::default() })]
    #[case(Config { epsilon: -1.0, ..Config::default() })]
    #[case(Config { epsilon: f64::NAN, ..Config::default() })]
    #[case(Config { num_threads: 0, ..Config::default() })]
    #[case(Config { mem_mb: Some(0), ..Config::default() })]
    #[case(Config { fconst: Some(vec![0.5, -0.5]), ..Config::default() })]
    #[case(Config { search: SearchParams { nstop: 0, ..SearchParams::default() }, ..Config::default() })]
    fn test_invalid_configs(#[case] config: Config) {
        assert!(matches!(config.validate(), Err(PhyloError::InvalidParameter(_))));
    }

    #[test]
    fn test_effective_threads() {
        let c = Config { num_threads: 8, threads_max: Some(3), ..Config::default() };
        assert_eq!(c.effective_threads(), 3);
        let c = Config { num_threads: 2, threads_max: None, ..Config::default() };
        assert_eq!(c.effective_threads(), 2);
    }

    #[test]
    fn test_input_hash_tracks_options_not_threads() {
        let data: &[u8] = b"2 4\nA ACGT\nB ACGA\n";
        let inputs = [(Path::new("x.phy"), data)];
        let base = Config::default();
        let threads = Config { num_threads: 4, ..Config::default() };
        let seed = Config { seed: 7, ..Config::default() };
        assert_eq!(base.input_hash(&inputs), threads.input_hash(&inputs));
        assert_ne!(base.input_hash(&inputs), seed.input_hash(&inputs));
    }

    #[test]
    fn test_parse_fconst() {
        assert_eq!(parse_fconst("0.1,0.2, 0.3 0.4").unwrap(), vec![0.1, 0.2, 0.3, 0.4]);
        assert!(parse_fconst("0.1,x").is_err());
    }
}
