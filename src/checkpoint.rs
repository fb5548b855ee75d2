//! Durable search state.
//!
//! A checkpoint is gzip-compressed JSON. Floats are written with exact
//! round-trip precision and the random generator state is stored in full, so
//! a resumed run continues the same random stream and reaches the same best
//! score as an uninterrupted one.
//!
//! Writes go to a temporary file in the target directory which then replaces
//! the old checkpoint in one rename; a reader never sees a half-written file.
//!
//! ```text
//! <prefix>.run<k>.ckp.gz   RunCheckpoint of run k (when runs > 1)
//! <prefix>.ckp.gz          SummaryCheckpoint (runs > 1) or the single RunCheckpoint
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{PhyloError, Result};
use crate::io::read_text;
use crate::model::Model;
use crate::random::SearchRng;
use crate::tree::Tree;

/// Format version written into every checkpoint.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Search driver states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchStatus {
    Init,
    Searching,
    Converged,
    Stopped,
}

impl SearchStatus {
    pub fn is_finished(self) -> bool {
        self == SearchStatus::Converged
    }
}

/// One tree of the candidate pool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub log_likelihood: f64,
    pub tree: Tree,
}

/// Everything needed to continue one run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunCheckpoint {
    pub version: u32,
    pub input_hash: String,
    pub run: usize,
    pub status: SearchStatus,
    /// Best log-likelihood of the run so far.
    pub log_likelihood: f64,
    pub best_tree: Tree,
    pub models: Vec<Model>,
    /// Candidate pool, best first.
    pub pool: Vec<PoolEntry>,
    pub iteration: usize,
    /// Consecutive iterations without improvement.
    pub unsuccessful: usize,
    /// Consecutive iterations with an unchanged pool.
    pub stable_rounds: usize,
    pub evaluations: u64,
    pub rng: SearchRng,
    /// Why the run stopped, if it did.
    pub stop_reason: Option<String>,
}

/// Short record of one run inside the summary checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run: usize,
    pub status: SearchStatus,
    pub log_likelihood: f64,
    pub iterations: usize,
}

/// Outcome of a whole analysis across its runs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SummaryCheckpoint {
    pub version: u32,
    pub input_hash: String,
    pub status: SearchStatus,
    /// Best log-likelihood over all runs.
    pub log_likelihood: f64,
    pub best_run: usize,
    /// Best tree in Newick form, as written to the tree file.
    pub tree: String,
    /// Final model name of each partition.
    pub models: Vec<String>,
    pub runs: Vec<RunSummary>,
}

/// Checkpoint kinds that can be validated against the current inputs.
pub trait Checkpoint: Serialize + DeserializeOwned {
    fn version(&self) -> u32;
    fn input_hash(&self) -> &str;
}

impl Checkpoint for RunCheckpoint {
    fn version(&self) -> u32 {
        self.version
    }

    fn input_hash(&self) -> &str {
        &self.input_hash
    }
}

impl Checkpoint for SummaryCheckpoint {
    fn version(&self) -> u32 {
        self.version
    }

    fn input_hash(&self) -> &str {
        &self.input_hash
    }
}

/// `<prefix>.ckp.gz`
pub fn summary_path(prefix: &Path) -> PathBuf {
    suffixed(prefix, ".ckp.gz")
}

/// `<prefix>.run<k>.ckp.gz`
pub fn run_path(prefix: &Path, run: usize) -> PathBuf {
    suffixed(prefix, &format!(".run{run}.ckp.gz"))
}

/// Where run `run` of `runs` keeps its checkpoint.
pub fn run_checkpoint_path(prefix: &Path, run: usize, runs: usize) -> PathBuf {
    if runs == 1 { summary_path(prefix) } else { run_path(prefix, run) }
}

/// Append `suffix` to the full file name of `prefix`.
pub fn suffixed(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Replace the checkpoint at `path` with `state`.
pub fn write_checkpoint<T: Serialize>(path: &Path, state: &T) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let tmp = NamedTempFile::new_in(dir)?;
    {
        let mut encoder = GzEncoder::new(tmp.as_file(), Compression::default());
        serde_json::to_writer(&mut encoder, state)
            .map_err(|e| PhyloError::Io(std::io::Error::other(e)))?;
        encoder.finish()?.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| PhyloError::Io(e.error))?;
    debug!("Checkpoint written to {}", path.display());
    Ok(())
}

/// Read a checkpoint of any kind.
///
/// # Errors
/// `Io` if the file cannot be opened, `CorruptCheckpoint` if it does not
/// decode or has an unknown version.
pub fn read_checkpoint<T: Checkpoint>(path: &Path) -> Result<T> {
    let corrupt = |what: String| PhyloError::CorruptCheckpoint(format!("{}: {what}", path.display()));
    let text = match read_text(path) {
        Ok(text) => text,
        Err(PhyloError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => return Err(PhyloError::Io(e)),
        Err(e) => return Err(corrupt(e.to_string())),
    };
    let state: T = serde_json::from_str(&text).map_err(|e| corrupt(e.to_string()))?;
    if state.version() != CHECKPOINT_VERSION {
        return Err(corrupt(format!("unsupported version {}", state.version())));
    }
    Ok(state)
}

/// Read the checkpoint at `path` if there is one, checking it belongs to the
/// inputs hashed as `input_hash`.
///
/// # Errors
/// `CorruptCheckpoint` for undecodable files or a different input hash.
pub fn load_compatible<T: Checkpoint>(path: &Path, input_hash: &str) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let state: T = read_checkpoint(path)?;
    if state.input_hash() != input_hash {
        return Err(PhyloError::CorruptCheckpoint(format!(
            "{} was written for different inputs or options; use --redo to overwrite it",
            path.display()
        )));
    }
    Ok(Some(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::{SeqType, parse_alignment};
    use crate::random::get_random_number_generator;
    use rand::Rng;

    fn sample() -> RunCheckpoint {
        let aln = parse_alignment("3 4\nA ACGT\nB ACGA\nC ACGT\n", "t", None).unwrap();
        let patterns = aln.patterns(&[0, 1, 2, 3]);
        let model = Model::new(&"HKY+G4".parse().unwrap(), SeqType::Dna, &patterns, None).unwrap();
        let tree = Tree::from_newick("(A:0.1234567890123,B:0.2,C:0.3);").unwrap();
        let mut rng = get_random_number_generator(3);
        let _ = rng.gen_range(0..100);
        RunCheckpoint {
            version: CHECKPOINT_VERSION,
            input_hash: "abc".to_string(),
            run: 0,
            status: SearchStatus::Searching,
            log_likelihood: -123.456789012345,
            best_tree: tree.clone(),
            models: vec![model],
            pool: vec![PoolEntry { log_likelihood: -123.456789012345, tree }],
            iteration: 7,
            unsuccessful: 2,
            stable_rounds: 1,
            evaluations: 99,
            rng,
            stop_reason: None,
        }
    }

    #[test]
    fn write_then_read_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.ckp.gz");
        let state = sample();
        write_checkpoint(&path, &state).unwrap();
        let mut back: RunCheckpoint = read_checkpoint(&path).unwrap();
        assert_eq!(back.log_likelihood, state.log_likelihood);
        assert_eq!(back.best_tree, state.best_tree);
        assert_eq!(back.iteration, 7);
        assert_eq!(back.models[0].name(), state.models[0].name());
        let mut rng = state.rng.clone();
        assert_eq!(back.rng.gen_range(0..u64::MAX), rng.gen_range(0..u64::MAX));
    }

    #[test]
    fn exposes_log_likelihood_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.ckp.gz");
        write_checkpoint(&path, &sample()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&read_text(&path).unwrap()).unwrap();
        assert_eq!(value["log_likelihood"].as_f64(), Some(-123.456789012345));
        assert_eq!(value["status"], "searching");
    }

    #[test]
    fn garbage_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.ckp.gz");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(read_checkpoint::<RunCheckpoint>(&path), Err(PhyloError::CorruptCheckpoint(_))));
        std::fs::write(&path, [0x1f, 0x8b, 0x00, 0x01]).unwrap();
        assert!(matches!(read_checkpoint::<RunCheckpoint>(&path), Err(PhyloError::CorruptCheckpoint(_))));
    }

    #[test]
    fn hash_guard() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.ckp.gz");
        assert!(load_compatible::<RunCheckpoint>(&path, "abc").unwrap().is_none());
        write_checkpoint(&path, &sample()).unwrap();
        assert!(load_compatible::<RunCheckpoint>(&path, "abc").unwrap().is_some());
        assert!(matches!(
            load_compatible::<RunCheckpoint>(&path, "other"),
            Err(PhyloError::CorruptCheckpoint(_))
        ));
    }

    #[test]
    fn paths() {
        let prefix = Path::new("out/example.phy");
        assert_eq!(summary_path(prefix), PathBuf::from("out/example.phy.ckp.gz"));
        assert_eq!(run_path(prefix, 2), PathBuf::from("out/example.phy.run2.ckp.gz"));
        assert_eq!(run_checkpoint_path(prefix, 0, 1), summary_path(prefix));
        assert_eq!(run_checkpoint_path(prefix, 0, 3), run_path(prefix, 0));
    }
}
