//! Plain-text run log (`<prefix>.log`).
//!
//! One sink is shared by every run of an analysis. Appends are serialized by
//! a mutex and flushed immediately, so the file is readable while the search
//! is going and complete up to the last record after a crash. Records carry
//! no timestamps; two runs with the same inputs produce the same log.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::Result;
use crate::io::read_text;

/// Prefix of the line holding the best log-likelihood.
pub const BEST_SCORE_PREFIX: &str = "BEST SCORE FOUND : ";

/// Append-only log file.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl RunLog {
    /// Open `path` for appending; `truncate` starts a fresh log.
    pub fn open(path: &Path, truncate: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(!truncate)
            .truncate(truncate)
            .open(path)?;
        Ok(RunLog { path: path.to_path_buf(), file: Mutex::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush.
    pub fn append(&self, record: impl AsRef<str>) -> Result<()> {
        let mut file = self.file.lock();
        writeln!(file, "{}", record.as_ref())?;
        file.flush()?;
        Ok(())
    }

    /// Append a record tagged with its run.
    pub fn append_run(&self, run: usize, record: impl AsRef<str>) -> Result<()> {
        self.append(format!("[run {run}] {}", record.as_ref()))
    }

    /// Append the final best-score line.
    pub fn best_score(&self, log_likelihood: f64) -> Result<()> {
        self.append(format!("{BEST_SCORE_PREFIX}{log_likelihood:.6}"))
    }
}

/// Last best score recorded in the log at `path`, if any.
pub fn read_best_score(path: &Path) -> Result<Option<f64>> {
    let text = read_text(path)?;
    Ok(text
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix(BEST_SCORE_PREFIX))
        .and_then(|value| value.trim().parse().ok()))
}
