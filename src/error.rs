//! Error taxonomy shared by every stage of the engine.
//!
//! Each variant names the stage or input that failed so the command line can
//! map it to a distinct exit code without inspecting the message.

use thiserror::Error;

/// Unified error type for loading, searching and persisting.
#[derive(Debug, Error)]
pub enum PhyloError {
    /// I/O error (file not found, permission denied, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Alignment, tree or partition text that cannot be parsed.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// Partition ranges that do not cover every alignment column exactly once.
    #[error("partition mismatch: {0}")]
    PartitionMismatch(String),

    /// Out-of-range or unknown option value.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Two trees (or a tree and an alignment) disagree on their taxa.
    #[error("taxon set mismatch: {0}")]
    TaxonSetMismatch(String),

    /// Checkpoint file that cannot be decoded or belongs to other inputs.
    #[error("corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),

    /// Memory ceiling exceeded or thread pool unavailable.
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// Likelihood evaluation kept producing non-finite values.
    #[error("numerical failure: {0}")]
    NumericalFailure(String),

    /// The run was stopped by an interrupt after its checkpoint was written.
    #[error("interrupted: {0}")]
    Interrupted(String),
}

impl PhyloError {
    /// Process exit code for this error kind. Zero is reserved for success.
    pub fn exit_code(&self) -> i32 {
        match self {
            PhyloError::Io(_) => 2,
            PhyloError::MalformedInput(_) => 3,
            PhyloError::PartitionMismatch(_) => 4,
            PhyloError::InvalidParameter(_) => 5,
            PhyloError::TaxonSetMismatch(_) => 6,
            PhyloError::CorruptCheckpoint(_) => 7,
            PhyloError::ResourceExhaustion(_) => 8,
            PhyloError::NumericalFailure(_) => 9,
            PhyloError::Interrupted(_) => 130,
        }
    }
}

impl From<phylotree::tree::TreeError> for PhyloError {
    fn from(e: phylotree::tree::TreeError) -> Self {
        PhyloError::MalformedInput(format!("tree: {e}"))
    }
}

impl From<phylotree::tree::NewickParseError> for PhyloError {
    fn from(e: phylotree::tree::NewickParseError) -> Self {
        PhyloError::MalformedInput(format!("newick: {e}"))
    }
}

impl From<serde_json::Error> for PhyloError {
    fn from(e: serde_json::Error) -> Self {
        PhyloError::CorruptCheckpoint(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PhyloError>;
