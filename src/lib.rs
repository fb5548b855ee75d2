//! Crate root: module orchestration and public re-exports.
//!
//! Modules, leaf first:
//! - `error`, `config`, `logging`, `random`: ambient plumbing.
//! - `alignment`, `partition`: sequence data, site patterns and partitions.
//! - `tree`, `io`: the unrooted tree model, moves, Newick / NEXUS tree files.
//! - `bitset`, `snapshot`, `distances`: splits and RF-style tree distances.
//! - `gamma`, `model`, `likelihood`, `model_selection`: substitution models,
//!   Felsenstein pruning and `-m TEST`.
//! - `distance_tree`, `parsimony`: BIONJ and parsimony starting trees.
//! - `checkpoint`, `run_log`, `search`: the resumable search driver.
//! - `engine`: the four commands as library functions.
//! - `api`: Python bindings via `pyo3` (gated behind "python" feature).

pub mod alignment;
pub mod bitset;
pub mod checkpoint;
pub mod config;
pub mod distance_tree;
pub mod distances;
pub mod engine;
pub mod error;
pub mod gamma;
pub mod io;
pub mod likelihood;
pub mod logging;
pub mod model;
pub mod model_selection;
pub mod parsimony;
pub mod partition;
pub mod random;
pub mod run_log;
pub mod search;
pub mod snapshot;
pub mod tree;

#[cfg(feature = "python")]
pub mod api;

// Re-export frequently used types & functions
pub use alignment::{Alignment, SeqType, load};
pub use bitset::Bitset;
pub use config::Config;
pub use distances::robinson_foulds;
pub use error::{PhyloError, Result};
pub use io::write_matrix_tsv;
pub use likelihood::evaluate;
pub use model::Model;
pub use snapshot::TreeSnapshot;
pub use tree::{Move, Tree};
