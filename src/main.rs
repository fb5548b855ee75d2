use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use phylo_search::alignment::SeqType;
use phylo_search::config::{
    BranchLengthMode, Config, DEFAULT_MIN_BRANCH_LENGTH, Merit, SearchParams, StartTree, Verbosity, parse_fconst,
};
use phylo_search::engine::{parsimony_multistate, phylogenetic_analysis, random_tree, rf_distance};
use phylo_search::logging::setup_logger;
use phylo_search::Result;

/// Maximum-likelihood tree search with checkpointing, plus tree utilities.
#[derive(Parser, Debug)]
#[command(name = "phylo-search", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a random tree over taxa T1..Tn
    RandomTree {
        #[arg(long = "num-taxa")]
        num_taxa: usize,

        /// uniform-random | fixed-constant | exponential-random
        #[arg(long = "branch-length-mode", default_value = "uniform-random")]
        branch_length_mode: BranchLengthMode,

        #[command(flatten)]
        general: GeneralArgs,
    },

    /// Model selection and tree search on an alignment
    PhylogeneticAnalysis {
        #[command(flatten)]
        general: GeneralArgs,
    },

    /// Multistate parsimony score and tree
    ParsimonyMultistate {
        /// Alignment with multistate characters
        #[arg(long = "input-file")]
        input_file: PathBuf,

        #[command(flatten)]
        general: GeneralArgs,
    },

    /// Robinson-Foulds distances between two tree files
    RfDistance {
        #[arg(long = "tree1-file")]
        tree1_file: PathBuf,

        /// Compare the first file with itself when omitted
        #[arg(long = "tree2-file")]
        tree2_file: Option<PathBuf>,

        #[command(flatten)]
        general: GeneralArgs,
    },
}

/// Options shared by every command.
#[derive(Args, Debug)]
struct GeneralArgs {
    /// Alignment file or directory of alignment files
    #[arg(short = 's', long = "aln", visible_alias = "aln-file")]
    alignment: Option<PathBuf>,

    /// RAxML or NEXUS partition file
    #[arg(short = 'p', long = "partition-file")]
    partition_file: Option<PathBuf>,

    /// BIN, DNA, AA, NT2AA, CODON or MORPH (detected when omitted)
    #[arg(long = "seqtype")]
    seq_type: Option<SeqType>,

    /// Starting tree: BIONJ, PARS, RANDOM or a tree file
    #[arg(short = 't', long = "tree", visible_alias = "tree-file", default_value = "BIONJ")]
    start_tree: StartTree,

    /// Outgroup taxon for writing rooted trees
    #[arg(short = 'o', long = "outgroup")]
    outgroup: Option<String>,

    /// Prefix for output files
    #[arg(long = "prefix", visible_alias = "out-prefix")]
    prefix: Option<PathBuf>,

    #[arg(long = "seed", default_value_t = 0)]
    seed: u64,

    /// Rescale partial likelihoods at every node
    #[arg(long = "safe", default_value_t = false)]
    safe: bool,

    /// Memory ceiling in MB
    #[arg(long = "mem")]
    mem_mb: Option<u64>,

    /// Number of independent search runs
    #[arg(long = "runs", default_value_t = 1)]
    runs: usize,

    #[arg(short = 'v', long = "verbose", default_value_t = false)]
    verbose: bool,

    #[arg(short = 'q', long = "quiet", default_value_t = false, conflicts_with = "verbose")]
    quiet: bool,

    /// Fixed state frequencies, comma separated
    #[arg(long = "fconst")]
    fconst: Option<String>,

    /// Log-likelihood epsilon for optimization and improvement tests
    #[arg(long = "epsilon", default_value_t = 0.01)]
    epsilon: f64,

    /// Number of threads
    #[arg(short = 'T', long = "threads", visible_alias = "num-threads", default_value_t = 1)]
    threads: usize,

    #[arg(long = "threads-max")]
    threads_max: Option<usize>,

    /// Model name, or TEST / MF / MFP for model selection
    #[arg(short = 'm', long = "model", default_value = "TEST")]
    model: String,

    /// Model selection criterion: AIC, AICc or BIC
    #[arg(long = "merit", default_value = "BIC")]
    merit: Merit,

    #[arg(long = "min-branch-length", default_value_t = DEFAULT_MIN_BRANCH_LENGTH)]
    min_branch_length: f64,

    /// Ignore and overwrite existing checkpoints
    #[arg(long = "redo", default_value_t = false)]
    redo: bool,

    /// Unsuccessful iterations before stopping
    #[arg(long = "nstop", default_value_t = SearchParams::default().nstop)]
    nstop: usize,

    /// Size of the candidate tree pool
    #[arg(long = "nbest", default_value_t = SearchParams::default().nbest)]
    nbest: usize,

    /// Iterations with an unchanged candidate pool before stopping (0 disables)
    #[arg(long = "cmin", default_value_t = SearchParams::default().cmin)]
    cmin: usize,

    #[arg(long = "max-iterations", default_value_t = SearchParams::default().max_iterations)]
    max_iterations: usize,

    /// Fraction of internal branches changed per perturbation
    #[arg(long = "perturbation", default_value_t = SearchParams::default().perturbation_strength)]
    perturbation: f64,

    /// Iterations between periodic checkpoints
    #[arg(long = "checkpoint-interval", default_value_t = SearchParams::default().checkpoint_interval)]
    checkpoint_interval: usize,
}

impl GeneralArgs {
    fn into_config(self) -> Result<Config> {
        let fconst = self.fconst.as_deref().map(parse_fconst).transpose()?;
        Ok(Config {
            alignment: self.alignment,
            partition_file: self.partition_file,
            seq_type: self.seq_type,
            start_tree: self.start_tree,
            outgroup: self.outgroup,
            prefix: self.prefix,
            seed: self.seed,
            safe: self.safe,
            mem_mb: self.mem_mb,
            runs: self.runs,
            verbosity: Verbosity::from_flags(self.verbose, self.quiet),
            fconst,
            epsilon: self.epsilon,
            num_threads: self.threads,
            threads_max: self.threads_max,
            model: self.model,
            merit: self.merit,
            min_branch_length: self.min_branch_length,
            redo: self.redo,
            search: SearchParams {
                nstop: self.nstop,
                nbest: self.nbest,
                cmin: self.cmin,
                max_iterations: self.max_iterations,
                perturbation_strength: self.perturbation,
                checkpoint_interval: self.checkpoint_interval,
            },
        })
    }
}

fn general_of(command: &Command) -> &GeneralArgs {
    match command {
        Command::RandomTree { general, .. }
        | Command::PhylogeneticAnalysis { general }
        | Command::ParsimonyMultistate { general, .. }
        | Command::RfDistance { general, .. } => general,
    }
}

fn run(cli: Cli, stop: Arc<AtomicBool>) -> Result<()> {
    let t0 = Instant::now();
    match cli.command {
        Command::RandomTree { num_taxa, branch_length_mode, general } => {
            let config = general.into_config()?;
            let newick = random_tree(&config, num_taxa, branch_length_mode)?;
            println!("{newick}");
        }
        Command::PhylogeneticAnalysis { general } => {
            let config = general.into_config()?;
            let result = phylogenetic_analysis(&config, &stop)?;
            if result.from_checkpoint {
                info!("Analysis was already finished, result read from {}", result.checkpoint_file.display());
            }
            info!("Best model: {}", result.models.join(", "));
            info!("Tree written to {}", result.tree_file.display());
            info!("Log written to {}", result.log_file.display());
            println!("BEST SCORE FOUND : {:.6}", result.log_likelihood);
        }
        Command::ParsimonyMultistate { input_file, general } => {
            let config = general.into_config()?;
            let result = parsimony_multistate(&config, &input_file)?;
            println!("Parsimony score: {}", result.score);
            info!("Tree written to {}", result.tree_file.display());
        }
        Command::RfDistance { tree1_file, tree2_file, general } => {
            let config = general.into_config()?;
            let result = rf_distance(&config, &tree1_file, tree2_file.as_deref())?;
            if result.rf.len() == 1 && result.rf[0].len() == 1 {
                println!("RF distance: {}", result.rf[0][0]);
            }
            info!("Distances written to {}", result.rf_file.display());
        }
    }
    info!("Finished in {:.3}s", t0.elapsed().as_secs_f64());
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let general = general_of(&cli.command);
    setup_logger(Verbosity::from_flags(general.verbose, general.quiet).level_filter());

    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    if let Err(e) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!("Cannot install the interrupt handler: {e}");
    }

    match run(cli, stop) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}
