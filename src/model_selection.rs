//! Model selection for `-m TEST` / `MF` / `MFP`.
//!
//! Every candidate model is fitted on a fixed starting topology (model
//! parameters and branch lengths optimized) and scored by an information
//! criterion with `k` = model parameters + `2n - 3` branch lengths:
//!
//! ```text
//! AIC  = -2 lnL + 2k
//! AICc = AIC + 2k(k+1) / (N - k - 1)
//! BIC  = -2 lnL + k ln N
//! ```
//!
//! where `N` is the number of alignment sites. The lowest score wins; ties go
//! to the earlier (simpler) candidate.

use std::sync::Arc;

use log::{debug, info};
use rayon::prelude::*;

use crate::alignment::{SeqType, SitePatterns};
use crate::config::Merit;
use crate::error::{PhyloError, Result};
use crate::likelihood::{EvalOptions, Evaluator};
use crate::model::{Model, ModelSpec};
use crate::tree::Tree;

const RATE_SUFFIXES: [&str; 4] = ["", "+I", "+G4", "+I+G4"];

/// Candidate model names for a data type, simplest first.
pub fn candidate_models(seq_type: SeqType) -> Vec<String> {
    let bases: &[&str] = match seq_type.model_alphabet() {
        SeqType::Dna => &["JC", "F81", "K80", "HKY", "TN", "SYM", "GTR"],
        SeqType::Bin => &["JC2", "GTR2"],
        SeqType::Aa | SeqType::Nt2Aa => &["Poisson", "Poisson+F", "LG", "LG+F"],
        SeqType::Morph => &["MK"],
        SeqType::Codon => return vec!["GY".to_string(), "GY+G4".to_string()],
    };
    bases
        .iter()
        .flat_map(|b| RATE_SUFFIXES.iter().map(move |r| format!("{b}{r}")))
        .collect()
}

/// Fit of one candidate.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelFit {
    pub name: String,
    pub log_likelihood: f64,
    pub num_params: usize,
    pub aic: f64,
    pub aicc: f64,
    pub bic: f64,
}

impl ModelFit {
    pub fn new(name: String, log_likelihood: f64, num_params: usize, num_sites: usize) -> Self {
        let k = num_params as f64;
        let n = num_sites as f64;
        let aic = -2.0 * log_likelihood + 2.0 * k;
        let aicc = if n - k - 1.0 > 0.0 {
            aic + 2.0 * k * (k + 1.0) / (n - k - 1.0)
        } else {
            f64::INFINITY
        };
        let bic = -2.0 * log_likelihood + k * n.ln();
        ModelFit { name, log_likelihood, num_params, aic, aicc, bic }
    }

    pub fn score(&self, merit: Merit) -> f64 {
        match merit {
            Merit::Aic => self.aic,
            Merit::Aicc => self.aicc,
            Merit::Bic => self.bic,
        }
    }
}

/// Outcome of model selection for one partition.
#[derive(Clone, Debug)]
pub struct Selection {
    pub best: Model,
    pub best_fit: ModelFit,
    pub merit: Merit,
    /// Every candidate in evaluation order.
    pub fits: Vec<ModelFit>,
}

/// Fitting settings shared by all candidates.
#[derive(Clone, Debug)]
pub struct SelectionOptions<'a> {
    pub merit: Merit,
    pub epsilon: f64,
    pub fconst: Option<&'a [f64]>,
    pub eval: EvalOptions,
}

/// Fit every candidate of `seq_type` on `tree` and return the best by `options.merit`.
///
/// # Errors
/// `NumericalFailure` if no candidate could be fitted.
pub fn select_model(
    name: &str,
    seq_type: SeqType,
    patterns: &Arc<SitePatterns>,
    taxa: &[String],
    tree: &Tree,
    options: &SelectionOptions<'_>,
) -> Result<Selection> {
    let candidates = candidate_models(seq_type);
    info!("Testing {} models for partition {name}", candidates.len());

    let fitted: Vec<Option<(Model, ModelFit)>> = candidates
        .par_iter()
        .map(|candidate| match fit_candidate(candidate, seq_type, patterns, taxa, tree, options) {
            Ok(fit) => Some(fit),
            Err(e) => {
                debug!("Model {candidate} skipped: {e}");
                None
            }
        })
        .collect();

    let mut best: Option<(Model, ModelFit)> = None;
    let mut fits = Vec::with_capacity(fitted.len());
    for (model, fit) in fitted.into_iter().flatten() {
        debug!(
            "{:<16} lnL={:.4} k={} AIC={:.4} AICc={:.4} BIC={:.4}",
            fit.name, fit.log_likelihood, fit.num_params, fit.aic, fit.aicc, fit.bic
        );
        let better = best
            .as_ref()
            .is_none_or(|(_, b)| fit.score(options.merit) < b.score(options.merit));
        fits.push(fit.clone());
        if better {
            best = Some((model, fit));
        }
    }

    let (best, best_fit) = best.ok_or_else(|| {
        PhyloError::NumericalFailure(format!("no candidate model could be fitted for partition {name}"))
    })?;
    info!(
        "Best-fit model for {name} according to {}: {} ({:.4})",
        options.merit,
        best_fit.name,
        best_fit.score(options.merit)
    );
    Ok(Selection { best, best_fit, merit: options.merit, fits })
}

fn fit_candidate(
    candidate: &str,
    seq_type: SeqType,
    patterns: &Arc<SitePatterns>,
    taxa: &[String],
    tree: &Tree,
    options: &SelectionOptions<'_>,
) -> Result<(Model, ModelFit)> {
    let spec: ModelSpec = candidate.parse()?;
    let model = Model::new(&spec, seq_type, patterns, options.fconst)?;
    let mut evaluator = Evaluator::new(
        vec![(candidate.to_string(), Arc::clone(patterns), model)],
        taxa.to_vec(),
        options.eval,
    );
    let mut tree = tree.clone();
    evaluator.bind(&tree)?;
    let ll = evaluator.optimize_all(&mut tree, options.epsilon)?;
    let fitted = evaluator.models()[0].clone();
    let fit = ModelFit::new(fitted.name(), ll, evaluator.num_free_params(), patterns.num_sites);
    Ok((fitted, fit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::parse_alignment;
    use approx::assert_abs_diff_eq;

    #[test]
    fn dna_candidates() {
        let c = candidate_models(SeqType::Dna);
        assert_eq!(c.len(), 28);
        assert_eq!(c[0], "JC");
        assert_eq!(c[27], "GTR+I+G4");
        assert!(c.iter().all(|name| name.parse::<ModelSpec>().is_ok()));
        assert!(candidate_models(SeqType::Nt2Aa).contains(&"LG+F+G4".to_string()));
    }

    #[test]
    fn criteria() {
        let fit = ModelFit::new("JC".to_string(), -100.0, 7, 50);
        assert_abs_diff_eq!(fit.aic, 214.0);
        assert_abs_diff_eq!(fit.aicc, 214.0 + 2.0 * 7.0 * 8.0 / 42.0);
        assert_abs_diff_eq!(fit.bic, 200.0 + 7.0 * 50f64.ln());
        let tiny = ModelFit::new("GTR".to_string(), -10.0, 20, 10);
        assert!(tiny.aicc.is_infinite());
    }

    #[test]
    fn selects_a_candidate_on_small_alignment() {
        let aln = parse_alignment(
            "4 16\nA ACGTACGTACGTAAAA\nB ACGTACGTACGAAAAA\nC ACGAACTTACGTTAAA\nD ACCTACTTACGTTAAC\n",
            "t",
            None,
        )
        .unwrap();
        let sites: Vec<usize> = (0..aln.num_sites()).collect();
        let patterns = Arc::new(aln.patterns(&sites));
        let tree = Tree::from_newick("((A:0.1,B:0.1):0.1,C:0.1,D:0.1);").unwrap();
        let options = SelectionOptions {
            merit: Merit::Bic,
            epsilon: 0.1,
            fconst: None,
            eval: EvalOptions { min_branch_length: 1e-6, safe: false },
        };
        let sel = select_model("all", SeqType::Dna, &patterns, aln.names(), &tree, &options).unwrap();
        assert_eq!(sel.fits.len(), 28);
        let best_score = sel.best_fit.bic;
        assert!(sel.fits.iter().all(|f| f.bic >= best_score));
        assert_eq!(sel.best.name(), sel.best_fit.name);
    }
}
