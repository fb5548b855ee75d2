//! Substitution models.
//!
//! # Overview
//! A model is a reversible rate matrix `Q = S·diag(π)` built from a symmetric
//! exchangeability matrix `S` and equilibrium frequencies `π`, normalized to
//! one expected substitution per unit branch length, plus optional rate
//! heterogeneity (`+G` discrete gamma, `+I` invariant sites).
//!
//! # Names
//! Models are named as `BASE[+F|+FQ|+FC|+FU|+FO][+I[{p}]][+G[n][{alpha}]]`,
//! e.g. `GTR+F+I+G4`, `HKY+G{0.5}`, `LG+F`. Values in braces are fixed and
//! not optimized.
//!
//! # Transition probabilities
//! `B = D^½ Q D^-½` is symmetric, so it is diagonalized by Jacobi rotations
//! `B = U Λ Uᵀ` and
//!
//! ```text
//! P(t) = D^-½ U e^{Λt} Uᵀ D^½
//! ```
//!
//! with tiny negative round-off entries clamped to 0.

use std::fmt;
use std::str::FromStr;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::alignment::{GENETIC_CODE, NUM_SENSE_CODONS, SeqType, SitePatterns, sense_codon_table};
use crate::error::{PhyloError, Result};
use crate::gamma::{DEFAULT_ALPHA, MAX_ALPHA, MIN_ALPHA, discrete_gamma_rates};

/// Floor applied to every equilibrium frequency.
pub const MIN_FREQUENCY: f64 = 1e-4;
pub const MIN_RATE: f64 = 0.01;
pub const MAX_RATE: f64 = 100.0;
const MIN_OMEGA: f64 = 0.001;
const MAX_OMEGA: f64 = 20.0;
const MAX_PINV: f64 = 0.99;
const MAX_LOG_FREQ_RATIO: f64 = 9.0;

const JACOBI_MAX_SWEEPS: usize = 100;

// LG exchangeabilities (Le & Gascuel 2008), lower triangle row by row:
// R-A, N-A, N-R, D-A, D-R, D-N, ... in ARNDCQEGHILKMFPSTWYV order.
const LG_RATES: [f64; 190] = [
    0.425093, 0.276818, 0.751878, 0.395144, 0.123954, 5.076149,
    2.489084, 0.534551, 0.528768, 0.062556, 0.969894, 0.640346,
    0.221500, 5.243870, 0.080556, 1.038545, 0.363970, 0.228075,
    0.611973, 0.210494, 5.221070, 2.317100, 0.361903, 0.227710,
    0.012693, 0.270720, 1.773733, 0.590559, 0.340530, 0.137505,
    0.013266, 0.234489, 0.360032, 0.068448, 0.243972, 0.653040,
    0.024289, 0.104111, 0.047954, 0.419409, 1.211550, 0.710170,
    0.169264, 0.010040, 0.080045, 0.117910, 0.125383, 0.325711,
    0.471791, 0.062596, 0.235601, 0.013490, 0.326622, 0.015076,
    0.054821, 0.061830, 0.532476, 0.234850, 0.070570, 0.052886,
    0.015750, 0.030174, 0.065441, 0.029890, 0.225833, 0.190001,
    0.131528, 0.012371, 1.331289, 0.348956, 0.019984, 0.296636,
    0.044261, 0.026612, 0.008607, 0.279425, 0.142088, 0.069683,
    0.078862, 0.084808, 0.252214, 0.044550, 0.115639, 1.190200,
    4.863674, 0.547054, 0.442472, 0.782857, 0.504551, 0.327059,
    0.141552, 0.610460, 0.199099, 0.025346, 0.592036, 0.017614,
    0.155337, 0.092258, 0.115951, 0.310300, 0.049009, 0.208449,
    0.055834, 0.044603, 0.036397, 0.013012, 0.233413, 0.115866,
    0.025625, 0.035855, 0.021282, 0.030880, 0.012689, 1.473510,
    0.152430, 0.051316, 0.076868, 0.195510, 0.031543, 0.249313,
    0.037897, 0.179240, 0.210332, 0.124665, 0.078698, 0.023918,
    0.651028, 0.547105, 0.024760, 0.075860, 0.021017, 0.064105,
    0.248862, 0.082368, 0.306674, 0.024521, 0.023196, 0.015152,
    0.086619, 0.011982, 0.012538, 0.067393, 0.320627, 0.052790,
    0.180717, 0.069104, 0.032371, 0.018811, 0.017070, 0.040203,
    0.145558, 0.032157, 0.129315, 0.024469, 0.037159, 0.058082,
    0.006712, 0.025548, 0.282959, 0.065389, 0.081134, 0.025952,
    0.014126, 0.013539, 0.034131, 0.020229, 0.017098, 0.073236,
    0.040653, 0.118938, 0.080488, 0.399748, 0.025060, 0.075004,
    0.013927, 0.023920, 0.015699, 0.035562, 0.116392, 0.039205,
    0.200534, 0.145816, 0.273615, 0.139634, 0.142754, 0.100111,
    0.021362, 0.125872, 1.608126, 0.495130,
];

const LG_FREQS: [f64; 20] = [
    0.079066, 0.055941, 0.041977, 0.053052, 0.012937, 0.040767,
    0.071586, 0.057337, 0.022355, 0.062157, 0.099081, 0.064600,
    0.022951, 0.042302, 0.044040, 0.061197, 0.053287, 0.012066,
    0.034155, 0.069147,
];

/// Base substitution model, before frequency and rate-heterogeneity options.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BaseModel {
    Jc,
    F81,
    K80,
    Hky,
    Tn,
    Sym,
    Gtr,
    Jc2,
    Gtr2,
    Poisson,
    Lg,
    Mk,
    Gy,
}

const BASE_NAMES: [(&str, BaseModel); 21] = [
    ("JC", BaseModel::Jc),
    ("JC69", BaseModel::Jc),
    ("F81", BaseModel::F81),
    ("K80", BaseModel::K80),
    ("K2P", BaseModel::K80),
    ("HKY", BaseModel::Hky),
    ("HKY85", BaseModel::Hky),
    ("TN", BaseModel::Tn),
    ("TN93", BaseModel::Tn),
    ("TRN", BaseModel::Tn),
    ("SYM", BaseModel::Sym),
    ("GTR", BaseModel::Gtr),
    ("JC2", BaseModel::Jc2),
    ("GTR2", BaseModel::Gtr2),
    ("POISSON", BaseModel::Poisson),
    ("LG", BaseModel::Lg),
    ("MK", BaseModel::Mk),
    ("GY", BaseModel::Gy),
    ("GY94", BaseModel::Gy),
    ("JCMK", BaseModel::Mk),
    ("GTRMK", BaseModel::Mk),
];

impl BaseModel {
    pub fn name(self) -> &'static str {
        match self {
            BaseModel::Jc => "JC",
            BaseModel::F81 => "F81",
            BaseModel::K80 => "K80",
            BaseModel::Hky => "HKY",
            BaseModel::Tn => "TN",
            BaseModel::Sym => "SYM",
            BaseModel::Gtr => "GTR",
            BaseModel::Jc2 => "JC2",
            BaseModel::Gtr2 => "GTR2",
            BaseModel::Poisson => "Poisson",
            BaseModel::Lg => "LG",
            BaseModel::Mk => "MK",
            BaseModel::Gy => "GY",
        }
    }

    /// Data type the model is defined on.
    pub fn alphabet(self) -> SeqType {
        match self {
            BaseModel::Jc
            | BaseModel::F81
            | BaseModel::K80
            | BaseModel::Hky
            | BaseModel::Tn
            | BaseModel::Sym
            | BaseModel::Gtr => SeqType::Dna,
            BaseModel::Jc2 | BaseModel::Gtr2 => SeqType::Bin,
            BaseModel::Poisson | BaseModel::Lg => SeqType::Aa,
            BaseModel::Mk => SeqType::Morph,
            BaseModel::Gy => SeqType::Codon,
        }
    }

    pub fn default_freq(self) -> FreqType {
        match self {
            BaseModel::Jc
            | BaseModel::K80
            | BaseModel::Sym
            | BaseModel::Jc2
            | BaseModel::Poisson
            | BaseModel::Mk => FreqType::Equal,
            BaseModel::F81 | BaseModel::Hky | BaseModel::Tn | BaseModel::Gtr | BaseModel::Gtr2 | BaseModel::Gy => {
                FreqType::Empirical
            }
            BaseModel::Lg => FreqType::Model,
        }
    }

    /// Starting values of the free exchangeability parameters.
    fn initial_rates(self) -> Vec<f64> {
        match self {
            BaseModel::K80 | BaseModel::Hky => vec![2.0],
            BaseModel::Tn => vec![2.0, 2.0],
            BaseModel::Sym | BaseModel::Gtr => vec![1.0; 5],
            BaseModel::Gy => vec![2.0, 0.5],
            _ => Vec::new(),
        }
    }

    fn rate_bounds(self, index: usize) -> (f64, f64) {
        match (self, index) {
            (BaseModel::Gy, 1) => (MIN_OMEGA, MAX_OMEGA),
            _ => (MIN_RATE, MAX_RATE),
        }
    }
}

/// Where equilibrium frequencies come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FreqType {
    /// `+FQ`: all states equally frequent.
    Equal,
    /// `+F` / `+FC`: counted from the data.
    Empirical,
    /// `+FO`: optimized by maximum likelihood.
    Optimized,
    /// `+FU`: supplied by the user (`--fconst`).
    User,
    /// Built into an empirical matrix (LG).
    Model,
}

/// A parsed model name.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelSpec {
    pub base: BaseModel,
    pub freq: FreqType,
    pub gamma_categories: Option<usize>,
    pub fixed_alpha: Option<f64>,
    pub invariant: bool,
    pub fixed_pinv: Option<f64>,
}

/// Names that request model selection instead of a fixed model.
pub fn is_model_selection(name: &str) -> bool {
    matches!(name.trim().to_ascii_uppercase().as_str(), "TEST" | "MF" | "MFP" | "TESTONLY" | "TESTNEW")
}

fn parse_braced(token: &str, what: &str) -> Result<Option<f64>> {
    let Some(open) = token.find('{') else {
        return Ok(None);
    };
    let inner = token[open + 1..]
        .strip_suffix('}')
        .ok_or_else(|| PhyloError::InvalidParameter(format!("unclosed '{{' in {what} option '+{token}'")))?;
    inner
        .trim()
        .parse::<f64>()
        .map(Some)
        .map_err(|_| PhyloError::InvalidParameter(format!("bad {what} value '{inner}'")))
}

impl FromStr for ModelSpec {
    type Err = PhyloError;

    fn from_str(s: &str) -> Result<Self> {
        let mut tokens = s.trim().split('+');
        let base_name = tokens.next().unwrap_or("").trim().to_ascii_uppercase();
        let base = BASE_NAMES
            .iter()
            .find(|(name, _)| *name == base_name)
            .map(|&(_, b)| b)
            .ok_or_else(|| PhyloError::InvalidParameter(format!("unknown model '{s}'")))?;

        let mut spec = ModelSpec {
            base,
            freq: base.default_freq(),
            gamma_categories: None,
            fixed_alpha: None,
            invariant: false,
            fixed_pinv: None,
        };
        let mut freq_seen = false;
        for token in tokens {
            let token = token.trim();
            let upper = token.to_ascii_uppercase();
            let duplicate = || PhyloError::InvalidParameter(format!("option '+{token}' given twice in '{s}'"));
            match upper.as_str() {
                "F" | "FC" | "FQ" | "FO" | "FU" => {
                    if freq_seen {
                        return Err(duplicate());
                    }
                    freq_seen = true;
                    spec.freq = match upper.as_str() {
                        "FQ" => FreqType::Equal,
                        "FO" => FreqType::Optimized,
                        "FU" => FreqType::User,
                        _ => FreqType::Empirical,
                    };
                }
                u if u.starts_with('G') => {
                    if spec.gamma_categories.is_some() {
                        return Err(duplicate());
                    }
                    let digits: String = u[1..].chars().take_while(|c| c.is_ascii_digit()).collect();
                    let rest = &token[1 + digits.len()..];
                    if !rest.is_empty() && !rest.starts_with('{') {
                        return Err(PhyloError::InvalidParameter(format!("unknown model option '+{token}'")));
                    }
                    let k = if digits.is_empty() {
                        crate::gamma::DEFAULT_CATEGORIES
                    } else {
                        digits
                            .parse::<usize>()
                            .map_err(|_| PhyloError::InvalidParameter(format!("bad category count in '+{token}'")))?
                    };
                    if k == 0 {
                        return Err(PhyloError::InvalidParameter("+G needs at least one category".to_string()));
                    }
                    spec.gamma_categories = Some(k);
                    spec.fixed_alpha = parse_braced(rest, "gamma shape")?;
                    if let Some(a) = spec.fixed_alpha {
                        if !(MIN_ALPHA..=MAX_ALPHA).contains(&a) {
                            return Err(PhyloError::InvalidParameter(format!(
                                "gamma shape {a} outside [{MIN_ALPHA}, {MAX_ALPHA}]"
                            )));
                        }
                    }
                }
                u if u.starts_with('I') => {
                    if spec.invariant {
                        return Err(duplicate());
                    }
                    let rest = &token[1..];
                    if !rest.is_empty() && !rest.starts_with('{') {
                        return Err(PhyloError::InvalidParameter(format!("unknown model option '+{token}'")));
                    }
                    spec.invariant = true;
                    spec.fixed_pinv = parse_braced(rest, "invariant proportion")?;
                    if let Some(p) = spec.fixed_pinv {
                        if !(0.0..1.0).contains(&p) {
                            return Err(PhyloError::InvalidParameter(format!(
                                "invariant proportion {p} outside [0, 1)"
                            )));
                        }
                    }
                }
                _ => return Err(PhyloError::InvalidParameter(format!("unknown model option '+{token}' in '{s}'"))),
            }
        }
        Ok(spec)
    }
}

impl fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.base.name())?;
        match self.freq {
            FreqType::Empirical => f.write_str("+F")?,
            FreqType::Optimized => f.write_str("+FO")?,
            FreqType::User => f.write_str("+FU")?,
            FreqType::Equal if self.base.default_freq() != FreqType::Equal => f.write_str("+FQ")?,
            FreqType::Equal | FreqType::Model => {}
        }
        if self.invariant {
            f.write_str("+I")?;
            if let Some(p) = self.fixed_pinv {
                write!(f, "{{{p}}}")?;
            }
        }
        if let Some(k) = self.gamma_categories {
            write!(f, "+G{k}")?;
            if let Some(a) = self.fixed_alpha {
                write!(f, "{{{a}}}")?;
            }
        }
        Ok(())
    }
}

/// A free numeric parameter of a model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Param {
    Rate(usize),
    Alpha,
    Pinv,
    /// `ln(π_i / π_last)` of an optimized frequency vector.
    FreqRatio(usize),
}

/// Eigen-system of the symmetrized rate matrix, stored as the two factors
/// of `P(t) = L · diag(e^{λt}) · R`.
#[derive(Clone, Debug)]
struct Eigen {
    values: Array1<f64>,
    left: Array2<f64>,
    right: Array2<f64>,
}

/// Cyclic Jacobi diagonalization of a symmetric matrix. Returns eigenvalues
/// and eigenvectors as columns.
fn jacobi_eigen(mut a: Array2<f64>) -> Result<(Array1<f64>, Array2<f64>)> {
    let n = a.nrows();
    let mut v = Array2::<f64>::eye(n);
    let scale: f64 = a.iter().map(|x| x * x).sum::<f64>().max(1e-300);

    for _ in 0..JACOBI_MAX_SWEEPS {
        let mut off = 0.0;
        for p in 0..n {
            for q in p + 1..n {
                off += a[[p, q]] * a[[p, q]];
            }
        }
        if off <= 1e-30 * scale {
            return Ok((a.diag().to_owned(), v));
        }
        for p in 0..n {
            for q in p + 1..n {
                let apq = a[[p, q]];
                if apq.abs() < 1e-300 {
                    continue;
                }
                let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;
                for k in 0..n {
                    let (akp, akq) = (a[[k, p]], a[[k, q]]);
                    a[[k, p]] = c * akp - s * akq;
                    a[[k, q]] = s * akp + c * akq;
                }
                for k in 0..n {
                    let (apk, aqk) = (a[[p, k]], a[[q, k]]);
                    a[[p, k]] = c * apk - s * aqk;
                    a[[q, k]] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let (vkp, vkq) = (v[[k, p]], v[[k, q]]);
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }
    Err(PhyloError::NumericalFailure("rate matrix eigen-decomposition did not converge".to_string()))
}

/// Empirical state frequencies of weighted patterns; ambiguous cells count
/// fractionally, fully unknown cells are skipped.
pub fn empirical_frequencies(patterns: &SitePatterns) -> Vec<f64> {
    let n = patterns.num_states;
    let unknown = crate::alignment::full_mask(n);
    let mut counts = vec![0.0; n];
    for row in &patterns.states {
        for (&s, &w) in row.iter().zip(&patterns.weights) {
            if s == unknown || s == 0 {
                continue;
            }
            let share = w / s.count_ones() as f64;
            for (i, c) in counts.iter_mut().enumerate() {
                if (s >> i) & 1 == 1 {
                    *c += share;
                }
            }
        }
    }
    normalize_frequencies(counts)
}

/// Rescale to sum 1 with every entry at least [`MIN_FREQUENCY`].
fn normalize_frequencies(mut freqs: Vec<f64>) -> Vec<f64> {
    let n = freqs.len();
    let total: f64 = freqs.iter().sum();
    if !(total > 0.0) {
        return vec![1.0 / n as f64; n];
    }
    for f in &mut freqs {
        *f = (*f / total).max(MIN_FREQUENCY);
    }
    let total: f64 = freqs.iter().sum();
    freqs.iter().map(|f| f / total).collect()
}

/// Nucleotides (T=0, C=1, A=2, G=3) and amino acid of each sense codon state.
fn sense_codons() -> Vec<([usize; 3], u8)> {
    let table = sense_codon_table();
    let mut out = vec![([0; 3], b'*'); NUM_SENSE_CODONS];
    for (idx, state) in table.iter().enumerate() {
        if let Some(s) = state {
            out[*s] = ([idx / 16, (idx / 4) % 4, idx % 4], GENETIC_CODE[idx]);
        }
    }
    out
}

/// Symmetric exchangeability matrix with a zero diagonal.
fn exchangeabilities(base: BaseModel, n: usize, rates: &[f64]) -> Array2<f64> {
    let mut s = Array2::<f64>::from_elem((n, n), 1.0);
    match base {
        BaseModel::K80 | BaseModel::Hky | BaseModel::Tn | BaseModel::Sym | BaseModel::Gtr => {
            // A C G T pairs: AC AG AT CG CT GT
            let pairs = match base {
                BaseModel::K80 | BaseModel::Hky => [1.0, rates[0], 1.0, 1.0, rates[0], 1.0],
                BaseModel::Tn => [1.0, rates[0], 1.0, 1.0, rates[1], 1.0],
                _ => [rates[0], rates[1], rates[2], rates[3], rates[4], 1.0],
            };
            let mut k = 0;
            for i in 0..4 {
                for j in i + 1..4 {
                    s[[i, j]] = pairs[k];
                    s[[j, i]] = pairs[k];
                    k += 1;
                }
            }
        }
        BaseModel::Lg => {
            let mut k = 0;
            for i in 1..20 {
                for j in 0..i {
                    s[[i, j]] = LG_RATES[k];
                    s[[j, i]] = LG_RATES[k];
                    k += 1;
                }
            }
        }
        BaseModel::Gy => {
            let (kappa, omega) = (rates[0], rates[1]);
            let codons = sense_codons();
            for i in 0..n {
                for j in 0..n {
                    let (ci, ai) = codons[i];
                    let (cj, aj) = codons[j];
                    let diffs: Vec<usize> = (0..3).filter(|&p| ci[p] != cj[p]).collect();
                    s[[i, j]] = if diffs.len() == 1 {
                        let (x, y) = (ci[diffs[0]], cj[diffs[0]]);
                        // T<->C and A<->G are transitions
                        let transition = x / 2 == y / 2;
                        let mut r = if transition { kappa } else { 1.0 };
                        if ai != aj {
                            r *= omega;
                        }
                        r
                    } else {
                        0.0
                    };
                }
            }
        }
        _ => {}
    }
    for i in 0..n {
        s[[i, i]] = 0.0;
    }
    s
}

/// A fitted substitution model bound to one partition.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "ModelState", into = "ModelState")]
pub struct Model {
    spec: ModelSpec,
    num_states: usize,
    rates: Vec<f64>,
    freqs: Vec<f64>,
    alpha: f64,
    pinv: f64,
    max_pinv: f64,
    category_rates: Vec<f64>,
    eigen: Eigen,
}

/// Plain serialized form of a [`Model`]; the eigen-system is rebuilt on load.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelState {
    pub name: String,
    pub num_states: usize,
    pub rates: Vec<f64>,
    pub freqs: Vec<f64>,
    pub alpha: f64,
    pub pinv: f64,
    pub max_pinv: f64,
}

impl From<Model> for ModelState {
    fn from(m: Model) -> Self {
        ModelState {
            name: m.spec.to_string(),
            num_states: m.num_states,
            rates: m.rates,
            freqs: m.freqs,
            alpha: m.alpha,
            pinv: m.pinv,
            max_pinv: m.max_pinv,
        }
    }
}

impl TryFrom<ModelState> for Model {
    type Error = PhyloError;

    fn try_from(state: ModelState) -> Result<Self> {
        let spec: ModelSpec = state.name.parse()?;
        if state.rates.len() != spec.base.initial_rates().len() || state.freqs.len() != state.num_states {
            return Err(PhyloError::CorruptCheckpoint(format!(
                "stored parameters do not fit model {}",
                state.name
            )));
        }
        Model::assemble(spec, state.num_states, state.rates, state.freqs, state.alpha, state.pinv, state.max_pinv)
    }
}

impl Model {
    /// Build the model named by `spec` for one partition, with starting
    /// parameter values.
    ///
    /// `fconst` fixes the frequencies when its length matches the number of
    /// states, unless `spec` asks for equal frequencies.
    ///
    /// # Errors
    /// `InvalidParameter` if the model does not fit the data type or `+FU`
    /// is used without matching user frequencies.
    pub fn new(spec: &ModelSpec, seq_type: SeqType, patterns: &SitePatterns, fconst: Option<&[f64]>) -> Result<Model> {
        let data_type = seq_type.model_alphabet();
        if spec.base.alphabet() != data_type {
            return Err(PhyloError::InvalidParameter(format!(
                "model {spec} is for {} data, but the partition is {seq_type}",
                spec.base.alphabet()
            )));
        }
        let n = patterns.num_states;
        let user = fconst.filter(|f| f.len() == n);

        let freqs = match (spec.freq, user) {
            (FreqType::Equal, _) => vec![1.0 / n as f64; n],
            (_, Some(f)) => normalize_frequencies(f.to_vec()),
            (FreqType::User, None) => {
                return Err(PhyloError::InvalidParameter(format!(
                    "model {spec} needs {n} user frequencies (--fconst)"
                )));
            }
            (FreqType::Model, None) => normalize_frequencies(LG_FREQS.to_vec()),
            (FreqType::Empirical | FreqType::Optimized, None) => empirical_frequencies(patterns),
        };
        let mut spec = spec.clone();
        if user.is_some() && spec.freq != FreqType::Equal {
            spec.freq = FreqType::User;
        }

        let constant_weight: f64 = patterns
            .constant
            .iter()
            .zip(&patterns.weights)
            .filter(|(c, _)| **c != 0)
            .map(|(_, w)| w)
            .sum();
        let total_weight: f64 = patterns.weights.iter().sum();
        let max_pinv = if total_weight > 0.0 {
            (constant_weight / total_weight).min(MAX_PINV)
        } else {
            0.0
        };
        let pinv = match (spec.invariant, spec.fixed_pinv) {
            (false, _) => 0.0,
            (true, Some(p)) => p,
            (true, None) => max_pinv / 2.0,
        };
        let alpha = spec.fixed_alpha.unwrap_or(DEFAULT_ALPHA);
        let rates = spec.base.initial_rates();
        Model::assemble(spec, n, rates, freqs, alpha, pinv, max_pinv)
    }

    fn assemble(
        spec: ModelSpec,
        num_states: usize,
        rates: Vec<f64>,
        freqs: Vec<f64>,
        alpha: f64,
        pinv: f64,
        max_pinv: f64,
    ) -> Result<Model> {
        let placeholder = Eigen {
            values: Array1::zeros(num_states),
            left: Array2::zeros((num_states, num_states)),
            right: Array2::zeros((num_states, num_states)),
        };
        let mut model = Model {
            spec,
            num_states,
            rates,
            freqs,
            alpha,
            pinv,
            max_pinv,
            category_rates: Vec::new(),
            eigen: placeholder,
        };
        model.refresh_rates()?;
        model.refresh_eigen()?;
        Ok(model)
    }

    fn refresh_rates(&mut self) -> Result<()> {
        let base = match self.spec.gamma_categories {
            Some(k) => discrete_gamma_rates(self.alpha, k)?,
            None => vec![1.0],
        };
        let scale = 1.0 / (1.0 - self.pinv);
        self.category_rates = base.into_iter().map(|r| r * scale).collect();
        Ok(())
    }

    fn refresh_eigen(&mut self) -> Result<()> {
        let n = self.num_states;
        let s = exchangeabilities(self.spec.base, n, &self.rates);
        let pi = &self.freqs;

        let mut mu = 0.0;
        for i in 0..n {
            for j in 0..n {
                mu += pi[i] * s[[i, j]] * pi[j];
            }
        }
        if !(mu > 0.0) {
            return Err(PhyloError::NumericalFailure(format!("model {} has a zero rate matrix", self.spec)));
        }

        let sqrt_pi: Vec<f64> = pi.iter().map(|p| p.sqrt()).collect();
        let mut b = Array2::<f64>::zeros((n, n));
        for i in 0..n {
            let mut row = 0.0;
            for j in 0..n {
                if i != j {
                    b[[i, j]] = s[[i, j]] * sqrt_pi[i] * sqrt_pi[j] / mu;
                    row += s[[i, j]] * pi[j] / mu;
                }
            }
            b[[i, i]] = -row;
        }

        let (values, u) = jacobi_eigen(b)?;
        let mut left = u.clone();
        let mut right = u.reversed_axes();
        for i in 0..n {
            left.row_mut(i).mapv_inplace(|x| x / sqrt_pi[i]);
        }
        for j in 0..n {
            right.column_mut(j).mapv_inplace(|x| x * sqrt_pi[j]);
        }
        self.eigen = Eigen { values, left, right };
        Ok(())
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn name(&self) -> String {
        self.spec.to_string()
    }

    pub fn num_states(&self) -> usize {
        self.num_states
    }

    pub fn freqs(&self) -> &[f64] {
        &self.freqs
    }

    pub fn rates(&self) -> &[f64] {
        &self.rates
    }

    pub fn alpha(&self) -> Option<f64> {
        self.spec.gamma_categories.map(|_| self.alpha)
    }

    pub fn pinv(&self) -> f64 {
        self.pinv
    }

    /// Relative rate of each gamma category, already scaled by `1/(1-pinv)`.
    pub fn category_rates(&self) -> &[f64] {
        &self.category_rates
    }

    /// Prior weight of one variable-rate category.
    pub fn category_weight(&self) -> f64 {
        (1.0 - self.pinv) / self.category_rates.len() as f64
    }

    /// `P(t)` with `P[i][j]` the probability of ending in `j` from `i`.
    pub fn transition_matrix(&self, t: f64) -> Array2<f64> {
        let Eigen { values, left, right } = &self.eigen;
        let decay = values.mapv(|l| (l * t).exp());
        let scaled = left * &decay;
        let mut p = scaled.dot(right);
        p.mapv_inplace(|x| x.max(0.0));
        p
    }

    /// Free parameters in optimization order.
    pub fn free_params(&self) -> Vec<Param> {
        let mut out: Vec<Param> = (0..self.rates.len()).map(Param::Rate).collect();
        if self.spec.freq == FreqType::Optimized {
            out.extend((0..self.num_states - 1).map(Param::FreqRatio));
        }
        if self.spec.invariant && self.spec.fixed_pinv.is_none() && self.max_pinv > 0.0 {
            out.push(Param::Pinv);
        }
        if self.spec.gamma_categories.is_some() && self.spec.fixed_alpha.is_none() {
            out.push(Param::Alpha);
        }
        out
    }

    /// Number of free parameters counted by information criteria, including
    /// frequencies estimated from the data.
    pub fn num_free_params(&self) -> usize {
        let freq = match self.spec.freq {
            FreqType::Empirical | FreqType::Optimized => self.num_states - 1,
            FreqType::Equal | FreqType::User | FreqType::Model => 0,
        };
        let pinv = usize::from(self.spec.invariant && self.spec.fixed_pinv.is_none());
        let alpha = usize::from(self.spec.gamma_categories.is_some() && self.spec.fixed_alpha.is_none());
        self.rates.len() + freq + pinv + alpha
    }

    pub fn param_bounds(&self, param: Param) -> (f64, f64) {
        match param {
            Param::Rate(i) => self.spec.base.rate_bounds(i),
            Param::Alpha => (MIN_ALPHA, MAX_ALPHA),
            Param::Pinv => (0.0, self.max_pinv),
            Param::FreqRatio(_) => (-MAX_LOG_FREQ_RATIO, MAX_LOG_FREQ_RATIO),
        }
    }

    pub fn param(&self, param: Param) -> f64 {
        match param {
            Param::Rate(i) => self.rates[i],
            Param::Alpha => self.alpha,
            Param::Pinv => self.pinv,
            Param::FreqRatio(i) => (self.freqs[i] / self.freqs[self.num_states - 1]).ln(),
        }
    }

    /// Set one parameter (clamped to its bounds) and rebuild what depends on it.
    pub fn set_param(&mut self, param: Param, value: f64) -> Result<()> {
        let (lo, hi) = self.param_bounds(param);
        let value = value.clamp(lo, hi);
        match param {
            Param::Rate(i) => {
                self.rates[i] = value;
                self.refresh_eigen()
            }
            Param::Alpha => {
                self.alpha = value;
                self.refresh_rates()
            }
            Param::Pinv => {
                self.pinv = value;
                self.refresh_rates()
            }
            Param::FreqRatio(i) => {
                let last = self.num_states - 1;
                let mut ratios: Vec<f64> = (0..last).map(|k| self.param(Param::FreqRatio(k))).collect();
                ratios[i] = value;
                let mut freqs: Vec<f64> = ratios.iter().map(|r| r.exp()).collect();
                freqs.push(1.0);
                self.freqs = normalize_frequencies(freqs);
                self.refresh_eigen()
            }
        }
    }

    /// One-line description of the fitted parameters for the run log.
    pub fn summary(&self) -> String {
        let fmt_list = |v: &[f64]| v.iter().map(|x| format!("{x:.5}")).collect::<Vec<_>>().join(" ");
        let mut s = self.name();
        if !self.rates.is_empty() {
            s.push_str(&format!(" rates=[{}]", fmt_list(&self.rates)));
        }
        if self.num_states <= 20 {
            s.push_str(&format!(" freqs=[{}]", fmt_list(&self.freqs)));
        }
        if self.spec.invariant {
            s.push_str(&format!(" pinv={:.5}", self.pinv));
        }
        if let Some(a) = self.alpha() {
            s.push_str(&format!(" alpha={a:.5}"));
        }
        s
    }
}
