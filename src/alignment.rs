//! Sequence loading, state encoding and site-pattern compression.
//!
//! # Overview
//! Every alignment cell is stored as a [`StateSet`]: a bitmask over the
//! states of the alphabet. A resolved character has exactly one bit set, an
//! ambiguity code (IUPAC `R`, amino acid `B`, ...) has several, and gaps or
//! unknown characters have every bit set. The same representation feeds the
//! likelihood tip vectors and Fitch parsimony.
//!
//! # Supported input
//! - relaxed PHYLIP, sequential or interleaved
//! - FASTA
//! - either of the above gzip-compressed
//! - a directory of such files, concatenated by taxon name
//!
//! # Example
//! ```
//! # use phylo_search::alignment::{parse_alignment, SeqType};
//! let aln = parse_alignment("3 4\nA ACGT\nB ACGA\nC ACGR\n", "inline", None).unwrap();
//! assert_eq!(aln.seq_type(), SeqType::Dna);
//! assert_eq!(aln.num_sites(), 4);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::path::Path;
use std::str::FromStr;

use indexmap::IndexMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{PhyloError, Result};
use crate::io::read_text;

/// Bitmask of the states a cell may take. Bit `i` is state `i`.
pub type StateSet = u64;

/// Amino acid order used for state indices.
pub const AA_ORDER: &[u8; 20] = b"ARNDCQEGHILKMFPSTWYV";

/// Symbols of morphological characters, state `i` is `MORPH_SYMBOLS[i]`.
pub const MORPH_SYMBOLS: &[u8; 32] = b"0123456789ABCDEFGHIJKLMNOPQRSTUV";

/// Standard genetic code, codons enumerated with T=0, C=1, A=2, G=3 at each position.
pub const GENETIC_CODE: &[u8; 64] =
    b"FFLLSSSSYY**CC*WLLLLPPPPHHQQRRRRIIIMTTTTNNKKSSRRVVVVAAAADDEEGGGG";

/// Number of sense codons in the standard code.
pub const NUM_SENSE_CODONS: usize = 61;

/// Kind of characters in an alignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeqType {
    Bin,
    Dna,
    Aa,
    /// Nucleotides translated to amino acids.
    Nt2Aa,
    /// Nucleotide triplets over the 61 sense codons.
    Codon,
    Morph,
}

impl FromStr for SeqType {
    type Err = PhyloError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BIN" | "BINARY" => Ok(SeqType::Bin),
            "DNA" | "NT" => Ok(SeqType::Dna),
            "AA" | "PROT" | "PROTEIN" => Ok(SeqType::Aa),
            "NT2AA" => Ok(SeqType::Nt2Aa),
            "CODON" => Ok(SeqType::Codon),
            "MORPH" | "MULTI" => Ok(SeqType::Morph),
            other => Err(PhyloError::InvalidParameter(format!(
                "unknown sequence type '{other}' (expected BIN, DNA, AA, NT2AA, CODON or MORPH)"
            ))),
        }
    }
}

impl fmt::Display for SeqType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SeqType::Bin => "BIN",
            SeqType::Dna => "DNA",
            SeqType::Aa => "AA",
            SeqType::Nt2Aa => "NT2AA",
            SeqType::Codon => "CODON",
            SeqType::Morph => "MORPH",
        };
        f.write_str(s)
    }
}

impl SeqType {
    /// Alphabet size, `None` for morphological data where it depends on the input.
    pub fn fixed_states(self) -> Option<usize> {
        match self {
            SeqType::Bin => Some(2),
            SeqType::Dna => Some(4),
            SeqType::Aa | SeqType::Nt2Aa => Some(20),
            SeqType::Codon => Some(NUM_SENSE_CODONS),
            SeqType::Morph => None,
        }
    }

    /// Alphabet the substitution model works on.
    pub fn model_alphabet(self) -> SeqType {
        match self {
            SeqType::Nt2Aa => SeqType::Aa,
            other => other,
        }
    }
}

/// Mask with the lowest `num_states` bits set.
#[inline]
pub fn full_mask(num_states: usize) -> StateSet {
    if num_states >= 64 { u64::MAX } else { (1u64 << num_states) - 1 }
}

#[inline]
fn is_gap(c: u8) -> bool {
    matches!(c, b'-' | b'?' | b'.' | b'~')
}

fn encode_dna(c: u8) -> Option<StateSet> {
    const A: u64 = 1;
    const C: u64 = 2;
    const G: u64 = 4;
    const T: u64 = 8;
    let s = match c.to_ascii_uppercase() {
        b'A' => A,
        b'C' => C,
        b'G' => G,
        b'T' | b'U' => T,
        b'R' => A | G,
        b'Y' => C | T,
        b'S' => C | G,
        b'W' => A | T,
        b'K' => G | T,
        b'M' => A | C,
        b'B' => C | G | T,
        b'D' => A | G | T,
        b'H' => A | C | T,
        b'V' => A | C | G,
        b'N' | b'X' | b'O' => A | C | G | T,
        c if is_gap(c) => A | C | G | T,
        _ => return None,
    };
    Some(s)
}

fn aa_index(c: u8) -> Option<usize> {
    let c = c.to_ascii_uppercase();
    AA_ORDER.iter().position(|&a| a == c)
}

fn encode_aa(c: u8) -> Option<StateSet> {
    let bit = |a: u8| aa_index(a).map(|i| 1u64 << i).unwrap_or(0);
    let upper = c.to_ascii_uppercase();
    if let Some(i) = aa_index(upper) {
        return Some(1u64 << i);
    }
    match upper {
        b'B' => Some(bit(b'N') | bit(b'D')),
        b'Z' => Some(bit(b'Q') | bit(b'E')),
        b'J' => Some(bit(b'I') | bit(b'L')),
        b'X' | b'U' | b'O' => Some(full_mask(20)),
        c if is_gap(c) => Some(full_mask(20)),
        _ => None,
    }
}

fn encode_bin(c: u8) -> Option<StateSet> {
    match c {
        b'0' => Some(1),
        b'1' => Some(2),
        c if is_gap(c) => Some(3),
        _ => None,
    }
}

fn morph_index(c: u8) -> Option<usize> {
    let c = c.to_ascii_uppercase();
    MORPH_SYMBOLS.iter().position(|&m| m == c)
}

fn nucleotide_tcag(c: u8) -> Option<usize> {
    match c.to_ascii_uppercase() {
        b'T' | b'U' => Some(0),
        b'C' => Some(1),
        b'A' => Some(2),
        b'G' => Some(3),
        _ => None,
    }
}

/// Map from codon index (0..64) to sense-codon state, `None` for stop codons.
pub fn sense_codon_table() -> [Option<usize>; 64] {
    let mut table = [None; 64];
    let mut next = 0;
    for (i, &aa) in GENETIC_CODE.iter().enumerate() {
        if aa != b'*' {
            table[i] = Some(next);
            next += 1;
        }
    }
    table
}

/// Guess the sequence type from raw characters.
///
/// Binary if only `0`/`1` occur, DNA if at least 90% of the non-gap
/// characters are nucleotides, morphological if digits occur, otherwise
/// protein.
pub fn detect_seq_type<S: AsRef<[u8]>>(seqs: &[S]) -> SeqType {
    let (mut total, mut nuc, mut bin, mut digit) = (0usize, 0usize, 0usize, 0usize);
    for seq in seqs {
        for &c in seq.as_ref() {
            if is_gap(c) {
                continue;
            }
            total += 1;
            let u = c.to_ascii_uppercase();
            if matches!(u, b'A' | b'C' | b'G' | b'T' | b'U' | b'N') {
                nuc += 1;
            }
            if matches!(u, b'0' | b'1') {
                bin += 1;
            }
            if u.is_ascii_digit() {
                digit += 1;
            }
        }
    }
    if total == 0 {
        SeqType::Dna
    } else if bin == total {
        SeqType::Bin
    } else if nuc as f64 >= 0.9 * total as f64 {
        SeqType::Dna
    } else if digit > 0 {
        SeqType::Morph
    } else {
        SeqType::Aa
    }
}

/// Site patterns of a set of columns: identical columns collapsed with weights.
#[derive(Clone, Debug)]
pub struct SitePatterns {
    pub num_taxa: usize,
    pub num_states: usize,
    /// `states[taxon][pattern]`
    pub states: Vec<Vec<StateSet>>,
    /// Number of sites carrying each pattern.
    pub weights: Vec<f64>,
    /// States every taxon admits at this pattern; 0 for variable patterns.
    pub constant: Vec<StateSet>,
    /// Number of alignment columns compressed into these patterns.
    pub num_sites: usize,
}

impl SitePatterns {
    pub fn num_patterns(&self) -> usize {
        self.weights.len()
    }
}

/// An encoded alignment: taxa × sites of [`StateSet`] cells.
#[derive(Clone, Debug)]
pub struct Alignment {
    names: Vec<String>,
    index: HashMap<String, usize>,
    seq_type: SeqType,
    num_states: usize,
    rows: Vec<Vec<StateSet>>,
    sources: Vec<(String, Range<usize>)>,
}

impl Alignment {
    /// Encode named raw sequences.
    ///
    /// # Errors
    /// `MalformedInput` on duplicate names, rows of different lengths,
    /// characters outside the alphabet, or stop codons in codon data.
    pub fn from_sequences(records: Vec<(String, String)>, seq_type: Option<SeqType>) -> Result<Self> {
        if records.is_empty() {
            return Err(PhyloError::MalformedInput("alignment contains no sequences".to_string()));
        }

        let mut index = HashMap::with_capacity(records.len());
        for (i, (name, _)) in records.iter().enumerate() {
            if name.is_empty() {
                return Err(PhyloError::MalformedInput(format!("sequence {} has an empty name", i + 1)));
            }
            if index.insert(name.clone(), i).is_some() {
                return Err(PhyloError::MalformedInput(format!("duplicate taxon name '{name}'")));
            }
        }

        let expected = records[0].1.len();
        for (name, seq) in &records {
            if seq.len() != expected {
                return Err(PhyloError::MalformedInput(format!(
                    "sequence '{name}' has {} characters, expected {expected}",
                    seq.len()
                )));
            }
        }

        let seq_type = match seq_type {
            Some(t) => t,
            None => {
                let raw: Vec<&[u8]> = records.iter().map(|(_, s)| s.as_bytes()).collect();
                let t = detect_seq_type(&raw);
                info!("Alignment detected as {t}");
                t
            }
        };

        if matches!(seq_type, SeqType::Codon | SeqType::Nt2Aa) && expected % 3 != 0 {
            return Err(PhyloError::MalformedInput(format!(
                "{seq_type} alignment length {expected} is not a multiple of 3"
            )));
        }

        let num_states = match seq_type.fixed_states() {
            Some(n) => n,
            None => {
                let mut max_idx = 1;
                for (name, seq) in &records {
                    for (site, &c) in seq.as_bytes().iter().enumerate() {
                        if is_gap(c) {
                            continue;
                        }
                        let idx = morph_index(c).ok_or_else(|| unknown_char(c, name, site))?;
                        max_idx = max_idx.max(idx);
                    }
                }
                max_idx + 1
            }
        };

        let codons = sense_codon_table();
        let mut names = Vec::with_capacity(records.len());
        let mut rows = Vec::with_capacity(records.len());
        for (name, seq) in records {
            let row = encode_row(seq.as_bytes(), &name, seq_type, num_states, &codons)?;
            names.push(name);
            rows.push(row);
        }

        let num_sites = rows[0].len();
        debug!("Encoded {} taxa x {} sites ({} states)", names.len(), num_sites, num_states);
        Ok(Alignment {
            names,
            index,
            seq_type,
            num_states,
            rows,
            sources: Vec::new(),
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn num_taxa(&self) -> usize {
        self.names.len()
    }

    pub fn num_sites(&self) -> usize {
        self.rows.first().map_or(0, Vec::len)
    }

    pub fn seq_type(&self) -> SeqType {
        self.seq_type
    }

    pub fn num_states(&self) -> usize {
        self.num_states
    }

    pub fn row(&self, taxon: usize) -> &[StateSet] {
        &self.rows[taxon]
    }

    pub fn taxon_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Column ranges contributed by each file when loaded from a directory.
    pub fn sources(&self) -> &[(String, Range<usize>)] {
        &self.sources
    }

    pub fn unknown_state(&self) -> StateSet {
        full_mask(self.num_states)
    }

    /// Compress the given columns into weighted site patterns.
    pub fn patterns(&self, sites: &[usize]) -> SitePatterns {
        let num_taxa = self.num_taxa();
        let mut seen: IndexMap<Vec<StateSet>, usize> = IndexMap::new();
        for &site in sites {
            let column: Vec<StateSet> = self.rows.iter().map(|r| r[site]).collect();
            *seen.entry(column).or_insert(0) += 1;
        }

        let mut states = vec![Vec::with_capacity(seen.len()); num_taxa];
        let mut weights = Vec::with_capacity(seen.len());
        let mut constant = Vec::with_capacity(seen.len());
        for (column, count) in seen {
            let shared = column.iter().fold(self.unknown_state(), |acc, s| acc & s);
            for (t, s) in column.into_iter().enumerate() {
                states[t].push(s);
            }
            weights.push(count as f64);
            constant.push(shared);
        }

        SitePatterns {
            num_taxa,
            num_states: self.num_states,
            states,
            weights,
            constant,
            num_sites: sites.len(),
        }
    }

    /// Empirical state frequencies over the given columns. Ambiguous cells
    /// count fractionally, fully unknown cells are skipped.
    pub fn state_frequencies(&self, sites: &[usize]) -> Vec<f64> {
        let n = self.num_states;
        let unknown = self.unknown_state();
        let mut counts = vec![0.0; n];
        for row in &self.rows {
            for &site in sites {
                let s = row[site];
                if s == unknown || s == 0 {
                    continue;
                }
                let share = 1.0 / s.count_ones() as f64;
                for (i, c) in counts.iter_mut().enumerate() {
                    if (s >> i) & 1 == 1 {
                        *c += share;
                    }
                }
            }
        }
        let total: f64 = counts.iter().sum();
        if total <= 0.0 {
            return vec![1.0 / n as f64; n];
        }
        counts.iter().map(|c| c / total).collect()
    }

    /// Concatenate alignments by taxon name; taxa missing from a block are unknown there.
    fn concatenate(blocks: Vec<(String, Alignment)>) -> Result<Alignment> {
        let first_type = blocks
            .first()
            .map(|(_, a)| a.seq_type)
            .ok_or_else(|| PhyloError::MalformedInput("no alignment files found".to_string()))?;
        if let Some((name, a)) = blocks.iter().find(|(_, a)| a.seq_type != first_type) {
            return Err(PhyloError::MalformedInput(format!(
                "alignment '{name}' is {} but earlier files are {first_type}",
                a.seq_type
            )));
        }
        let num_states = blocks.iter().map(|(_, a)| a.num_states).max().unwrap_or(2);
        let unknown = full_mask(num_states);

        let mut names: Vec<String> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for (_, a) in &blocks {
            for name in &a.names {
                if !index.contains_key(name) {
                    index.insert(name.clone(), names.len());
                    names.push(name.clone());
                }
            }
        }

        let mut rows = vec![Vec::new(); names.len()];
        let mut sources = Vec::with_capacity(blocks.len());
        let mut offset = 0;
        for (block_name, a) in &blocks {
            let width = a.num_sites();
            let block_unknown = a.unknown_state();
            for (t, name) in names.iter().enumerate() {
                match a.taxon_index(name) {
                    Some(src) => rows[t].extend(
                        a.rows[src]
                            .iter()
                            .map(|&s| if s == block_unknown { unknown } else { s }),
                    ),
                    None => rows[t].extend(std::iter::repeat_n(unknown, width)),
                }
            }
            sources.push((block_name.clone(), offset..offset + width));
            offset += width;
        }

        Ok(Alignment {
            names,
            index,
            seq_type: first_type,
            num_states,
            rows,
            sources,
        })
    }
}

fn unknown_char(c: u8, name: &str, site: usize) -> PhyloError {
    PhyloError::MalformedInput(format!(
        "unknown character '{}' in sequence '{name}' at site {}",
        c as char,
        site + 1
    ))
}

fn encode_row(
    seq: &[u8],
    name: &str,
    seq_type: SeqType,
    num_states: usize,
    codons: &[Option<usize>; 64],
) -> Result<Vec<StateSet>> {
    match seq_type {
        SeqType::Dna => seq
            .iter()
            .enumerate()
            .map(|(i, &c)| encode_dna(c).ok_or_else(|| unknown_char(c, name, i)))
            .collect(),
        SeqType::Aa => seq
            .iter()
            .enumerate()
            .map(|(i, &c)| encode_aa(c).ok_or_else(|| unknown_char(c, name, i)))
            .collect(),
        SeqType::Bin => seq
            .iter()
            .enumerate()
            .map(|(i, &c)| encode_bin(c).ok_or_else(|| unknown_char(c, name, i)))
            .collect(),
        SeqType::Morph => seq
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                if is_gap(c) {
                    Ok(full_mask(num_states))
                } else {
                    morph_index(c)
                        .filter(|&idx| idx < num_states)
                        .map(|idx| 1u64 << idx)
                        .ok_or_else(|| unknown_char(c, name, i))
                }
            })
            .collect(),
        SeqType::Codon | SeqType::Nt2Aa => seq
            .chunks(3)
            .enumerate()
            .map(|(i, triplet)| encode_triplet(triplet, name, i, seq_type, codons))
            .collect(),
    }
}

fn encode_triplet(
    triplet: &[u8],
    name: &str,
    codon_pos: usize,
    seq_type: SeqType,
    codons: &[Option<usize>; 64],
) -> Result<StateSet> {
    let unknown = match seq_type {
        SeqType::Codon => full_mask(NUM_SENSE_CODONS),
        _ => full_mask(20),
    };
    let mut idx = 0;
    for (k, &c) in triplet.iter().enumerate() {
        match nucleotide_tcag(c) {
            Some(n) => idx = idx * 4 + n,
            None if is_gap(c) || encode_dna(c).is_some() => return Ok(unknown),
            None => return Err(unknown_char(c, name, codon_pos * 3 + k)),
        }
    }
    let stop = || {
        PhyloError::MalformedInput(format!(
            "sequence '{name}' has a stop codon at codon {}",
            codon_pos + 1
        ))
    };
    match seq_type {
        SeqType::Codon => codons[idx].map(|s| 1u64 << s).ok_or_else(stop),
        _ => {
            let aa = GENETIC_CODE[idx];
            if aa == b'*' {
                return Err(stop());
            }
            encode_aa(aa).ok_or_else(stop)
        }
    }
}

fn parse_phylip(text: &str, source: &str) -> Result<Vec<(String, String)>> {
    let malformed = |msg: String| PhyloError::MalformedInput(format!("{source}: {msg}"));
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header = lines.next().ok_or_else(|| malformed("empty file".to_string()))?;
    let mut dims = header.split_whitespace();
    let ntax: usize = dims
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| malformed(format!("bad PHYLIP header '{header}'")))?;
    let nchar: usize = dims
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| malformed(format!("bad PHYLIP header '{header}'")))?;
    let body: Vec<&str> = lines.map(str::trim).collect();
    if ntax == 0 {
        return Err(malformed("header declares no taxa".to_string()));
    }
    if body.len() < ntax {
        return Err(malformed(format!("expected {ntax} sequences, found {}", body.len())));
    }

    let strip = |s: &str| s.chars().filter(|c| !c.is_whitespace()).collect::<String>();
    let split = |line: &str| -> (String, String) {
        let mut parts = line.splitn(2, char::is_whitespace);
        let name = parts.next().unwrap_or_default().to_string();
        let seq = parts.next().map(strip).unwrap_or_default();
        (name, seq)
    };

    // Interleaved (or single-line sequential): first block names, then round robin.
    let mut records: Vec<(String, String)> = body[..ntax].iter().map(|l| split(l)).collect();
    let rest = &body[ntax..];
    if rest.len() % ntax == 0 {
        for (k, line) in rest.iter().enumerate() {
            records[k % ntax].1.push_str(&strip(line));
        }
        if records.iter().all(|(_, s)| s.len() == nchar) {
            return Ok(records);
        }
    }

    // Sequential over several lines per taxon.
    let mut sequential = Vec::with_capacity(ntax);
    let mut cursor = body.iter();
    for _ in 0..ntax {
        let Some(first) = cursor.next() else { break };
        let (name, mut seq) = split(first);
        while seq.len() < nchar {
            match cursor.next() {
                Some(line) => seq.push_str(&strip(line)),
                None => break,
            }
        }
        sequential.push((name, seq));
    }
    if cursor.next().is_none()
        && sequential.len() == ntax
        && sequential.iter().all(|(_, s)| s.len() == nchar)
    {
        return Ok(sequential);
    }

    let bad = records
        .iter()
        .find(|(_, s)| s.len() != nchar)
        .map(|(n, s)| format!("sequence '{n}' has {} characters, expected {nchar}", s.len()))
        .unwrap_or_else(|| "inconsistent sequence lengths".to_string());
    Err(malformed(bad))
}

fn parse_fasta(text: &str, source: &str) -> Result<Vec<(String, String)>> {
    let mut records: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }
        if let Some(header) = line.strip_prefix('>') {
            let name = header.split_whitespace().next().unwrap_or_default().to_string();
            records.push((name, String::new()));
        } else {
            let Some(last) = records.last_mut() else {
                return Err(PhyloError::MalformedInput(format!(
                    "{source}: sequence data before the first '>' header"
                )));
            };
            last.1.extend(line.chars().filter(|c| !c.is_whitespace()));
        }
    }
    if records.is_empty() {
        return Err(PhyloError::MalformedInput(format!("{source}: no FASTA records")));
    }
    Ok(records)
}

/// Parse alignment text, detecting PHYLIP or FASTA from the first character.
pub fn parse_alignment(text: &str, source: &str, seq_type: Option<SeqType>) -> Result<Alignment> {
    let first = text.trim_start();
    let records = if first.starts_with('>') {
        parse_fasta(text, source)?
    } else if first.starts_with(|c: char| c.is_ascii_digit()) {
        parse_phylip(text, source)?
    } else if first.to_ascii_uppercase().starts_with("#NEXUS") {
        return Err(PhyloError::MalformedInput(format!(
            "{source}: NEXUS alignments are not supported, use PHYLIP or FASTA"
        )));
    } else {
        return Err(PhyloError::MalformedInput(format!(
            "{source}: unrecognised alignment format"
        )));
    };
    Alignment::from_sequences(records, seq_type)
        .map_err(|e| match e {
            PhyloError::MalformedInput(msg) => PhyloError::MalformedInput(format!("{source}: {msg}")),
            other => other,
        })
}

/// Load an alignment file, or every alignment file of a directory.
///
/// Files of a directory are read in name order and concatenated; each file
/// becomes one entry of [`Alignment::sources`].
pub fn load(path: &Path, seq_type: Option<SeqType>) -> Result<Alignment> {
    if path.is_dir() {
        let mut files: Vec<_> = std::fs::read_dir(path)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| !n.starts_with('.'))
            })
            .collect();
        files.sort();
        info!("Reading {} alignment files from {}", files.len(), path.display());

        let mut blocks = Vec::with_capacity(files.len());
        let mut block_type = seq_type;
        for file in files {
            let text = read_text(&file)?;
            let aln = parse_alignment(&text, &file.display().to_string(), block_type)?;
            block_type = Some(aln.seq_type());
            let stem = file
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            blocks.push((stem, aln));
        }
        return Alignment::concatenate(blocks);
    }

    let text = read_text(path)?;
    let mut aln = parse_alignment(&text, &path.display().to_string(), seq_type)?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    aln.sources = vec![(name, 0..aln.num_sites())];
    Ok(aln)
}
