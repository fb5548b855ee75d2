//! Partition files and per-partition site data.
//!
//! # Formats
//! RAxML style, one partition per line:
//! ```text
//! DNA, gene1 = 1-300
//! GTR+G, gene2 = 301-600\3, 302-600\3
//! ```
//! The leading word is either a sequence type or a model name. NEXUS
//! `charset` lines are also accepted:
//! ```text
//! #NEXUS
//! begin sets;
//!     charset gene1 = 1-300;
//!     charset gene2 = 301-600;
//! end;
//! ```
//!
//! Ranges are 1-based and inclusive; `a-b\k` takes every k-th column.
//! Together the partitions must cover every alignment column exactly once.

use std::path::Path;

use log::{debug, info};

use crate::alignment::{Alignment, SeqType, SitePatterns};
use crate::error::{PhyloError, Result};
use crate::io::read_text;
use crate::model::{ModelSpec, is_model_selection};

/// A partition as written in the partition file, before binding to data.
#[derive(Clone, Debug, PartialEq)]
pub struct PartitionSpec {
    pub name: String,
    pub seq_type: Option<SeqType>,
    pub model: Option<String>,
    /// 0-based alignment columns, in file order.
    pub sites: Vec<usize>,
}

/// One partition bound to an alignment.
#[derive(Clone, Debug)]
pub struct Partition {
    pub name: String,
    pub seq_type: SeqType,
    /// Model requested in the partition file, overriding the global model.
    pub model: Option<String>,
    pub sites: Vec<usize>,
    pub patterns: SitePatterns,
}

fn mismatch(source: &str, line: usize, msg: impl AsRef<str>) -> PhyloError {
    PhyloError::PartitionMismatch(format!("{source} line {line}: {}", msg.as_ref()))
}

/// Parse `1-100`, `5`, `2-99\3` into 0-based columns.
fn parse_range(text: &str, source: &str, line: usize) -> Result<Vec<usize>> {
    let bad = || mismatch(source, line, format!("bad column range '{text}'"));
    let (range, step) = match text.split_once('\\') {
        Some((r, s)) => (r.trim(), s.trim().parse::<usize>().map_err(|_| bad())?),
        None => (text.trim(), 1),
    };
    let (start, end) = match range.split_once('-') {
        Some((a, b)) => (a.trim().parse::<usize>().map_err(|_| bad())?, b.trim().parse::<usize>().map_err(|_| bad())?),
        None => {
            let a = range.parse::<usize>().map_err(|_| bad())?;
            (a, a)
        }
    };
    if start == 0 || end < start || step == 0 {
        return Err(bad());
    }
    Ok((start..=end).step_by(step).map(|c| c - 1).collect())
}

/// Parse a partition file in RAxML or NEXUS form.
///
/// # Errors
/// `PartitionMismatch` on unparsable lines, unknown type or model prefixes,
/// or a file without partitions.
pub fn parse_partition_file(text: &str, source: &str) -> Result<Vec<PartitionSpec>> {
    let nexus = text.trim_start().to_ascii_uppercase().starts_with("#NEXUS");
    let mut specs = Vec::new();

    for (i, raw) in text.lines().enumerate() {
        let line_no = i + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }
        let (head, body) = if nexus {
            let upper = line.to_ascii_uppercase();
            if !upper.starts_with("CHARSET") {
                continue;
            }
            let Some((head, body)) = line["charset".len()..].split_once('=') else {
                return Err(mismatch(source, line_no, "charset without '='"));
            };
            (head.trim().to_string(), body.trim().trim_end_matches(';').to_string())
        } else {
            let Some((head, body)) = line.split_once('=') else {
                return Err(mismatch(source, line_no, "expected 'TYPE, name = ranges'"));
            };
            (head.trim().to_string(), body.trim().to_string())
        };

        let (prefix, name) = match head.split_once(',') {
            Some((p, n)) => (Some(p.trim()), n.trim()),
            None => (None, head.as_str()),
        };
        if name.is_empty() {
            return Err(mismatch(source, line_no, "partition has no name"));
        }

        let (seq_type, model) = match prefix {
            None => (None, None),
            Some(p) => match p.parse::<SeqType>() {
                Ok(t) => (Some(t), None),
                Err(_) if is_model_selection(p) || p.parse::<ModelSpec>().is_ok() => (None, Some(p.to_string())),
                Err(_) => {
                    return Err(mismatch(source, line_no, format!("'{p}' is neither a sequence type nor a model")));
                }
            },
        };

        let separators: &[char] = if nexus { &[' ', '\t', ','] } else { &[','] };
        let mut sites = Vec::new();
        for range in body.split(separators).map(str::trim).filter(|r| !r.is_empty()) {
            sites.extend(parse_range(range, source, line_no)?);
        }
        if sites.is_empty() {
            return Err(mismatch(source, line_no, format!("partition '{name}' has no columns")));
        }
        specs.push(PartitionSpec {
            name: name.trim_matches('\'').to_string(),
            seq_type,
            model,
            sites,
        });
    }

    if specs.is_empty() {
        return Err(PhyloError::PartitionMismatch(format!("{source}: no partitions defined")));
    }
    debug!("Read {} partitions from {source}", specs.len());
    Ok(specs)
}

/// Check that `specs` cover columns `0..num_sites` exactly once.
///
/// # Errors
/// `PartitionMismatch` naming the first column that is out of range,
/// assigned twice, or not assigned.
pub fn check_tiling(specs: &[PartitionSpec], num_sites: usize) -> Result<()> {
    let mut owner: Vec<Option<&str>> = vec![None; num_sites];
    for spec in specs {
        for &site in &spec.sites {
            let slot = owner.get_mut(site).ok_or_else(|| {
                PhyloError::PartitionMismatch(format!(
                    "partition '{}' refers to column {} but the alignment has {num_sites}",
                    spec.name,
                    site + 1
                ))
            })?;
            if let Some(previous) = slot {
                return Err(PhyloError::PartitionMismatch(format!(
                    "column {} is in both '{previous}' and '{}'",
                    site + 1,
                    spec.name
                )));
            }
            *slot = Some(&spec.name);
        }
    }
    if let Some(missing) = owner.iter().position(Option::is_none) {
        return Err(PhyloError::PartitionMismatch(format!(
            "column {} is not assigned to any partition",
            missing + 1
        )));
    }
    Ok(())
}

/// Split an alignment into partitions.
///
/// Without a partition file, every source file of the alignment becomes one
/// partition (a single file gives a single partition).
pub fn build_partitions(aln: &Alignment, partition_file: Option<&Path>) -> Result<Vec<Partition>> {
    let specs = match partition_file {
        Some(path) => {
            let text = read_text(path)?;
            let specs = parse_partition_file(&text, &path.display().to_string())?;
            check_tiling(&specs, aln.num_sites())?;
            specs
        }
        None if aln.sources().len() > 1 => aln
            .sources()
            .iter()
            .map(|(name, range)| PartitionSpec {
                name: name.clone(),
                seq_type: None,
                model: None,
                sites: range.clone().collect(),
            })
            .collect(),
        None => vec![PartitionSpec {
            name: "all".to_string(),
            seq_type: None,
            model: None,
            sites: (0..aln.num_sites()).collect(),
        }],
    };

    let partitions = specs
        .into_iter()
        .map(|spec| {
            if let Some(t) = spec.seq_type {
                if t != aln.seq_type() {
                    return Err(PhyloError::PartitionMismatch(format!(
                        "partition '{}' is declared {t} but the alignment is {}",
                        spec.name,
                        aln.seq_type()
                    )));
                }
            }
            let patterns = aln.patterns(&spec.sites);
            Ok(Partition {
                name: spec.name,
                seq_type: aln.seq_type(),
                model: spec.model,
                sites: spec.sites,
                patterns,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    for p in &partitions {
        info!(
            "Partition {}: {} sites, {} patterns",
            p.name,
            p.sites.len(),
            p.patterns.num_patterns()
        );
    }
    Ok(partitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::parse_alignment;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn raxml_style() {
        let text = "DNA, first = 1-4\nGTR+G, second = 5-8\\2, 6-8\\2\n";
        let specs = parse_partition_file(text, "p").unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].seq_type, Some(SeqType::Dna));
        assert_eq!(specs[0].sites, vec![0, 1, 2, 3]);
        assert_eq!(specs[1].model.as_deref(), Some("GTR+G"));
        assert_eq!(specs[1].sites, vec![4, 6, 5, 7]);
        check_tiling(&specs, 8).unwrap();
    }

    #[test]
    fn nexus_charsets() {
        let text = "#NEXUS\nbegin sets;\n  charset a = 1-3 7;\n  charset b = 4-6 8;\nend;\n";
        let specs = parse_partition_file(text, "p").unwrap();
        assert_eq!(specs[0].sites, vec![0, 1, 2, 6]);
        assert_eq!(specs[1].name, "b");
        check_tiling(&specs, 8).unwrap();
    }

    #[rstest]
    #[case("DNA, a = 1-4\nDNA, b = 4-8\n", 8)]
    #[case("DNA, a = 1-4\nDNA, b = 6-8\n", 8)]
    #[case("DNA, a = 1-9\n", 8)]
    fn ranges_must_tile(#[case] text: &str, #[case] num_sites: usize) {
        let specs = parse_partition_file(text, "p").unwrap();
        assert!(matches!(check_tiling(&specs, num_sites), Err(PhyloError::PartitionMismatch(_))));
    }

    #[rstest]
    #[case("DNA, a = 0-4\n")]
    #[case("DNA, a = 5-4\n")]
    #[case("FOO, a = 1-4\n")]
    #[case("DNA a 1-4\n")]
    #[case("\n")]
    fn malformed_partition_files(#[case] text: &str) {
        assert!(matches!(parse_partition_file(text, "p"), Err(PhyloError::PartitionMismatch(_))));
    }

    #[test]
    fn declared_type_must_match_alignment() {
        let aln = parse_alignment("2 4\nA ACGT\nB ACGA\n", "t", None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parts.txt");
        std::fs::write(&path, "AA, a = 1-4\n").unwrap();
        let err = build_partitions(&aln, Some(&path)).unwrap_err();
        assert!(matches!(err, PhyloError::PartitionMismatch(_)));

        std::fs::write(&path, "DNA, a = 1-2\nDNA, b = 3-4\n").unwrap();
        let parts = build_partitions(&aln, Some(&path)).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].patterns.num_sites, 2);
    }

    #[test]
    fn single_partition_without_file() {
        let aln = parse_alignment("2 4\nA ACGT\nB ACGA\n", "t", None).unwrap();
        let parts = build_partitions(&aln, None).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].sites, vec![0, 1, 2, 3]);
    }
}
