//! File helpers shared by the commands: transparent gzip reading, tree files
//! in Newick or NEXUS form, and TSV matrices.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::debug;

use crate::error::{PhyloError, Result};
use crate::tree::Tree;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Read a file as UTF-8 text, gunzipping it when it starts with the gzip magic bytes.
pub fn read_text<P: AsRef<Path>>(path: P) -> Result<String> {
    let bytes = fs::read(path.as_ref())?;
    if bytes.starts_with(&GZIP_MAGIC) {
        let mut text = String::new();
        GzDecoder::new(bytes.as_slice()).read_to_string(&mut text)?;
        return Ok(text);
    }
    String::from_utf8(bytes).map_err(|_| {
        PhyloError::MalformedInput(format!("{} is not valid UTF-8 text", path.as_ref().display()))
    })
}

/// Remove `[...]` comments, including BEAST-style `[&rate=0.1]` annotations.
pub fn strip_newick_comments(newick: &str) -> String {
    let mut result = String::with_capacity(newick.len());
    let mut depth = 0usize;
    let mut in_quote = false;
    for ch in newick.chars() {
        match ch {
            '\'' if depth == 0 => {
                in_quote = !in_quote;
                result.push(ch);
            }
            '[' if !in_quote => depth += 1,
            ']' if !in_quote && depth > 0 => depth -= 1,
            _ if depth == 0 => result.push(ch),
            _ => {}
        }
    }
    result
}

struct TreeBlock<'a> {
    header: &'a str,
    body: String,
}

/// `TREE name = (...);` lines of a NEXUS TREES block.
fn collect_tree_blocks(content: &str) -> Vec<TreeBlock<'_>> {
    content
        .lines()
        .skip_while(|line| !line.trim().to_ascii_uppercase().starts_with("TREE "))
        .take_while(|line| !line.trim().to_ascii_uppercase().starts_with("END;"))
        .filter_map(|line| {
            let (header, body) = line.split_once('=')?;
            Some(TreeBlock { header: header.trim(), body: body.trim().to_string() })
        })
        .collect()
}

/// TRANSLATE table of a NEXUS TREES block, e.g. `1 'Homo sapiens',`.
fn parse_taxon_block(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .skip_while(|line| !line.trim().to_ascii_uppercase().starts_with("TRANSLATE"))
        .skip(1)
        .take_while(|line| !line.trim().starts_with(';'))
        .filter_map(|line| {
            let line = line.trim().trim_end_matches([',', ';']);
            let (id, label) = line.split_once(char::is_whitespace)?;
            Some((id.to_string(), label.trim().trim_matches('\'').to_string()))
        })
        .collect()
}

fn tree_name(header: &str, index: usize) -> String {
    let mut words = header.split_whitespace();
    let _keyword = words.next();
    match words.next() {
        Some(name) if !name.starts_with('*') => name.trim_matches('\'').to_string(),
        Some(_) => words.next().map(str::to_string).unwrap_or_else(|| format!("tree{}", index + 1)),
        None => format!("tree{}", index + 1),
    }
}

/// Parse every tree in `content`: a NEXUS TREES block when the text starts
/// with `#NEXUS`, otherwise `;`-terminated Newick strings that may span lines.
pub fn parse_trees(content: &str, source: &str) -> Result<Vec<(String, Tree)>> {
    let with_context = |i: usize, e: PhyloError| match e {
        PhyloError::MalformedInput(msg) => {
            PhyloError::MalformedInput(format!("{source}: tree {}: {msg}", i + 1))
        }
        other => other,
    };

    let trees = if content.trim_start().to_ascii_uppercase().starts_with("#NEXUS") {
        let translate = parse_taxon_block(content);
        collect_tree_blocks(content)
            .into_iter()
            .enumerate()
            .map(|(i, block)| {
                let mut tree = Tree::from_newick(&block.body).map_err(|e| with_context(i, e))?;
                if !translate.is_empty() {
                    tree.relabel_leaves(&translate);
                }
                Ok((tree_name(block.header, i), tree))
            })
            .collect::<Result<Vec<_>>>()?
    } else {
        let cleaned = strip_newick_comments(content);
        cleaned
            .split_inclusive(';')
            .map(str::trim)
            .filter(|s| !s.is_empty() && *s != ";")
            .enumerate()
            .map(|(i, text)| {
                let tree = Tree::from_newick(text).map_err(|e| with_context(i, e))?;
                Ok((format!("tree{}", i + 1), tree))
            })
            .collect::<Result<Vec<_>>>()?
    };
    if trees.is_empty() {
        return Err(PhyloError::MalformedInput(format!("{source}: no trees found")));
    }
    debug!("Read {} trees from {source}", trees.len());
    Ok(trees)
}

pub fn read_tree_file<P: AsRef<Path>>(path: P) -> Result<Vec<(String, Tree)>> {
    let content = read_text(path.as_ref())?;
    parse_trees(&content, &path.as_ref().display().to_string())
}

/// Open `path` for writing, gzip-compressed when the name ends in `.gz`.
pub fn create_output<P: AsRef<Path>>(path: P) -> Result<Box<dyn Write>> {
    let p = path.as_ref();
    let file = File::create(p)?;
    if p.to_string_lossy().ends_with(".gz") {
        Ok(Box::new(BufWriter::new(GzEncoder::new(file, Compression::default()))))
    } else {
        Ok(Box::new(BufWriter::new(file)))
    }
}

/// Write a labeled matrix as TSV. If `path` ends with `.gz`, the output is gzip-compressed.
pub fn write_matrix_tsv<P: AsRef<Path>, T: std::fmt::Display>(
    path: P,
    row_names: &[String],
    col_names: &[String],
    mat: &[Vec<T>],
) -> Result<()> {
    let mut out = create_output(path)?;

    for name in col_names {
        write!(out, "\t{name}")?;
    }
    writeln!(out)?;

    for (name, row) in row_names.iter().zip(mat) {
        write!(out, "{name}")?;
        for val in row {
            write!(out, "\t{val}")?;
        }
        writeln!(out)?;
    }

    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_strip_comments() {
        assert_eq!(strip_newick_comments("(A:[&rate=0.1]1,B[x]:2);"), "(A:1,B:2);");
        assert_eq!(strip_newick_comments("('a[1]':1,B:2);"), "('a[1]':1,B:2);");
    }

    #[test]
    fn test_multi_line_newick() {
        let text = "((A:1,B:1):1,\n(C:1,D:1):1);\n\n(A,(B,(C,D)));\n";
        let trees = parse_trees(text, "mem").unwrap();
        assert_eq!(trees.len(), 2);
        assert_eq!(trees[1].0, "tree2");
        assert_eq!(trees[1].1.num_leaves(), 4);
    }

    #[test]
    fn test_nexus_translate() {
        let text = "#NEXUS\nBEGIN TREES;\n  TRANSLATE\n    1 'Homo sapiens',\n    2 Pan,\n    3 Gorilla,\n    4 Pongo\n  ;\n  TREE first = [&U] ((1:1,2:1):1,(3:1,4:1):1);\n  TREE second = (1,(2,(3,4)));\nEND;\n";
        let trees = parse_trees(text, "mem").unwrap();
        assert_eq!(trees.len(), 2);
        assert_eq!(trees[0].0, "first");
        let mut labels = trees[0].1.leaf_labels();
        labels.sort();
        assert_eq!(labels, vec!["Gorilla", "Homo sapiens", "Pan", "Pongo"]);
    }

    #[test]
    fn test_empty_tree_file() {
        assert!(matches!(parse_trees("  \n", "mem"), Err(PhyloError::MalformedInput(_))));
    }

    #[test]
    fn test_gz_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.tsv.gz");
        let names = vec!["a".to_string(), "b".to_string()];
        write_matrix_tsv(&path, &names, &names, &[vec![0, 2], vec![2, 0]]).unwrap();
        let text = read_text(&path).unwrap();
        assert_eq!(text, "\ta\tb\na\t0\t2\nb\t2\t0\n");
    }
}
