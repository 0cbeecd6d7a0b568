//src/variants.rs

use std::io::BufRead;
use std::path::Path;

use ahash::AHashMap;

use crate::error::{MetabarError, Result};
use crate::read_count::{column_indices, open_table};
use crate::types::Variant;

/// Variant sequences keyed by variant id. Sequences are stored upper-case.
#[derive(Debug, Clone, Default)]
pub struct VariantStore {
    sequences: AHashMap<u32, String>,
}

impl VariantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, variant_id: u32, sequence: &str) {
        self.sequences.insert(variant_id, sequence.trim().to_ascii_uppercase());
    }

    pub fn sequence(&self, variant_id: u32) -> Result<&str> {
        self.sequences
            .get(&variant_id)
            .map(String::as_str)
            .ok_or(MetabarError::UnknownVariant(variant_id))
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
        self.sequences.iter().map(|(&id, s)| (id, s.as_str()))
    }

    /// Loads `variant_id<TAB>sequence` TSV (with header), or FASTA when the
    /// first non-empty line starts with `>`.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let name = path.as_ref().display().to_string();
        Self::from_reader(open_table(path)?, &name)
    }

    pub fn from_reader<R: BufRead>(reader: R, source_name: &str) -> Result<Self> {
        let lines: Vec<String> = reader.lines().collect::<std::io::Result<_>>()?;
        let first = lines.iter().find(|l| !l.trim().is_empty());
        match first {
            Some(l) if l.starts_with('>') => parse_fasta(&lines, source_name),
            Some(_) => parse_tsv(&lines, source_name),
            None => Ok(Self::new()),
        }
    }
}

impl FromIterator<Variant> for VariantStore {
    fn from_iter<I: IntoIterator<Item = Variant>>(iter: I) -> Self {
        let mut store = VariantStore::new();
        for v in iter {
            store.insert(v.variant_id, &v.sequence);
        }
        store
    }
}

fn parse_tsv(lines: &[String], source_name: &str) -> Result<VariantStore> {
    let idx = column_indices(&lines[0], &["variant_id", "sequence"], source_name)?;
    let mut store = VariantStore::new();
    for (i, line) in lines.iter().enumerate().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        let (Some(id), Some(seq)) = (fields.get(idx[0]), fields.get(idx[1])) else {
            return Err(MetabarError::malformed(source_name, i + 1, "too few columns"));
        };
        let id: u32 = id
            .trim()
            .parse()
            .map_err(|_| MetabarError::malformed(source_name, i + 1, format!("bad variant id '{id}'")))?;
        store.insert(id, seq);
    }
    Ok(store)
}

fn parse_fasta(lines: &[String], source_name: &str) -> Result<VariantStore> {
    let mut store = VariantStore::new();
    let mut current: Option<(u32, String)> = None;
    for (i, line) in lines.iter().enumerate() {
        let line = line.trim();
        if let Some(header) = line.strip_prefix('>') {
            if let Some((id, seq)) = current.take() {
                store.insert(id, &seq);
            }
            // ">12;size=40" and ">12 description" both name variant 12
            let id_str = header
                .split(|c: char| c == ';' || c.is_whitespace())
                .next()
                .unwrap_or_default();
            let id: u32 = id_str.parse().map_err(|_| {
                MetabarError::malformed(source_name, i + 1, format!("bad variant id '{id_str}'"))
            })?;
            current = Some((id, String::new()));
        } else if !line.is_empty() {
            match current.as_mut() {
                Some((_, seq)) => seq.push_str(line),
                None => return Err(MetabarError::malformed(source_name, i + 1, "sequence before header")),
            }
        }
    }
    if let Some((id, seq)) = current {
        store.insert(id, &seq);
    }
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tsv_variants() {
        let tsv = "variant_id\tsequence\n1\tacgt\n2\tTTGA\n";
        let store = VariantStore::from_reader(tsv.as_bytes(), "v").unwrap();
        assert_eq!(store.sequence(1).unwrap(), "ACGT");
        assert_eq!(store.sequence(2).unwrap(), "TTGA");
        assert!(matches!(store.sequence(3), Err(MetabarError::UnknownVariant(3))));
    }

    #[test]
    fn test_fasta_variants_multiline() {
        let fasta = ">4;size=10\nACG\nTTT\n>5 extra words\nGG\n";
        let store = VariantStore::from_reader(fasta.as_bytes(), "v").unwrap();
        assert_eq!(store.sequence(4).unwrap(), "ACGTTT");
        assert_eq!(store.sequence(5).unwrap(), "GG");
    }
}
