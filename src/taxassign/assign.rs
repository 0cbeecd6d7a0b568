//src/taxassign/assign.rs

use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::Path;

use rayon::prelude::*;

use crate::error::{MetabarError, Result};
use crate::read_count::{column_indices, open_table};
use crate::taxdb::Taxonomy;
use crate::types::Hit;

use super::ltg::{lowest_taxonomic_group, LtgAssignment, LtgRule};

/// Assigns an LTG to every variant in `variant_ids`, in parallel.
///
/// Variants without hits come back unassigned; hits of variants not listed
/// are ignored. Output is ordered by variant id.
pub fn assign_taxa(
    variant_ids: &[u32],
    hits: &[Hit],
    taxonomy: &Taxonomy,
    rule: &LtgRule,
) -> Vec<LtgAssignment> {
    let mut by_variant: BTreeMap<u32, Vec<Hit>> =
        variant_ids.iter().map(|&id| (id, Vec::new())).collect();
    for hit in hits {
        if let Some(list) = by_variant.get_mut(&hit.variant_id) {
            list.push(hit.clone());
        }
    }
    let work: Vec<(u32, Vec<Hit>)> = by_variant.into_iter().collect();

    let assignments: Vec<LtgAssignment> = work
        .par_iter()
        .map(|(variant_id, hits)| lowest_taxonomic_group(*variant_id, hits, taxonomy, rule))
        .collect();

    let assigned = assignments.iter().filter(|a| a.is_assigned()).count();
    log::info!("LTG assigned for {} of {} variants", assigned, assignments.len());
    assignments
}

/// Reads a hit table with columns `variant_id target_tax_id identity` and
/// optional `coverage`, `evalue` columns.
pub fn read_hits_tsv<P: AsRef<Path>>(path: P) -> Result<Vec<Hit>> {
    let name = path.as_ref().display().to_string();
    parse_hits(open_table(path)?, &name)
}

pub fn parse_hits<R: BufRead>(reader: R, source_name: &str) -> Result<Vec<Hit>> {
    let mut lines = reader.lines();
    let header = match lines.next() {
        Some(h) => h?,
        None => return Ok(Vec::new()),
    };
    let idx = column_indices(&header, &["variant_id", "target_tax_id", "identity"], source_name)?;
    let columns: Vec<&str> = header.split('\t').map(str::trim).collect();
    let coverage_idx = columns.iter().position(|c| *c == "coverage");
    let evalue_idx = columns.iter().position(|c| *c == "evalue");

    let mut hits = Vec::new();
    for (i, line) in lines.enumerate() {
        let line = line?;
        let line_no = i + 2;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
        let get = |j: usize, what: &str| {
            fields
                .get(j)
                .copied()
                .ok_or_else(|| MetabarError::malformed(source_name, line_no, format!("missing {what}")))
        };
        let bad = |what: &str, v: &str| MetabarError::malformed(source_name, line_no, format!("bad {what} '{v}'"));
        let optional = |j: Option<usize>, what: &str| -> Result<f64> {
            match j.and_then(|j| fields.get(j)) {
                Some(v) if !v.is_empty() => v.parse().map_err(|_| bad(what, v)),
                _ => Ok(0.0),
            }
        };

        let variant = get(idx[0], "variant_id")?;
        let target = get(idx[1], "target_tax_id")?;
        let identity = get(idx[2], "identity")?;
        hits.push(Hit {
            variant_id: variant.parse().map_err(|_| bad("variant_id", variant))?,
            // tax ids exported through floating point columns carry a ".0"
            target_tax_id: target
                .trim_end_matches(".0")
                .parse()
                .map_err(|_| bad("target_tax_id", target))?,
            identity: identity.parse().map_err(|_| bad("identity", identity))?,
            coverage: optional(coverage_idx, "coverage")?,
            evalue: optional(evalue_idx, "evalue")?,
        });
    }
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxdb::tests::taxonomy;
    use crate::taxdb::Rank;

    #[test]
    fn test_parse_hits() {
        let tsv = "variant_id\ttarget_id\tidentity\tevalue\tcoverage\ttarget_tax_id\n\
                   7\tAB1\t99.5\t1e-80\t100\t41073.0\n\
                   7\tAB2\t98\t1e-70\t95\t41074\n";
        let hits = parse_hits(tsv.as_bytes(), "blast.tsv").unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].target_tax_id, 41073);
        assert_eq!(hits[1].coverage, 95.0);
        assert!(parse_hits("variant_id\tidentity\n1\t99\n".as_bytes(), "x").is_err());
    }

    #[test]
    fn test_assign_taxa_ordered_with_unassigned() {
        let tax = taxonomy();
        let mk = |variant_id, target_tax_id, identity| Hit {
            variant_id,
            target_tax_id,
            identity,
            coverage: 100.0,
            evalue: 0.0,
        };
        let hits = vec![
            mk(2, 41073, 99.0),
            mk(2, 41074, 99.0),
            mk(2, 41075, 99.0),
            mk(3, 41081, 99.0),
            mk(8, 41081, 99.0),
        ];
        let out = assign_taxa(&[3, 2, 5], &hits, &tax, &LtgRule::default());
        let ids: Vec<u32> = out.iter().map(|a| a.variant_id).collect();
        assert_eq!(ids, vec![2, 3, 5]);
        assert_eq!(out[0].ltg_rank, Some(Rank::Genus));
        assert!(!out[1].is_assigned());
        assert_eq!(out[2], LtgAssignment::unassigned(5));
    }
}
