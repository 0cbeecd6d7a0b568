//src/pcr_error.rs

use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::Path;

use ahash::{AHashMap, AHashSet};
use rayon::prelude::*;

use crate::error::{MetabarError, Result};
use crate::oracle::{AlignmentOracle, OracleRecord, ParentHit};
use crate::read_count::{column_indices, open_table};
use crate::types::{BiosampleKey, ReadCountRow, RunMarker};
use crate::variants::VariantStore;

pub const PCR_ERROR: &str = "pcr_error";

/// A variant that looks like a point-mutation copy of a more abundant
/// parent in one biosample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PcrErrorCandidate {
    pub biosample: BiosampleKey,
    pub variant_id: u32,
    pub parent_id: u32,
    /// Reads of the variant divided by reads of the parent, both summed
    /// over the replicates of the biosample.
    pub ratio: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PcrErrorOutput {
    pub delete: Vec<bool>,
    pub candidates: Vec<PcrErrorCandidate>,
    pub failed_groups: Vec<(RunMarker, String)>,
}

type Abundances = AHashMap<BiosampleKey, AHashMap<u32, u64>>;

fn biosample_abundances(rows: &[ReadCountRow]) -> Abundances {
    let mut out: Abundances = AHashMap::new();
    for row in rows {
        *out.entry(row.biosample_key())
            .or_default()
            .entry(row.variant_id)
            .or_insert(0) += row.read_count;
    }
    out
}

fn records_for(
    ids: impl IntoIterator<Item = u32>,
    variants: &VariantStore,
) -> Result<Vec<OracleRecord>> {
    ids.into_iter()
        .map(|id| {
            Ok(OracleRecord {
                id,
                sequence: variants.sequence(id)?.to_string(),
                abundance: 0,
            })
        })
        .collect()
}

/// variant -> candidate parents within `max_edits`.
fn parent_map(hits: Vec<ParentHit>, max_edits: u32) -> AHashMap<u32, Vec<u32>> {
    let mut parents: AHashMap<u32, Vec<u32>> = AHashMap::new();
    for hit in hits {
        if hit.query_id != hit.target_id && hit.edits() <= max_edits {
            parents.entry(hit.query_id).or_default().push(hit.target_id);
        }
    }
    parents
}

/// Error/parent ratios of one biosample. A parent must be strictly more
/// abundant than the variant in that biosample.
fn biosample_candidates(
    biosample: BiosampleKey,
    counts: &AHashMap<u32, u64>,
    parents: &AHashMap<u32, Vec<u32>>,
    parent_allowed: impl Fn(u32) -> bool,
    variant_allowed: impl Fn(u32) -> bool,
) -> Vec<PcrErrorCandidate> {
    let mut out = Vec::new();
    let mut ids: Vec<u32> = counts.keys().copied().collect();
    ids.sort_unstable();
    for variant_id in ids {
        if !variant_allowed(variant_id) {
            continue;
        }
        let n_variant = counts.get(&variant_id).copied().unwrap_or(0);
        let Some(candidates) = parents.get(&variant_id) else { continue };
        for &parent_id in candidates {
            let n_parent = counts.get(&parent_id).copied().unwrap_or(0);
            if n_parent > n_variant && parent_allowed(parent_id) {
                out.push(PcrErrorCandidate {
                    biosample,
                    variant_id,
                    parent_id,
                    ratio: n_variant as f64 / n_parent as f64,
                });
            }
        }
    }
    out
}

fn by_run_marker(abundances: &Abundances) -> BTreeMap<RunMarker, Vec<BiosampleKey>> {
    let mut out: BTreeMap<RunMarker, Vec<BiosampleKey>> = BTreeMap::new();
    for key in abundances.keys() {
        out.entry(RunMarker { run_id: key.run_id, marker_id: key.marker_id })
            .or_default()
            .push(*key);
    }
    for keys in out.values_mut() {
        keys.sort_unstable();
    }
    out
}

/// Calibrates the PCR-error cutoff on positive-control biosamples.
///
/// `expected` lists, for each control biosample, the variants known to be
/// present. Every other variant of that biosample with an expected parent
/// is a PCR error by construction; the largest such error/parent ratio is
/// returned (0.0 when no error is observed).
pub fn optimize_pcr_error<O: AlignmentOracle + ?Sized>(
    rows: &[ReadCountRow],
    variants: &VariantStore,
    expected: &AHashMap<BiosampleKey, AHashSet<u32>>,
    max_edits: u32,
    oracle: &O,
) -> Result<f64> {
    let control_rows: Vec<ReadCountRow> = rows
        .iter()
        .filter(|r| expected.contains_key(&r.biosample_key()))
        .copied()
        .collect();
    let abundances = biosample_abundances(&control_rows);

    let mut max_ratio: f64 = 0.0;
    for (run_marker, biosamples) in by_run_marker(&abundances) {
        let mut observed = AHashSet::new();
        let mut expected_ids = AHashSet::new();
        for key in &biosamples {
            if let Some(counts) = abundances.get(key) {
                observed.extend(counts.keys().copied());
            }
            if let Some(ids) = expected.get(key) {
                expected_ids.extend(ids.iter().copied());
            }
        }
        let mut queries: Vec<u32> = observed.into_iter().collect();
        queries.sort_unstable();
        let mut db: Vec<u32> = expected_ids.into_iter().collect();
        db.sort_unstable();

        let hits = oracle.align(&records_for(queries, variants)?, &records_for(db, variants)?)?;
        let parents = parent_map(hits, max_edits);

        for key in biosamples {
            let (Some(counts), Some(known)) = (abundances.get(&key), expected.get(&key)) else {
                continue;
            };
            for c in biosample_candidates(key, counts, &parents, |p| known.contains(&p), |v| !known.contains(&v)) {
                log::debug!(
                    "run {} marker {} biosample {}: variant {} / parent {} = {:.6}",
                    run_marker.run_id,
                    run_marker.marker_id,
                    key.biosample_id,
                    c.variant_id,
                    c.parent_id,
                    c.ratio
                );
                max_ratio = max_ratio.max(c.ratio);
            }
        }
    }
    log::info!("optimal pcr_error_var_prop: {:.6}", max_ratio);
    Ok(max_ratio)
}

/// Deletes every row of a (biosample, variant) whose reads are at most
/// `cutoff` times those of a close, more abundant parent in that biosample.
///
/// Parents are searched once per (run, marker). If the aligner fails on that
/// search the rows of the run-marker survive and the failure is recorded;
/// cancellation and I/O errors are returned.
pub fn filter_pcr_error<O: AlignmentOracle + ?Sized>(
    rows: &[ReadCountRow],
    variants: &VariantStore,
    cutoff: f64,
    max_edits: u32,
    oracle: &O,
) -> Result<PcrErrorOutput> {
    let abundances = biosample_abundances(rows);
    let mut output = PcrErrorOutput {
        delete: vec![false; rows.len()],
        ..PcrErrorOutput::default()
    };

    let mut flagged: AHashSet<(BiosampleKey, u32)> = AHashSet::new();
    for (run_marker, biosamples) in by_run_marker(&abundances) {
        let mut ids: Vec<u32> = biosamples
            .iter()
            .filter_map(|k| abundances.get(k))
            .flat_map(|counts| counts.keys().copied())
            .collect::<AHashSet<u32>>()
            .into_iter()
            .collect();
        ids.sort_unstable();
        let records = records_for(ids, variants)?;

        let hits = match oracle.align(&records, &records) {
            Ok(h) => h,
            Err(e) if e.is_recoverable_aligner_failure() => {
                log::warn!(
                    "parent search failed for run {} marker {}: {}",
                    run_marker.run_id,
                    run_marker.marker_id,
                    e
                );
                output.failed_groups.push((run_marker, e.to_string()));
                continue;
            }
            Err(e) => return Err(e),
        };
        let parents = parent_map(hits, max_edits);

        let candidates: Vec<PcrErrorCandidate> = biosamples
            .par_iter()
            .flat_map_iter(|key| match abundances.get(key) {
                Some(counts) => biosample_candidates(*key, counts, &parents, |_| true, |_| true),
                None => Vec::new(),
            })
            .collect();
        for c in &candidates {
            if c.ratio <= cutoff {
                flagged.insert((c.biosample, c.variant_id));
            }
        }
        output.candidates.extend(candidates);
    }

    for (idx, row) in rows.iter().enumerate() {
        if flagged.contains(&(row.biosample_key(), row.variant_id)) {
            output.delete[idx] = true;
        }
    }
    Ok(output)
}

/// Expected variants per positive-control biosample, read from a TSV with
/// columns `run_id marker_id biosample_id variant_id`.
pub fn read_positive_controls<P: AsRef<Path>>(path: P) -> Result<AHashMap<BiosampleKey, AHashSet<u32>>> {
    let name = path.as_ref().display().to_string();
    parse_positive_controls(open_table(path)?, &name)
}

pub fn parse_positive_controls<R: BufRead>(
    reader: R,
    source_name: &str,
) -> Result<AHashMap<BiosampleKey, AHashSet<u32>>> {
    let mut lines = reader.lines();
    let header = match lines.next() {
        Some(h) => h?,
        None => return Ok(AHashMap::new()),
    };
    let idx = column_indices(&header, &["run_id", "marker_id", "biosample_id", "variant_id"], source_name)?;
    let mut out: AHashMap<BiosampleKey, AHashSet<u32>> = AHashMap::new();
    for (i, line) in lines.enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
        let mut ids = [0u32; 4];
        for (slot, &j) in ids.iter_mut().zip(idx.iter()) {
            let v = fields
                .get(j)
                .ok_or_else(|| MetabarError::malformed(source_name, i + 2, "too few columns"))?;
            *slot = v
                .parse()
                .map_err(|_| MetabarError::malformed(source_name, i + 2, format!("bad id '{v}'")))?;
        }
        let key = BiosampleKey { run_id: ids[0], marker_id: ids[1], biosample_id: ids[2] };
        out.entry(key).or_default().insert(ids[3]);
    }
    Ok(out)
}
