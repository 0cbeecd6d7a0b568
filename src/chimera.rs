//src/chimera.rs

use std::collections::BTreeMap;

use ahash::AHashMap;
use rayon::prelude::*;

use crate::error::Result;
use crate::oracle::{ChimeraOracle, OracleRecord};
use crate::types::{ReadCountRow, ReplicateKey};
use crate::variants::VariantStore;

pub const CHIMERA: &str = "chimera";

/// A variant the classifier could not call either way in one replicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Borderline {
    pub replicate: ReplicateKey,
    pub variant_id: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ChimeraOutput {
    pub delete: Vec<bool>,
    pub borderline: Vec<Borderline>,
    /// Groups whose classification failed; their rows were left in place.
    pub failed_groups: Vec<(ReplicateKey, String)>,
}

enum GroupVerdict {
    Classified { deleted: Vec<usize>, borderline: Vec<Borderline> },
    Failed(String),
}

/// Builds the oracle input for one replicate: one record per distinct
/// sequence, abundance summed over the variants sharing it, most abundant
/// first. Returns the records and, per record id, the row indices it covers.
fn group_records(
    rows: &[ReadCountRow],
    indices: &[usize],
    variants: &VariantStore,
) -> Result<(Vec<OracleRecord>, AHashMap<u32, Vec<usize>>)> {
    let mut by_sequence: BTreeMap<&str, (u32, u64, Vec<usize>)> = BTreeMap::new();
    for &idx in indices {
        let row = &rows[idx];
        let seq = variants.sequence(row.variant_id)?;
        let entry = by_sequence.entry(seq).or_insert((row.variant_id, 0, Vec::new()));
        entry.0 = entry.0.min(row.variant_id);
        entry.1 += row.read_count;
        entry.2.push(idx);
    }

    let mut records = Vec::with_capacity(by_sequence.len());
    let mut members = AHashMap::with_capacity(by_sequence.len());
    for (seq, (id, abundance, idx)) in by_sequence {
        records.push(OracleRecord { id, sequence: seq.to_string(), abundance });
        members.insert(id, idx);
    }
    records.sort_by(|a, b| b.abundance.cmp(&a.abundance).then(a.id.cmp(&b.id)));
    Ok((records, members))
}

fn classify_group<O: ChimeraOracle + ?Sized>(
    key: ReplicateKey,
    indices: &[usize],
    rows: &[ReadCountRow],
    variants: &VariantStore,
    oracle: &O,
) -> Result<GroupVerdict> {
    let (records, members) = group_records(rows, indices, variants)?;
    let classes = match oracle.classify(&records) {
        Ok(c) => c,
        Err(e) if e.is_recoverable_aligner_failure() => return Ok(GroupVerdict::Failed(e.to_string())),
        Err(e) => return Err(e),
    };

    let mut deleted = Vec::new();
    let mut borderline = Vec::new();
    for (id, idx) in &members {
        if classes.chimera.contains(id) {
            deleted.extend(idx.iter().copied());
        } else if classes.borderline.contains(id) {
            borderline.extend(idx.iter().map(|&i| Borderline {
                replicate: key,
                variant_id: rows[i].variant_id,
            }));
        }
    }
    Ok(GroupVerdict::Classified { deleted, borderline })
}

/// Marks rows whose variant the oracle calls chimeric within that row's
/// (run, marker, biosample, replicate) group.
///
/// A failing aligner call only affects its own group: the failure is logged,
/// recorded in `failed_groups`, and the group's rows survive. Cancellation
/// and I/O errors abort the whole filter.
pub fn filter_chimera<O: ChimeraOracle + ?Sized>(
    rows: &[ReadCountRow],
    variants: &VariantStore,
    oracle: &O,
) -> Result<ChimeraOutput> {
    let mut groups: BTreeMap<ReplicateKey, Vec<usize>> = BTreeMap::new();
    for (idx, row) in rows.iter().enumerate() {
        groups.entry(row.replicate_key()).or_default().push(idx);
    }
    let groups: Vec<_> = groups.into_iter().collect();

    let verdicts: Vec<(ReplicateKey, GroupVerdict)> = groups
        .par_iter()
        .map(|(key, indices)| {
            classify_group(*key, indices, rows, variants, oracle).map(|v| (*key, v))
        })
        .collect::<Result<_>>()?;

    let mut output = ChimeraOutput {
        delete: vec![false; rows.len()],
        ..ChimeraOutput::default()
    };
    for (key, verdict) in verdicts {
        match verdict {
            GroupVerdict::Classified { deleted, borderline } => {
                for idx in deleted {
                    output.delete[idx] = true;
                }
                output.borderline.extend(borderline);
            }
            GroupVerdict::Failed(message) => {
                log::warn!(
                    "chimera detection failed for run {} marker {} biosample {} replicate {}: {}",
                    key.run_id,
                    key.marker_id,
                    key.biosample_id,
                    key.replicate_id,
                    message
                );
                output.failed_groups.push((key, message));
            }
        }
    }
    output.borderline.sort();
    Ok(output)
}
