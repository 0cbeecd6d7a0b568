//src/renkonen.rs

use ahash::AHashMap;
use rayon::prelude::*;

use crate::types::{BiosampleKey, ReadCountRow, RenkonenDistance};

pub const RENKONEN: &str = "renkonen";

/// Read counts of one replicate, keyed by variant.
pub type ReplicateCounts = AHashMap<u32, u64>;

/// Renkonen dissimilarity `1 - Σ_i min(p_ij, p_ik)` between two replicates.
///
/// Variants missing from one side contribute nothing to the overlap. A
/// replicate without reads shares nothing with any other replicate.
pub fn renkonen_distance(left: &ReplicateCounts, right: &ReplicateCounts) -> f64 {
    if left.len() == right.len() && left.iter().all(|(v, n)| right.get(v) == Some(n)) {
        return 0.0;
    }
    let left_total: u64 = left.values().sum();
    let right_total: u64 = right.values().sum();
    if left_total == 0 || right_total == 0 {
        return 1.0;
    }

    // Summation in variant order keeps D(j,k) and D(k,j) bit-identical.
    let mut shared: Vec<u32> = left.keys().filter(|v| right.contains_key(v)).copied().collect();
    shared.sort_unstable();

    let overlap: f64 = shared
        .iter()
        .map(|v| {
            let p_left = left.get(v).copied().unwrap_or(0) as f64 / left_total as f64;
            let p_right = right.get(v).copied().unwrap_or(0) as f64 / right_total as f64;
            p_left.min(p_right)
        })
        .sum();
    (1.0 - overlap).clamp(0.0, 1.0)
}

/// Delete flags per input row plus every pairwise distance computed.
#[derive(Debug, Clone, Default)]
pub struct RenkonenOutput {
    pub delete: Vec<bool>,
    pub distances: Vec<RenkonenDistance>,
}

/// Rejects replicates that diverge from most of their sibling replicates.
///
/// For each biosample with R replicates, a replicate is deleted when more
/// than (R-1)/2 of its pairings have a distance above `upper_tail`. A
/// biosample with a single replicate cannot be checked and is deleted.
pub fn filter_renkonen(rows: &[ReadCountRow], upper_tail: f64) -> RenkonenOutput {
    // biosample -> replicate -> (variant -> count), plus row indices per replicate
    let mut groups: AHashMap<BiosampleKey, AHashMap<u32, (ReplicateCounts, Vec<usize>)>> =
        AHashMap::new();
    for (idx, row) in rows.iter().enumerate() {
        let (counts, indices) = groups
            .entry(row.biosample_key())
            .or_default()
            .entry(row.replicate_id)
            .or_default();
        *counts.entry(row.variant_id).or_insert(0) += row.read_count;
        indices.push(idx);
    }

    let groups: Vec<_> = groups.into_iter().collect();
    let per_group: Vec<(Vec<usize>, Vec<RenkonenDistance>)> = groups
        .par_iter()
        .map(|(biosample, replicates)| evaluate_biosample(*biosample, replicates, upper_tail))
        .collect();

    let mut output = RenkonenOutput {
        delete: vec![false; rows.len()],
        distances: Vec::new(),
    };
    for (deleted, distances) in per_group {
        for idx in deleted {
            output.delete[idx] = true;
        }
        output.distances.extend(distances);
    }
    output.distances.sort_by_key(|d| (d.biosample, d.left_replicate_id, d.right_replicate_id));
    output
}

fn evaluate_biosample(
    biosample: BiosampleKey,
    replicates: &AHashMap<u32, (ReplicateCounts, Vec<usize>)>,
    upper_tail: f64,
) -> (Vec<usize>, Vec<RenkonenDistance>) {
    let mut ids: Vec<u32> = replicates.keys().copied().collect();
    ids.sort_unstable();
    let empty = (ReplicateCounts::default(), Vec::new());
    let replicate = |id: &u32| replicates.get(id).unwrap_or(&empty);
    let r = ids.len();

    if r < 2 {
        log::debug!(
            "biosample {} (run {}, marker {}) has a single replicate; deleted",
            biosample.biosample_id,
            biosample.run_id,
            biosample.marker_id
        );
        let deleted = replicates.values().flat_map(|(_, idx)| idx.iter().copied()).collect();
        return (deleted, Vec::new());
    }

    let mut distances = Vec::with_capacity(r * (r - 1) / 2);
    let mut divergent: AHashMap<u32, usize> = AHashMap::new();
    for (i, &left) in ids.iter().enumerate() {
        for &right in &ids[i + 1..] {
            let d = renkonen_distance(&replicate(&left).0, &replicate(&right).0);
            if d > upper_tail {
                *divergent.entry(left).or_insert(0) += 1;
                *divergent.entry(right).or_insert(0) += 1;
            }
            distances.push(RenkonenDistance {
                biosample,
                left_replicate_id: left,
                right_replicate_id: right,
                distance: d,
            });
        }
    }

    let max_divergent = (r - 1) as f64 / 2.0;
    let mut deleted = Vec::new();
    for id in ids {
        let n = divergent.get(&id).copied().unwrap_or(0);
        if n as f64 > max_divergent {
            log::debug!(
                "biosample {} replicate {} diverges in {} of {} pairings; deleted",
                biosample.biosample_id,
                id,
                n,
                r - 1
            );
            deleted.extend(replicate(&id).1.iter().copied());
        }
    }
    (deleted, distances)
}
