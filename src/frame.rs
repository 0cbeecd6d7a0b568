//src/frame.rs

use std::collections::BTreeSet;

use ahash::AHashSet;
use rayon::prelude::*;

use crate::error::Result;
use crate::genetic_code::GeneticCode;
use crate::types::ReadCountRow;
use crate::variants::VariantStore;

pub const INDEL: &str = "indel";
pub const CODON_STOP: &str = "codon_stop";

fn distinct_variants(rows: &[ReadCountRow]) -> Vec<u32> {
    let ids: BTreeSet<u32> = rows.iter().map(|r| r.variant_id).collect();
    ids.into_iter().collect()
}

fn expand_to_rows(rows: &[ReadCountRow], rejected: &AHashSet<u32>) -> Vec<bool> {
    rows.iter().map(|r| rejected.contains(&r.variant_id)).collect()
}

/// Most frequent `len % 3` among `lengths`; ties go to the smallest remainder.
pub fn majority_remainder(lengths: impl IntoIterator<Item = usize>) -> Option<usize> {
    let mut tally = [0usize; 3];
    let mut any = false;
    for len in lengths {
        tally[len % 3] += 1;
        any = true;
    }
    if !any {
        return None;
    }
    // max_by_key keeps the last maximum, so scan in reverse
    (0..3).rev().max_by_key(|&r| tally[r])
}

/// Deletes every row of a variant whose length modulo 3 disagrees with the
/// majority of the surviving variants.
pub fn filter_indel(rows: &[ReadCountRow], variants: &VariantStore) -> Result<Vec<bool>> {
    let ids = distinct_variants(rows);
    let mut remainders: Vec<(u32, usize)> = Vec::with_capacity(ids.len());
    for &id in &ids {
        remainders.push((id, variants.sequence(id)?.len() % 3));
    }
    let Some(majority) = majority_remainder(remainders.iter().map(|&(_, rem)| rem)) else {
        return Ok(Vec::new());
    };
    let rejected: AHashSet<u32> = remainders
        .iter()
        .filter(|&&(_, rem)| rem != majority)
        .map(|&(id, _)| id)
        .collect();
    log::debug!("indel: majority remainder {}, {} variants rejected", majority, rejected.len());
    Ok(expand_to_rows(rows, &rejected))
}

/// Stop codons in each of the three forward reading frames.
pub fn stop_codons_per_frame(sequence: &str, code: &GeneticCode) -> [usize; 3] {
    let seq = sequence.as_bytes();
    [
        code.count_stops(seq, 0),
        code.count_stops(seq, 1),
        code.count_stops(seq, 2),
    ]
}

/// A variant survives when at least one frame is free of stop codons.
pub fn has_open_frame(sequence: &str, code: &GeneticCode) -> bool {
    stop_codons_per_frame(sequence, code).iter().any(|&n| n == 0)
}

/// Deletes every row of a variant whose three reading frames all contain a
/// stop codon.
pub fn filter_codon_stop(
    rows: &[ReadCountRow],
    variants: &VariantStore,
    code: &GeneticCode,
) -> Result<Vec<bool>> {
    let ids = distinct_variants(rows);
    let sequences: Vec<(u32, &str)> = ids
        .iter()
        .map(|&id| variants.sequence(id).map(|s| (id, s)))
        .collect::<Result<_>>()?;

    let rejected: AHashSet<u32> = sequences
        .par_iter()
        .filter(|(_, seq)| !has_open_frame(seq, code))
        .map(|&(id, _)| id)
        .collect::<Vec<u32>>()
        .into_iter()
        .collect();
    log::debug!(
        "codon stop (table {}): {} of {} variants rejected",
        code.id,
        rejected.len(),
        ids.len()
    );
    Ok(expand_to_rows(rows, &rejected))
}
