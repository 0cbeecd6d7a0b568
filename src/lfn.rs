//src/lfn.rs

//! Low-frequency-noise filters.
//!
//! Every ratio filter follows the same pattern: group the rows by a key,
//! sum `read_count` per group, and delete a row when its share of the group
//! total is strictly below the threshold. A row exactly at the threshold
//! survives. A zero group total deletes the row unless the threshold is 0,
//! so a zero threshold disables the filter entirely.

use std::hash::Hash;

use ahash::{AHashMap, AHashSet};

use crate::config::{CutoffTable, Params};
use crate::error::{MetabarError, Result};
use crate::read_count::ReadCountTable;
use crate::types::{BiosampleKey, ReadCountRow, ReplicateKey};

pub const LFN_BIOSAMPLE_REPLICATE: &str = "lfn_biosample_replicate";
pub const LFN_VARIANT: &str = "lfn_variant";
pub const LFN_VARIANT_SPECIFIC: &str = "lfn_variant_specific";
pub const LFN_VARIANT_REPLICATE: &str = "lfn_variant_replicate";
pub const LFN_VARIANT_REPLICATE_SPECIFIC: &str = "lfn_variant_replicate_specific";
pub const LFN_REPLICATE_SERIES: &str = "lfn_replicate_series";
pub const LFN_READ_COUNT: &str = "lfn_read_count";
pub const MIN_REPLICATE_NUMBER: &str = "min_replicate_number";
pub const MIN_REPLICATE_PROPORTION: &str = "min_replicate_proportion";

/// `count / total < threshold`, with an undefined ratio counting as below
/// any positive threshold.
#[inline]
pub fn below_threshold(count: u64, total: u64, threshold: f64) -> bool {
    if total == 0 {
        threshold > 0.0
    } else {
        (count as f64 / total as f64) < threshold
    }
}

/// Shared group-sum-divide-compare kernel.
fn ratio_filter<K, KF, TF>(rows: &[ReadCountRow], key: KF, threshold: TF) -> Vec<bool>
where
    K: Hash + Eq,
    KF: Fn(&ReadCountRow) -> K,
    TF: Fn(&ReadCountRow) -> f64,
{
    let mut totals: AHashMap<K, u64> = AHashMap::new();
    for row in rows {
        *totals.entry(key(row)).or_insert(0) += row.read_count;
    }
    rows.iter()
        .map(|row| {
            let total = totals.get(&key(row)).copied().unwrap_or(0);
            below_threshold(row.read_count, total, threshold(row))
        })
        .collect()
}

/// N_ijk / N_jk: share of the variant among all reads of its biosample-replicate.
pub fn filter_biosample_replicate(rows: &[ReadCountRow], threshold: f64) -> Vec<bool> {
    ratio_filter(rows, |r| r.replicate_key(), |_| threshold)
}

/// N_ijk / N_i: share of the row among all reads of the variant in the run
/// and marker. `cutoffs` overrides the threshold for listed variants.
pub fn filter_variant(
    rows: &[ReadCountRow],
    threshold: f64,
    cutoffs: Option<&AHashMap<u32, f64>>,
) -> Vec<bool> {
    ratio_filter(
        rows,
        |r| (r.run_marker(), r.variant_id),
        |r| {
            cutoffs
                .and_then(|c| c.get(&r.variant_id))
                .copied()
                .unwrap_or(threshold)
        },
    )
}

/// N_ijk / N_ik: share of the row among the reads of the variant in the same
/// replicate across all biosamples. `cutoffs` is keyed by (variant, replicate).
pub fn filter_variant_replicate(
    rows: &[ReadCountRow],
    threshold: f64,
    cutoffs: Option<&AHashMap<(u32, u32), f64>>,
) -> Vec<bool> {
    ratio_filter(
        rows,
        |r| (r.run_marker(), r.variant_id, r.replicate_id),
        |r| {
            cutoffs
                .and_then(|c| c.get(&(r.variant_id, r.replicate_id)))
                .copied()
                .unwrap_or(threshold)
        },
    )
}

/// N_ijk / N_ij: share of the row among the reads of the variant across the
/// replicates of its biosample.
pub fn filter_replicate_series(rows: &[ReadCountRow], threshold: f64) -> Vec<bool> {
    ratio_filter(rows, |r| (r.biosample_key(), r.variant_id), |_| threshold)
}

/// Absolute read-count floor.
pub fn filter_read_count(rows: &[ReadCountRow], threshold: u64) -> Vec<bool> {
    rows.iter().map(|r| r.read_count < threshold).collect()
}

/// Per (biosample, variant): how many replicates observe the variant, and
/// how many replicates the biosample has among `rows`.
fn replicate_occupancy(
    rows: &[ReadCountRow],
) -> (AHashMap<(BiosampleKey, u32), usize>, AHashMap<BiosampleKey, usize>) {
    let mut observed: AHashMap<(BiosampleKey, u32), usize> = AHashMap::new();
    let mut replicates: AHashSet<ReplicateKey> = AHashSet::new();
    for r in rows {
        if r.read_count > 0 {
            *observed.entry((r.biosample_key(), r.variant_id)).or_insert(0) += 1;
        }
        replicates.insert(r.replicate_key());
    }
    let mut per_biosample: AHashMap<BiosampleKey, usize> = AHashMap::new();
    for rk in replicates {
        let bk = BiosampleKey {
            run_id: rk.run_id,
            marker_id: rk.marker_id,
            biosample_id: rk.biosample_id,
        };
        *per_biosample.entry(bk).or_insert(0) += 1;
    }
    (observed, per_biosample)
}

/// Deletes a variant from a biosample seen in fewer than `min_replicates`
/// replicates.
pub fn filter_min_replicate_number(rows: &[ReadCountRow], min_replicates: usize) -> Vec<bool> {
    let (observed, _) = replicate_occupancy(rows);
    rows.iter()
        .map(|r| {
            let n = observed.get(&(r.biosample_key(), r.variant_id)).copied().unwrap_or(0);
            n < min_replicates
        })
        .collect()
}

/// Deletes a variant from a biosample seen in less than `proportion` of the
/// biosample's replicates.
pub fn filter_min_replicate_proportion(rows: &[ReadCountRow], proportion: f64) -> Vec<bool> {
    let (observed, per_biosample) = replicate_occupancy(rows);
    rows.iter()
        .map(|r| {
            let bk = r.biosample_key();
            let n = observed.get(&(bk, r.variant_id)).copied().unwrap_or(0) as u64;
            let total = per_biosample.get(&bk).copied().unwrap_or(0) as u64;
            below_threshold(n, total, proportion)
        })
        .collect()
}

/// The ordered sequence of LFN stages selected by the parameters.
pub struct LfnFilterChain<'a> {
    params: &'a Params,
    cutoffs: Option<&'a CutoffTable>,
}

impl<'a> LfnFilterChain<'a> {
    pub fn new(params: &'a Params, cutoffs: Option<&'a CutoffTable>) -> Self {
        Self { params, cutoffs: cutoffs.filter(|c| !c.is_empty()) }
    }

    /// Names of the stages this chain will append, in order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        let p = self.params;
        let mut names = vec![LFN_BIOSAMPLE_REPLICATE];
        let specific_variant = self.cutoffs.map(|c| !c.variant.is_empty()).unwrap_or(false);
        let specific_replicate = self
            .cutoffs
            .map(|c| !c.variant_replicate.is_empty())
            .unwrap_or(false);
        if p.lfn_variant_replicate_threshold.is_some() || specific_replicate {
            names.push(if specific_replicate {
                LFN_VARIANT_REPLICATE_SPECIFIC
            } else {
                LFN_VARIANT_REPLICATE
            });
        } else {
            names.push(if specific_variant { LFN_VARIANT_SPECIFIC } else { LFN_VARIANT });
        }
        if p.lfn_replicate_series_threshold.is_some() {
            names.push(LFN_REPLICATE_SERIES);
        }
        names.push(LFN_READ_COUNT);
        names.push(MIN_REPLICATE_NUMBER);
        if p.min_replicate_proportion.is_some() {
            names.push(MIN_REPLICATE_PROPORTION);
        }
        names
    }

    /// Appends one column per stage. Each stage sees only the rows left by
    /// the stage before it.
    pub fn run(&self, table: &mut ReadCountTable) -> Result<()> {
        let p = self.params;
        for name in self.stage_names() {
            match name {
                LFN_BIOSAMPLE_REPLICATE => table.run_stage(name, |rows| {
                    Ok(filter_biosample_replicate(rows, p.lfn_biosample_replicate_threshold))
                })?,
                LFN_VARIANT | LFN_VARIANT_SPECIFIC => table.run_stage(name, |rows| {
                    Ok(filter_variant(rows, p.lfn_variant_threshold, self.cutoffs.map(|c| &c.variant)))
                })?,
                LFN_VARIANT_REPLICATE | LFN_VARIANT_REPLICATE_SPECIFIC => {
                    let threshold = p
                        .lfn_variant_replicate_threshold
                        .unwrap_or(p.lfn_variant_threshold);
                    table.run_stage(name, |rows| {
                        Ok(filter_variant_replicate(
                            rows,
                            threshold,
                            self.cutoffs.map(|c| &c.variant_replicate),
                        ))
                    })?
                }
                LFN_REPLICATE_SERIES => {
                    let threshold = p.lfn_replicate_series_threshold.unwrap_or(0.0);
                    table.run_stage(name, |rows| Ok(filter_replicate_series(rows, threshold)))?
                }
                LFN_READ_COUNT => table.run_stage(name, |rows| {
                    Ok(filter_read_count(rows, p.lfn_read_count_threshold))
                })?,
                MIN_REPLICATE_NUMBER => table.run_stage(name, |rows| {
                    Ok(filter_min_replicate_number(rows, p.min_replicate_number))
                })?,
                MIN_REPLICATE_PROPORTION => {
                    let proportion = p.min_replicate_proportion.unwrap_or(0.0);
                    table.run_stage(name, |rows| Ok(filter_min_replicate_proportion(rows, proportion)))?
                }
                other => {
                    return Err(MetabarError::InvalidConfig(vec![format!("unknown LFN stage {other}")]))
                }
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(biosample: u32, replicate: u32, variant: u32, count: u64) -> ReadCountRow {
        ReadCountRow::new(1, 1, biosample, replicate, variant, count)
    }

    /// Variants 1, 12 and 22 across two biosamples of three replicates.
    fn fixture() -> Vec<ReadCountRow> {
        let counts: [(u32, [u64; 6]); 3] = [
            (1, [10, 5, 0, 249, 58, 185]),
            (12, [0, 0, 2, 598, 50, 875]),
            (22, [25, 58, 23, 10980, 8999, 13814]),
        ];
        let mut rows = Vec::new();
        for (variant, c) in counts {
            for (i, &n) in c.iter().enumerate() {
                let biosample = if i < 3 { 1 } else { 2 };
                let replicate = (i % 3) as u32 + 1;
                rows.push(row(biosample, replicate, variant, n));
            }
        }
        rows
    }

    #[test]
    fn test_per_variant_example() {
        let rows = vec![row(1, 1, 1, 90), row(1, 2, 1, 5), row(1, 3, 1, 5)];
        assert_eq!(filter_variant(&rows, 0.01, None), vec![false, false, false]);
        assert_eq!(filter_variant(&rows, 0.06, None), vec![false, true, true]);
    }

    #[test]
    fn test_per_variant_fixture() {
        // variant 22 totals 33899; replicate 1 of biosample 1 is 25/33899 < 0.001
        let rows = fixture();
        let delete = filter_variant(&rows, 0.001, None);
        let v22: Vec<bool> = rows.iter().zip(&delete).filter(|(r, _)| r.variant_id == 22).map(|(_, &d)| d).collect();
        assert_eq!(v22, vec![true, false, true, false, false, false]);
    }

    #[test]
    fn test_replicate_series_fixture() {
        // variant 12 in biosample 1 totals 2, so 2/2 survives while the zeros go
        let rows = fixture();
        let delete = filter_replicate_series(&rows, 0.005);
        let v12: Vec<bool> = rows.iter().zip(&delete).filter(|(r, _)| r.variant_id == 12).map(|(_, &d)| d).collect();
        assert_eq!(v12, vec![true, true, false, false, false, false]);
    }

    #[test]
    fn test_zero_threshold_never_deletes() {
        let mut rows = fixture();
        rows.push(row(3, 1, 99, 0)); // zero denominator everywhere
        let none = vec![false; rows.len()];
        assert_eq!(filter_biosample_replicate(&rows, 0.0), none);
        assert_eq!(filter_variant(&rows, 0.0, None), none);
        assert_eq!(filter_variant_replicate(&rows, 0.0, None), none);
        assert_eq!(filter_replicate_series(&rows, 0.0), none);
        assert_eq!(filter_read_count(&rows, 0), none);
    }

    #[test]
    fn test_zero_denominator_deletes() {
        let rows = vec![row(1, 1, 5, 0), row(1, 2, 5, 0)];
        assert_eq!(filter_variant(&rows, 0.001, None), vec![true, true]);
    }

    #[test]
    fn test_boundary_is_inclusive() {
        // 10 / 100 == 0.1 exactly: survives
        let rows = vec![row(1, 1, 1, 10), row(1, 1, 2, 90)];
        assert_eq!(filter_biosample_replicate(&rows, 0.1), vec![false, false]);
        assert_eq!(filter_read_count(&rows, 10), vec![false, false]);
        assert_eq!(filter_read_count(&rows, 11), vec![true, false]);
    }

    #[test]
    fn test_variant_specific_cutoff() {
        let rows = vec![row(1, 1, 1, 90), row(1, 2, 1, 10), row(1, 1, 2, 90), row(1, 2, 2, 10)];
        let mut cutoffs = AHashMap::new();
        cutoffs.insert(2u32, 0.2);
        assert_eq!(
            filter_variant(&rows, 0.05, Some(&cutoffs)),
            vec![false, false, false, true]
        );
    }

    #[test]
    fn test_variant_replicate_specific_cutoff() {
        let rows = vec![row(1, 1, 1, 10), row(2, 1, 1, 90), row(1, 2, 1, 10), row(2, 2, 1, 90)];
        let mut cutoffs = AHashMap::new();
        cutoffs.insert((1u32, 2u32), 0.2);
        assert_eq!(
            filter_variant_replicate(&rows, 0.05, Some(&cutoffs)),
            vec![false, false, true, false]
        );
    }

    #[test]
    fn test_min_replicate_number() {
        let rows = vec![
            row(1, 1, 1, 10),
            row(1, 2, 1, 10),
            row(1, 1, 2, 10),
            row(1, 2, 2, 0),
            row(1, 3, 3, 4),
        ];
        assert_eq!(
            filter_min_replicate_number(&rows, 2),
            vec![false, false, true, true, true]
        );
    }

    #[test]
    fn test_min_replicate_proportion() {
        // biosample 1 has three replicates
        let rows = vec![row(1, 1, 1, 10), row(1, 2, 1, 10), row(1, 3, 2, 10)];
        assert_eq!(filter_min_replicate_proportion(&rows, 0.5), vec![false, false, true]);
        assert_eq!(filter_min_replicate_proportion(&rows, 1.0 / 3.0), vec![false, false, false]);
    }

    #[test]
    fn test_chain_is_sequential() {
        let params = Params {
            lfn_biosample_replicate_threshold: 0.0,
            lfn_variant_threshold: 0.0,
            lfn_read_count_threshold: 10,
            min_replicate_number: 2,
            ..Params::default()
        };
        // Variant 2 loses replicate 2 to the read-count floor, which then
        // leaves it in a single replicate.
        let rows = vec![
            row(1, 1, 1, 100),
            row(1, 2, 1, 100),
            row(1, 1, 2, 50),
            row(1, 2, 2, 5),
        ];
        let mut table = ReadCountTable::new(rows).unwrap();
        LfnFilterChain::new(&params, None).run(&mut table).unwrap();
        assert_eq!(
            table.stage(LFN_READ_COUNT).unwrap().delete,
            vec![false, false, false, true]
        );
        assert_eq!(
            table.stage(MIN_REPLICATE_NUMBER).unwrap().delete,
            vec![false, false, true, true]
        );
    }

    #[test]
    fn test_chain_stage_selection() {
        let params = Params {
            lfn_replicate_series_threshold: Some(0.01),
            min_replicate_proportion: Some(0.5),
            ..Params::default()
        };
        let mut cutoffs = CutoffTable::default();
        cutoffs.variant.insert(1, 0.1);
        let chain = LfnFilterChain::new(&params, Some(&cutoffs));
        assert_eq!(
            chain.stage_names(),
            vec![
                LFN_BIOSAMPLE_REPLICATE,
                LFN_VARIANT_SPECIFIC,
                LFN_REPLICATE_SERIES,
                LFN_READ_COUNT,
                MIN_REPLICATE_NUMBER,
                MIN_REPLICATE_PROPORTION,
            ]
        );
    }
}
