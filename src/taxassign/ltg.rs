//src/taxassign/ltg.rs

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashSet;

use crate::config::Params;
use crate::taxdb::{Lineage, Rank, Taxonomy};
use crate::types::Hit;

/// The thresholds of the LTG rule, taken from [`Params`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LtgRule {
    /// Hits within this many identity points of the best hit are retained.
    pub window: f64,
    pub include_prop: f64,
    pub min_number_of_taxa: usize,
    pub min_identity: f64,
}

impl From<&Params> for LtgRule {
    fn from(p: &Params) -> Self {
        Self {
            window: p.ltg_rule_threshold,
            include_prop: p.include_prop,
            min_number_of_taxa: p.min_number_of_taxa,
            min_identity: p.min_identity,
        }
    }
}

impl Default for LtgRule {
    fn default() -> Self {
        Self::from(&Params::default())
    }
}

/// The lowest taxonomic group of one variant; `ltg_tax_id` is `None` when
/// no rank satisfies the rule.
#[derive(Debug, Clone, PartialEq)]
pub struct LtgAssignment {
    pub variant_id: u32,
    pub ltg_tax_id: Option<u32>,
    pub ltg_rank: Option<Rank>,
    pub best_identity: Option<f64>,
    /// Hits inside the identity window that reached the vote.
    pub hit_count: usize,
}

impl LtgAssignment {
    pub fn unassigned(variant_id: u32) -> Self {
        Self {
            variant_id,
            ltg_tax_id: None,
            ltg_rank: None,
            best_identity: None,
            hit_count: 0,
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.ltg_tax_id.is_some()
    }
}

/// Applies the LTG rule to the hits of one variant.
///
/// Hits whose target cannot be placed in the taxonomy, even after the merge
/// table, are dropped with a warning.
pub fn lowest_taxonomic_group(
    variant_id: u32,
    hits: &[Hit],
    taxonomy: &Taxonomy,
    rule: &LtgRule,
) -> LtgAssignment {
    let mut placed: Vec<(f64, u32, Arc<Lineage>)> = Vec::with_capacity(hits.len());
    for hit in hits.iter().filter(|h| h.identity >= rule.min_identity) {
        let resolved = taxonomy
            .resolve(hit.target_tax_id)
            .and_then(|id| taxonomy.lineage(id).map(|l| (id, l)));
        match resolved {
            Some((tax_id, lineage)) => placed.push((hit.identity, tax_id, lineage)),
            None => log::warn!(
                "variant {}: tax id {} is not in the taxonomy; hit dropped",
                variant_id,
                hit.target_tax_id
            ),
        }
    }

    let Some(best) = placed.iter().map(|(identity, _, _)| *identity).reduce(f64::max) else {
        return LtgAssignment::unassigned(variant_id);
    };
    let retained: Vec<&(f64, u32, Arc<Lineage>)> = placed
        .iter()
        .filter(|(identity, _, _)| *identity >= best - rule.window)
        .collect();
    let mut assignment = LtgAssignment {
        best_identity: Some(best),
        hit_count: retained.len(),
        ..LtgAssignment::unassigned(variant_id)
    };

    for rank in Rank::LTG_RANKS {
        // ancestor at this rank -> supporting hits
        let mut tally: BTreeMap<u32, usize> = BTreeMap::new();
        let mut taxa: AHashSet<u32> = AHashSet::new();
        for (_, tax_id, lineage) in &retained {
            if let Some(ancestor) = lineage.at(rank) {
                *tally.entry(ancestor).or_insert(0) += 1;
                taxa.insert(*tax_id);
            }
        }
        // max_by_key keeps the last maximum; reverse so ties go to the lowest id
        let Some((&ancestor, &support)) = tally.iter().rev().max_by_key(|&(_, n)| *n) else {
            continue;
        };
        let fraction = support as f64 / retained.len() as f64;
        if fraction >= rule.include_prop && taxa.len() >= rule.min_number_of_taxa {
            log::debug!(
                "variant {}: LTG {} at {} ({}/{} hits, {} taxa)",
                variant_id,
                ancestor,
                rank,
                support,
                retained.len(),
                taxa.len()
            );
            assignment.ltg_tax_id = Some(ancestor);
            assignment.ltg_rank = Some(rank);
            return assignment;
        }
    }
    assignment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxdb::tests::taxonomy;

    fn hit(target: u32, identity: f64) -> Hit {
        Hit {
            variant_id: 1,
            target_tax_id: target,
            identity,
            coverage: 100.0,
            evalue: 1e-50,
        }
    }

    #[test]
    fn test_genus_majority() {
        let tax = taxonomy();
        let hits = vec![hit(41073, 99.0), hit(41074, 98.5), hit(41075, 98.0)];
        let ltg = lowest_taxonomic_group(1, &hits, &tax, &LtgRule::default());
        assert_eq!(ltg.ltg_tax_id, Some(41072));
        assert_eq!(ltg.ltg_rank, Some(Rank::Genus));
        assert_eq!(ltg.hit_count, 3);
        assert_eq!(ltg.best_identity, Some(99.0));
    }

    #[test]
    fn test_too_few_taxa_unassigned() {
        let tax = taxonomy();
        let hits = vec![hit(41073, 99.0), hit(41073, 99.0)];
        let ltg = lowest_taxonomic_group(1, &hits, &tax, &LtgRule::default());
        assert!(!ltg.is_assigned());
        assert_eq!(ltg.ltg_rank, None);
    }

    #[test]
    fn test_species_with_single_taxon_rule() {
        let tax = taxonomy();
        let rule = LtgRule { min_number_of_taxa: 1, ..LtgRule::default() };
        let hits = vec![hit(41073, 99.0), hit(41073, 98.0)];
        let ltg = lowest_taxonomic_group(1, &hits, &tax, &rule);
        assert_eq!((ltg.ltg_tax_id, ltg.ltg_rank), (Some(41073), Some(Rank::Species)));
    }

    #[test]
    fn test_merged_and_unknown_ids() {
        let tax = taxonomy();
        // 999 was merged into 41074; 123456 is unknown and dropped
        let hits = vec![hit(41073, 99.0), hit(999, 99.0), hit(41075, 99.0), hit(123456, 99.5)];
        let ltg = lowest_taxonomic_group(1, &hits, &tax, &LtgRule::default());
        assert_eq!(ltg.ltg_tax_id, Some(41072));
        assert_eq!(ltg.hit_count, 3);
        assert_eq!(ltg.best_identity, Some(99.0));
    }

    #[test]
    fn test_no_hits_unassigned() {
        let tax = taxonomy();
        let ltg = lowest_taxonomic_group(4, &[], &tax, &LtgRule::default());
        assert_eq!(ltg, LtgAssignment::unassigned(4));
    }

    #[test]
    fn test_window_excludes_distant_hits() {
        let tax = taxonomy();
        let hits = vec![
            hit(41073, 99.0),
            hit(41074, 98.0),
            hit(41075, 97.0),
            hit(41081, 90.0), // Pterostichus, outside a 3-point window
        ];
        let ltg = lowest_taxonomic_group(1, &hits, &tax, &LtgRule::default());
        assert_eq!(ltg.ltg_rank, Some(Rank::Genus));
    }

    #[test]
    fn test_wider_window_coarsens() {
        // Holds here because the extra hit breaks the genus majority. It is
        // not general: with min_number_of_taxa 3, hits on two Carabus species
        // stay unassigned under a narrow window, and a wider window that adds
        // a third Carabus species yields genus Carabus, a finer result.
        let tax = taxonomy();
        let hits = vec![
            hit(41073, 99.0),
            hit(41074, 98.0),
            hit(41075, 97.0),
            hit(41081, 94.0),
        ];
        let narrow = lowest_taxonomic_group(1, &hits, &tax, &LtgRule { window: 3.0, ..LtgRule::default() });
        let wide = lowest_taxonomic_group(1, &hits, &tax, &LtgRule { window: 6.0, ..LtgRule::default() });
        assert_eq!(narrow.ltg_rank, Some(Rank::Genus));
        assert_eq!(wide.ltg_rank, Some(Rank::Family));
        assert_eq!(wide.ltg_tax_id, Some(41071));
        assert!(wide.ltg_rank > narrow.ltg_rank);
    }

    #[test]
    fn test_wider_window_can_reach_min_taxa() {
        let tax = taxonomy();
        let hits = vec![hit(41073, 99.0), hit(41074, 98.0), hit(41075, 95.0)];
        let narrow = lowest_taxonomic_group(1, &hits, &tax, &LtgRule { window: 3.0, ..LtgRule::default() });
        let wide = lowest_taxonomic_group(1, &hits, &tax, &LtgRule { window: 6.0, ..LtgRule::default() });
        assert!(!narrow.is_assigned());
        assert_eq!(wide.ltg_tax_id, Some(41072));
        assert_eq!(wide.ltg_rank, Some(Rank::Genus));
    }
}
