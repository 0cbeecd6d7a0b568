//src/taxdb.rs

use std::fmt;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use parking_lot::RwLock;

use crate::error::{MetabarError, Result};
use crate::read_count::{column_indices, open_table};

/// Taxonomic ranks, most specific first. Ranks outside the LTG walk parse
/// as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Rank {
    Species,
    Genus,
    Family,
    Order,
    Class,
    Phylum,
    Kingdom,
    Superkingdom,
    Other,
}

impl Rank {
    /// Ranks visited by the LTG walk, from species upwards.
    pub const LTG_RANKS: [Rank; 8] = [
        Rank::Species,
        Rank::Genus,
        Rank::Family,
        Rank::Order,
        Rank::Class,
        Rank::Phylum,
        Rank::Kingdom,
        Rank::Superkingdom,
    ];

    pub fn parse(s: &str) -> Rank {
        match s.trim().to_ascii_lowercase().as_str() {
            "species" => Rank::Species,
            "genus" => Rank::Genus,
            "family" => Rank::Family,
            "order" => Rank::Order,
            "class" => Rank::Class,
            "phylum" => Rank::Phylum,
            "kingdom" => Rank::Kingdom,
            "superkingdom" | "domain" => Rank::Superkingdom,
            _ => Rank::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Rank::Species => "species",
            Rank::Genus => "genus",
            Rank::Family => "family",
            Rank::Order => "order",
            Rank::Class => "class",
            Rank::Phylum => "phylum",
            Rank::Kingdom => "kingdom",
            Rank::Superkingdom => "superkingdom",
            Rank::Other => "no rank",
        }
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxonomyNode {
    pub tax_id: u32,
    pub parent_tax_id: u32,
    pub rank: Rank,
    pub scientific_name: String,
}

/// Ancestors of a taxon, the taxon itself first and the root last.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lineage {
    pub steps: Vec<(Rank, u32)>,
}

impl Lineage {
    /// The ancestor sitting at `rank`, if the lineage has one.
    pub fn at(&self, rank: Rank) -> Option<u32> {
        self.steps.iter().find(|(r, _)| *r == rank).map(|&(_, id)| id)
    }
}

/// NCBI-style taxonomy: an arena of nodes indexed by tax id, the table of
/// merged (old -> current) ids, and a lineage cache shared across threads.
#[derive(Debug, Default)]
pub struct Taxonomy {
    nodes: Vec<TaxonomyNode>,
    index: AHashMap<u32, usize>,
    merged: AHashMap<u32, u32>,
    lineages: RwLock<AHashMap<u32, Arc<Lineage>>>,
}

impl Taxonomy {
    pub fn new(nodes: Vec<TaxonomyNode>, merged: AHashMap<u32, u32>) -> Self {
        let mut index = AHashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            index.entry(node.tax_id).or_insert(i);
        }
        Self { nodes, index, merged, lineages: RwLock::new(AHashMap::new()) }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, tax_id: u32) -> Option<&TaxonomyNode> {
        self.index.get(&tax_id).map(|&i| &self.nodes[i])
    }

    /// Current id for `tax_id`, following the merge table for retired ids.
    pub fn resolve(&self, tax_id: u32) -> Option<u32> {
        if self.index.contains_key(&tax_id) {
            return Some(tax_id);
        }
        self.merged
            .get(&tax_id)
            .copied()
            .filter(|id| self.index.contains_key(id))
    }

    pub fn scientific_name(&self, tax_id: u32) -> Option<&str> {
        self.node(tax_id).map(|n| n.scientific_name.as_str())
    }

    /// Lineage of `tax_id` (resolved through the merge table), memoised.
    pub fn lineage(&self, tax_id: u32) -> Option<Arc<Lineage>> {
        let tax_id = self.resolve(tax_id)?;
        if let Some(hit) = self.lineages.read().get(&tax_id) {
            return Some(Arc::clone(hit));
        }
        let lineage = Arc::new(self.walk(tax_id));
        self.lineages
            .write()
            .entry(tax_id)
            .or_insert_with(|| Arc::clone(&lineage));
        Some(lineage)
    }

    // Climb parent pointers until the root (parent == self), a missing
    // parent, or more steps than there are nodes (a cycle).
    fn walk(&self, tax_id: u32) -> Lineage {
        let mut steps = Vec::with_capacity(32);
        let mut current = tax_id;
        while let Some(node) = self.node(current) {
            steps.push((node.rank, current));
            if node.parent_tax_id == current || steps.len() > self.nodes.len() {
                break;
            }
            current = node.parent_tax_id;
        }
        Lineage { steps }
    }

    /// Loads a taxonomy TSV with columns `tax_id parent_tax_id rank name_txt`
    /// and an optional `old_tax_id`. A tax id may appear on several lines,
    /// once per retired id merged into it.
    pub fn from_tsv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let name = path.as_ref().display().to_string();
        let taxonomy = Self::from_reader(open_table(path)?, &name)?;
        log::info!(
            "Loaded taxonomy from {}: {} nodes, {} merged ids",
            name,
            taxonomy.nodes.len(),
            taxonomy.merged.len()
        );
        Ok(taxonomy)
    }

    pub fn from_reader<R: BufRead>(reader: R, source_name: &str) -> Result<Self> {
        let mut lines = reader.lines();
        let header = match lines.next() {
            Some(h) => h?,
            None => return Ok(Self::default()),
        };
        let idx = column_indices(
            &header,
            &["tax_id", "parent_tax_id", "rank", "name_txt"],
            source_name,
        )?;
        let old_idx = header.split('\t').map(str::trim).position(|c| c == "old_tax_id");

        let mut nodes = Vec::new();
        let mut seen: AHashSet<u32> = AHashSet::new();
        let mut merged = AHashMap::new();
        for (i, line) in lines.enumerate() {
            let line = line?;
            let line_no = i + 2;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            let field = |j: usize| {
                fields
                    .get(j)
                    .map(|s| s.trim())
                    .ok_or_else(|| MetabarError::malformed(source_name, line_no, "too few columns"))
            };
            let parse_id = |s: &str| {
                s.parse::<u32>()
                    .map_err(|_| MetabarError::malformed(source_name, line_no, format!("bad tax id '{s}'")))
            };

            let tax_id = parse_id(field(idx[0])?)?;
            if seen.insert(tax_id) {
                nodes.push(TaxonomyNode {
                    tax_id,
                    parent_tax_id: parse_id(field(idx[1])?)?,
                    rank: Rank::parse(field(idx[2])?),
                    scientific_name: field(idx[3])?.to_string(),
                });
            }
            if let Some(j) = old_idx {
                let old = fields.get(j).map(|s| s.trim()).unwrap_or_default();
                if !old.is_empty() && old != "NA" {
                    merged.insert(parse_id(old.trim_end_matches(".0"))?, tax_id);
                }
            }
        }
        Ok(Self::new(nodes, merged))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const TAXONOMY_TSV: &str = "\
tax_id\tparent_tax_id\trank\tname_txt\told_tax_id
1\t1\tno rank\troot\t
2759\t1\tsuperkingdom\tEukaryota\t
33208\t2759\tkingdom\tMetazoa\t
6656\t33208\tphylum\tArthropoda\t
50557\t6656\tclass\tInsecta\t
7041\t50557\torder\tColeoptera\t
41071\t7041\tfamily\tCarabidae\t
41072\t41071\tgenus\tCarabus\t
41073\t41072\tspecies\tCarabus auratus\t
41074\t41072\tspecies\tCarabus nemoralis\t
41074\t41072\tspecies\tCarabus nemoralis\t999
41075\t41072\tspecies\tCarabus granulatus\t
41080\t41071\tgenus\tPterostichus\t
41081\t41080\tspecies\tPterostichus niger\t
";

    pub(crate) fn taxonomy() -> Taxonomy {
        Taxonomy::from_reader(TAXONOMY_TSV.as_bytes(), "taxonomy.tsv").unwrap()
    }

    #[test]
    fn test_parse_and_merge() {
        let tax = taxonomy();
        assert_eq!(tax.len(), 13);
        assert_eq!(tax.resolve(41074), Some(41074));
        assert_eq!(tax.resolve(999), Some(41074));
        assert_eq!(tax.resolve(12345), None);
        assert_eq!(tax.scientific_name(41072), Some("Carabus"));
        assert_eq!(tax.node(41072).map(|n| n.rank), Some(Rank::Genus));
    }

    #[test]
    fn test_lineage_walk_and_memo() {
        let tax = taxonomy();
        let lineage = tax.lineage(41073).unwrap();
        assert_eq!(lineage.steps.first(), Some(&(Rank::Species, 41073)));
        assert_eq!(lineage.steps.last(), Some(&(Rank::Other, 1)));
        assert_eq!(lineage.at(Rank::Genus), Some(41072));
        assert_eq!(lineage.at(Rank::Superkingdom), Some(2759));
        assert!(Arc::ptr_eq(&lineage, &tax.lineage(41073).unwrap()));
        assert_eq!(tax.lineage(999).unwrap().at(Rank::Species), Some(41074));
    }

    #[test]
    fn test_cycle_terminates() {
        let nodes = vec![
            TaxonomyNode { tax_id: 5, parent_tax_id: 6, rank: Rank::Genus, scientific_name: "a".into() },
            TaxonomyNode { tax_id: 6, parent_tax_id: 5, rank: Rank::Family, scientific_name: "b".into() },
        ];
        let tax = Taxonomy::new(nodes, AHashMap::new());
        let lineage = tax.lineage(5).unwrap();
        assert!(lineage.steps.len() <= 3);
    }

    #[test]
    fn test_rank_parse() {
        assert_eq!(Rank::parse("Species"), Rank::Species);
        assert_eq!(Rank::parse("domain"), Rank::Superkingdom);
        assert_eq!(Rank::parse("subfamily"), Rank::Other);
        assert_eq!(Rank::Family.to_string(), "family");
    }
}
