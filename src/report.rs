//src/report.rs

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::chimera::Borderline;
use crate::error::Result;
use crate::read_count::ReadCountTable;
use crate::taxassign::LtgAssignment;
use crate::taxdb::Taxonomy;
use crate::types::{BiosampleKey, ReadCountAverage, ReadCountRow, RenkonenDistance};
use crate::variants::VariantStore;

/// Sum and mean of each (biosample, variant) over the replicates where the
/// variant was observed.
pub fn read_count_average_over_replicates(rows: &[ReadCountRow]) -> Vec<ReadCountAverage> {
    let mut acc: BTreeMap<(BiosampleKey, u32), (u64, BTreeSet<u32>)> = BTreeMap::new();
    for row in rows {
        let (sum, replicates) = acc.entry((row.biosample_key(), row.variant_id)).or_default();
        *sum += row.read_count;
        replicates.insert(row.replicate_id);
    }
    acc.into_iter()
        .map(|((biosample, variant_id), (read_count, replicates))| ReadCountAverage {
            biosample,
            variant_id,
            read_count,
            replicate_count: replicates.len(),
            read_count_average: read_count as f64 / replicates.len() as f64,
        })
        .collect()
}

/// One surviving variant of the ASV table.
#[derive(Debug, Clone, PartialEq)]
pub struct AsvRow {
    pub variant_id: u32,
    pub sequence: String,
    pub read_count: u64,
    /// Reads per biosample, aligned with [`AsvTable::biosamples`].
    pub counts: Vec<u64>,
    pub ltg: Option<LtgAssignment>,
    pub ltg_name: Option<String>,
}

/// Variants by biosamples, with optional taxonomic assignment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AsvTable {
    pub biosamples: Vec<BiosampleKey>,
    pub rows: Vec<AsvRow>,
    pub with_taxa: bool,
}

impl AsvTable {
    /// Builds the table from surviving rows. `assignments` adds the LTG
    /// columns; `taxonomy` resolves their scientific names.
    pub fn build(
        rows: &[ReadCountRow],
        variants: &VariantStore,
        assignments: Option<&[LtgAssignment]>,
        taxonomy: Option<&Taxonomy>,
    ) -> Result<Self> {
        let biosamples: Vec<BiosampleKey> = rows
            .iter()
            .map(|r| r.biosample_key())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let column: BTreeMap<BiosampleKey, usize> =
            biosamples.iter().enumerate().map(|(i, k)| (*k, i)).collect();
        let ltg: BTreeMap<u32, &LtgAssignment> = assignments
            .unwrap_or_default()
            .iter()
            .map(|a| (a.variant_id, a))
            .collect();

        let mut by_variant: BTreeMap<u32, Vec<u64>> = BTreeMap::new();
        for row in rows {
            let counts = by_variant
                .entry(row.variant_id)
                .or_insert_with(|| vec![0; biosamples.len()]);
            if let Some(&i) = column.get(&row.biosample_key()) {
                counts[i] += row.read_count;
            }
        }

        let mut out = Vec::with_capacity(by_variant.len());
        for (variant_id, counts) in by_variant {
            let assignment = ltg.get(&variant_id).map(|a| (*a).clone());
            let ltg_name = assignment
                .as_ref()
                .and_then(|a| a.ltg_tax_id)
                .and_then(|id| taxonomy.and_then(|t| t.scientific_name(id)))
                .map(str::to_string);
            out.push(AsvRow {
                variant_id,
                sequence: variants.sequence(variant_id)?.to_string(),
                read_count: counts.iter().sum(),
                counts,
                ltg: assignment,
                ltg_name,
            });
        }
        Ok(Self { biosamples, rows: out, with_taxa: assignments.is_some() })
    }
}

fn biosample_label(k: &BiosampleKey) -> String {
    format!("{}:{}:{}", k.run_id, k.marker_id, k.biosample_id)
}

fn opt<T: fmt::Display>(v: Option<T>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}

impl fmt::Display for AsvTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "variant_id\tsequence_length\tread_count")?;
        for k in &self.biosamples {
            write!(f, "\t{}", biosample_label(k))?;
        }
        if self.with_taxa {
            write!(f, "\tltg_tax_id\tltg_tax_name\tltg_rank\tidentity")?;
        }
        writeln!(f, "\tsequence")?;

        for row in &self.rows {
            write!(f, "{}\t{}\t{}", row.variant_id, row.sequence.len(), row.read_count)?;
            for n in &row.counts {
                write!(f, "\t{}", n)?;
            }
            if self.with_taxa {
                let a = row.ltg.as_ref();
                write!(
                    f,
                    "\t{}\t{}\t{}\t{}",
                    opt(a.and_then(|a| a.ltg_tax_id)),
                    row.ltg_name.as_deref().unwrap_or(""),
                    opt(a.and_then(|a| a.ltg_rank)),
                    opt(a.and_then(|a| a.best_identity)),
                )?;
            }
            writeln!(f, "\t{}", row.sequence)?;
        }
        Ok(())
    }
}

/// Every row with one delete column per stage and the final verdict.
pub struct FilterTableTsv<'a>(pub &'a ReadCountTable);

impl fmt::Display for FilterTableTsv<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.0;
        write!(f, "run_id\tmarker_id\tbiosample_id\treplicate_id\tvariant_id\tread_count")?;
        for stage in table.stages() {
            write!(f, "\t{}", stage.name)?;
        }
        writeln!(f, "\tfilter_delete")?;
        for (idx, r) in table.rows().iter().enumerate() {
            write!(
                f,
                "{}\t{}\t{}\t{}\t{}\t{}",
                r.run_id, r.marker_id, r.biosample_id, r.replicate_id, r.variant_id, r.read_count
            )?;
            for stage in table.stages() {
                write!(f, "\t{}", u8::from(stage.delete[idx]))?;
            }
            writeln!(f, "\t{}", u8::from(table.is_deleted(idx)))?;
        }
        Ok(())
    }
}

pub struct RenkonenTsv<'a>(pub &'a [RenkonenDistance]);

impl fmt::Display for RenkonenTsv<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "run_id\tmarker_id\tbiosample_id\treplicate_id_1\treplicate_id_2\tdistance")?;
        for d in self.0 {
            writeln!(
                f,
                "{}\t{}\t{}\t{}\t{}\t{:.6}",
                d.biosample.run_id,
                d.biosample.marker_id,
                d.biosample.biosample_id,
                d.left_replicate_id,
                d.right_replicate_id,
                d.distance
            )?;
        }
        Ok(())
    }
}

pub struct BorderlineTsv<'a>(pub &'a [Borderline]);

impl fmt::Display for BorderlineTsv<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "run_id\tmarker_id\tbiosample_id\treplicate_id\tvariant_id")?;
        for b in self.0 {
            let k = &b.replicate;
            writeln!(f, "{}\t{}\t{}\t{}\t{}", k.run_id, k.marker_id, k.biosample_id, k.replicate_id, b.variant_id)?;
        }
        Ok(())
    }
}

pub struct ReadCountAverageTsv<'a>(pub &'a [ReadCountAverage]);

impl fmt::Display for ReadCountAverageTsv<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "run_id\tmarker_id\tbiosample_id\tvariant_id\tread_count\treplicate_count\tread_count_average")?;
        for a in self.0 {
            writeln!(
                f,
                "{}\t{}\t{}\t{}\t{}\t{}\t{:.2}",
                a.biosample.run_id,
                a.biosample.marker_id,
                a.biosample.biosample_id,
                a.variant_id,
                a.read_count,
                a.replicate_count,
                a.read_count_average
            )?;
        }
        Ok(())
    }
}

pub struct LtgTsv<'a> {
    pub assignments: &'a [LtgAssignment],
    pub taxonomy: &'a Taxonomy,
}

impl fmt::Display for LtgTsv<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "variant_id\tltg_tax_id\tltg_tax_name\tltg_rank\tidentity\thit_count")?;
        for a in self.assignments {
            let name = a.ltg_tax_id.and_then(|id| self.taxonomy.scientific_name(id)).unwrap_or("");
            writeln!(
                f,
                "{}\t{}\t{}\t{}\t{}\t{}",
                a.variant_id,
                opt(a.ltg_tax_id),
                name,
                opt(a.ltg_rank),
                opt(a.best_identity),
                a.hit_count
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxdb::Rank;
    use approx::assert_relative_eq;

    fn row(biosample: u32, replicate: u32, variant: u32, count: u64) -> ReadCountRow {
        ReadCountRow::new(1, 1, biosample, replicate, variant, count)
    }

    #[test]
    fn test_read_count_average() {
        let rows = vec![row(1, 1, 5, 10), row(1, 2, 5, 25), row(1, 3, 6, 7), row(2, 1, 5, 4)];
        let avg = read_count_average_over_replicates(&rows);
        assert_eq!(avg.len(), 3);
        assert_eq!((avg[0].variant_id, avg[0].read_count, avg[0].replicate_count), (5, 35, 2));
        assert_relative_eq!(avg[0].read_count_average, 17.5);
        assert_eq!(avg[1].variant_id, 6);
        assert_eq!(avg[2].biosample.biosample_id, 2);
    }

    #[test]
    fn test_asv_table_with_taxa() {
        let mut variants = VariantStore::new();
        variants.insert(5, "ACGTAC");
        variants.insert(6, "TTT");
        let rows = vec![row(1, 1, 5, 10), row(1, 2, 5, 25), row(2, 1, 6, 7)];
        let assignments = vec![LtgAssignment {
            variant_id: 5,
            ltg_tax_id: Some(41072),
            ltg_rank: Some(Rank::Genus),
            best_identity: Some(99.0),
            hit_count: 3,
        }];
        let tax = crate::taxdb::tests::taxonomy();
        let asv = AsvTable::build(&rows, &variants, Some(&assignments), Some(&tax)).unwrap();
        assert_eq!(asv.rows[0].counts, vec![35, 0]);
        assert_eq!(asv.rows[1].counts, vec![0, 7]);
        let text = asv.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "variant_id\tsequence_length\tread_count\t1:1:1\t1:1:2\tltg_tax_id\tltg_tax_name\tltg_rank\tidentity\tsequence"
        );
        assert_eq!(lines[1], "5\t6\t35\t35\t0\t41072\tCarabus\tgenus\t99\tACGTAC");
        assert_eq!(lines[2], "6\t3\t7\t0\t7\t\t\t\t\tTTT");
    }

    #[test]
    fn test_filter_table_columns() {
        let mut table = ReadCountTable::new(vec![row(1, 1, 5, 10), row(1, 1, 6, 1)]).unwrap();
        table.run_stage("lfn_read_count", |rows| Ok(rows.iter().map(|r| r.read_count < 5).collect())).unwrap();
        let text = FilterTableTsv(&table).to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].ends_with("\tlfn_read_count\tfilter_delete"));
        assert_eq!(lines[2], "1\t1\t1\t1\t6\t1\t1\t1");
    }
}
