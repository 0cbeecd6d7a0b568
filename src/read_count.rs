//src/read_count.rs

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use ahash::AHashSet;
use flate2::read::MultiGzDecoder;

use crate::error::{MetabarError, Result};
use crate::types::ReadCountRow;

/// The delete flags written by one filter stage, one per table row.
#[derive(Debug, Clone, PartialEq)]
pub struct StageColumn {
    pub name: String,
    pub delete: Vec<bool>,
}

/// Read-count matrix with append-only logical deletes.
///
/// Rows are never removed. Each stage appends a column that carries over
/// every delete of the previous column and adds its own, so a row deleted
/// early stays deleted and the column that first flagged it is kept for
/// auditing.
#[derive(Debug, Clone)]
pub struct ReadCountTable {
    rows: Vec<ReadCountRow>,
    stages: Vec<StageColumn>,
}

impl ReadCountTable {
    pub fn new(rows: Vec<ReadCountRow>) -> Result<Self> {
        let mut seen = AHashSet::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            if !seen.insert((row.replicate_key(), row.variant_id)) {
                return Err(MetabarError::malformed(
                    "read count table",
                    i + 1,
                    format!(
                        "duplicate row run={} marker={} biosample={} replicate={} variant={}",
                        row.run_id, row.marker_id, row.biosample_id, row.replicate_id, row.variant_id
                    ),
                ));
            }
        }
        Ok(Self { rows, stages: Vec::new() })
    }

    pub fn rows(&self) -> &[ReadCountRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn stages(&self) -> &[StageColumn] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&StageColumn> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Deleted by the most recent stage (and therefore by any earlier one).
    #[inline]
    pub fn is_deleted(&self, idx: usize) -> bool {
        self.stages.last().map(|s| s.delete[idx]).unwrap_or(false)
    }

    pub fn survivor_indices(&self) -> Vec<usize> {
        (0..self.rows.len()).filter(|&i| !self.is_deleted(i)).collect()
    }

    pub fn surviving_rows(&self) -> Vec<ReadCountRow> {
        self.survivor_indices().into_iter().map(|i| self.rows[i]).collect()
    }

    /// Runs `filter` on the rows that survived the previous stage and appends
    /// its verdicts as a new column named `name`.
    ///
    /// `filter` returns one delete flag per row it was given, in order.
    /// Returns the number of rows newly deleted. If the stage leaves no row
    /// alive the column is still recorded and `AllRowsDeleted` is returned.
    pub fn run_stage<F>(&mut self, name: &str, filter: F) -> Result<usize>
    where
        F: FnOnce(&[ReadCountRow]) -> Result<Vec<bool>>,
    {
        let survivors = self.survivor_indices();
        let input: Vec<ReadCountRow> = survivors.iter().map(|&i| self.rows[i]).collect();
        let flags = filter(&input)?;
        debug_assert_eq!(flags.len(), input.len());

        let mut delete = match self.stages.last() {
            Some(prev) => prev.delete.clone(),
            None => vec![false; self.rows.len()],
        };
        let mut newly_deleted = 0;
        for (&idx, &flag) in survivors.iter().zip(flags.iter()) {
            if flag {
                delete[idx] = true;
                newly_deleted += 1;
            }
        }
        let all_deleted = delete.iter().all(|&d| d);
        self.stages.push(StageColumn { name: name.to_string(), delete });

        log::info!(
            "{}: {} of {} rows deleted ({} rows remain)",
            name,
            newly_deleted,
            input.len(),
            input.len() - newly_deleted
        );

        if all_deleted && !self.rows.is_empty() {
            return Err(MetabarError::AllRowsDeleted { stage: name.to_string() });
        }
        Ok(newly_deleted)
    }
}

/// Opens a tab-separated table, transparently decompressing `.gz` files.
pub fn open_table<P: AsRef<Path>>(path: P) -> Result<Box<dyn BufRead>> {
    let path = path.as_ref();
    let f = File::open(path)?;
    let is_gz = path.extension().map(|ext| ext == "gz").unwrap_or(false);
    let reader: Box<dyn BufRead> = if is_gz {
        Box::new(BufReader::new(MultiGzDecoder::new(f)))
    } else {
        Box::new(BufReader::new(f))
    };
    Ok(reader)
}

/// Locates the named columns of a header line.
pub(crate) fn column_indices(
    header: &str,
    wanted: &[&str],
    source_name: &str,
) -> Result<Vec<usize>> {
    let columns: Vec<&str> = header.split('\t').map(str::trim).collect();
    wanted
        .iter()
        .map(|w| {
            columns.iter().position(|c| c == w).ok_or_else(|| {
                MetabarError::malformed(source_name, 1, format!("missing column '{w}'"))
            })
        })
        .collect()
}

const READ_COUNT_COLUMNS: [&str; 6] = [
    "run_id",
    "marker_id",
    "biosample_id",
    "replicate_id",
    "variant_id",
    "read_count",
];

/// Reads a read-count TSV with a header naming the six key/count columns
/// (in any order; extra columns are ignored).
pub fn read_read_count_tsv<P: AsRef<Path>>(path: P) -> Result<Vec<ReadCountRow>> {
    let name = path.as_ref().display().to_string();
    parse_read_counts(open_table(path)?, &name)
}

pub fn parse_read_counts<R: BufRead>(reader: R, source_name: &str) -> Result<Vec<ReadCountRow>> {
    let mut lines = reader.lines();
    let header = match lines.next() {
        Some(h) => h?,
        None => return Ok(Vec::new()),
    };
    let idx = column_indices(&header, &READ_COUNT_COLUMNS, source_name)?;

    let mut rows = Vec::new();
    for (i, line) in lines.enumerate() {
        let line = line?;
        let line_no = i + 2;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
        let mut values = [0u64; 6];
        for (slot, &col) in values.iter_mut().zip(idx.iter()) {
            let raw = fields.get(col).ok_or_else(|| {
                MetabarError::malformed(source_name, line_no, "too few columns")
            })?;
            *slot = raw.parse().map_err(|_| {
                MetabarError::malformed(source_name, line_no, format!("'{raw}' is not a non-negative integer"))
            })?;
        }
        let id = |v: u64| {
            u32::try_from(v).map_err(|_| MetabarError::malformed(source_name, line_no, "id out of range"))
        };
        rows.push(ReadCountRow::new(
            id(values[0])?,
            id(values[1])?,
            id(values[2])?,
            id(values[3])?,
            id(values[4])?,
            values[5],
        ));
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn rows() -> Vec<ReadCountRow> {
        vec![
            ReadCountRow::new(1, 1, 1, 1, 1, 100),
            ReadCountRow::new(1, 1, 1, 2, 1, 50),
            ReadCountRow::new(1, 1, 1, 1, 2, 3),
        ]
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut r = rows();
        r.push(ReadCountRow::new(1, 1, 1, 1, 1, 7));
        assert!(ReadCountTable::new(r).is_err());
    }

    #[test]
    fn test_stages_are_cumulative() {
        let mut table = ReadCountTable::new(rows()).unwrap();
        table
            .run_stage("first", |input| Ok(input.iter().map(|r| r.read_count < 10).collect()))
            .unwrap();
        assert_eq!(table.survivor_indices(), vec![0, 1]);

        // The second stage only sees the two survivors.
        table
            .run_stage("second", |input| {
                assert_eq!(input.len(), 2);
                Ok(vec![false, true])
            })
            .unwrap();
        assert_eq!(table.stage("first").unwrap().delete, vec![false, false, true]);
        assert_eq!(table.stage("second").unwrap().delete, vec![false, true, true]);
        assert_eq!(table.survivor_indices(), vec![0]);
    }

    #[test]
    fn test_all_deleted_is_fatal() {
        let mut table = ReadCountTable::new(rows()).unwrap();
        let err = table
            .run_stage("everything", |input| Ok(vec![true; input.len()]))
            .unwrap_err();
        assert!(matches!(err, MetabarError::AllRowsDeleted { ref stage } if stage == "everything"));
        // The column is kept for auditing.
        assert_eq!(table.stages().len(), 1);
    }

    #[test]
    fn test_parse_read_counts_any_column_order() {
        let tsv = "variant_id\tread_count\trun_id\tmarker_id\tbiosample_id\treplicate_id\n\
                   5\t120\t1\t2\t3\t4\n";
        let rows = parse_read_counts(tsv.as_bytes(), "counts").unwrap();
        assert_eq!(rows, vec![ReadCountRow::new(1, 2, 3, 4, 5, 120)]);
    }

    #[test]
    fn test_parse_read_counts_rejects_negative() {
        let tsv = "run_id\tmarker_id\tbiosample_id\treplicate_id\tvariant_id\tread_count\n1\t1\t1\t1\t1\t-4\n";
        let err = parse_read_counts(tsv.as_bytes(), "counts").unwrap_err();
        assert!(matches!(err, MetabarError::MalformedInput { line: 2, .. }));
    }

    #[test]
    fn test_read_gzipped_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counts.tsv.gz");
        let f = File::create(&path).unwrap();
        let mut gz = flate2::write::GzEncoder::new(f, flate2::Compression::default());
        write!(
            gz,
            "run_id\tmarker_id\tbiosample_id\treplicate_id\tvariant_id\tread_count\n1\t1\t1\t1\t9\t42\n"
        )
        .unwrap();
        gz.finish().unwrap();

        let rows = read_read_count_tsv(&path).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].read_count, 42);
    }
}
