//src/types.rs

/// One cell of the read-count matrix.
/// (run, marker, biosample, replicate, variant) is unique within a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadCountRow {
    pub run_id: u32,
    pub marker_id: u32,
    pub biosample_id: u32,
    pub replicate_id: u32,
    pub variant_id: u32,
    pub read_count: u64,
}

impl ReadCountRow {
    pub fn new(
        run_id: u32,
        marker_id: u32,
        biosample_id: u32,
        replicate_id: u32,
        variant_id: u32,
        read_count: u64,
    ) -> Self {
        Self { run_id, marker_id, biosample_id, replicate_id, variant_id, read_count }
    }

    #[inline]
    pub fn run_marker(&self) -> RunMarker {
        RunMarker { run_id: self.run_id, marker_id: self.marker_id }
    }

    #[inline]
    pub fn biosample_key(&self) -> BiosampleKey {
        BiosampleKey {
            run_id: self.run_id,
            marker_id: self.marker_id,
            biosample_id: self.biosample_id,
        }
    }

    #[inline]
    pub fn replicate_key(&self) -> ReplicateKey {
        ReplicateKey {
            run_id: self.run_id,
            marker_id: self.marker_id,
            biosample_id: self.biosample_id,
            replicate_id: self.replicate_id,
        }
    }
}

/// Grouping scope shared by every filter: counts never mix runs or markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunMarker {
    pub run_id: u32,
    pub marker_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BiosampleKey {
    pub run_id: u32,
    pub marker_id: u32,
    pub biosample_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplicateKey {
    pub run_id: u32,
    pub marker_id: u32,
    pub biosample_id: u32,
    pub replicate_id: u32,
}

/// A candidate amplicon sequence variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub variant_id: u32,
    pub sequence: String,
}

/// One similarity-search hit of a variant against the reference database.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub variant_id: u32,
    pub target_tax_id: u32,
    pub identity: f64, // percent, 0..=100
    pub coverage: f64,
    pub evalue: f64,
}

/// Pairwise Renkonen distance between two replicates of one biosample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenkonenDistance {
    pub biosample: BiosampleKey,
    pub left_replicate_id: u32,
    pub right_replicate_id: u32,
    pub distance: f64,
}

/// Per-biosample aggregate over replicates of the surviving table.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadCountAverage {
    pub biosample: BiosampleKey,
    pub variant_id: u32,
    pub read_count: u64,
    pub replicate_count: usize,
    pub read_count_average: f64,
}
