// src/lib.rs
pub mod chimera;
pub mod config;
pub mod error;
pub mod frame;
pub mod genetic_code;
pub mod lfn;
pub mod oracle;
pub mod pcr_error;
pub mod read_count;
pub mod renkonen;
pub mod report;
pub mod taxassign;
pub mod taxdb;
pub mod types;
pub mod variants;

use crate::chimera::{filter_chimera, Borderline, CHIMERA};
use crate::config::{CutoffTable, Params};
use crate::error::{MetabarError, Result};
use crate::frame::{filter_codon_stop, filter_indel, CODON_STOP, INDEL};
use crate::lfn::LfnFilterChain;
use crate::oracle::{AlignmentOracle, ChimeraOracle};
use crate::pcr_error::{filter_pcr_error, PcrErrorCandidate, PCR_ERROR};
use crate::read_count::ReadCountTable;
use crate::renkonen::{filter_renkonen, RENKONEN};
use crate::report::{
    read_count_average_over_replicates, AsvTable, BorderlineTsv, FilterTableTsv,
    ReadCountAverageTsv, RenkonenTsv,
};
use crate::taxassign::LtgAssignment;
use crate::taxdb::Taxonomy;
use crate::types::{ReadCountRow, RenkonenDistance};
use crate::variants::VariantStore;

/// Everything the filter chain produced. Only structured data is kept;
/// text tables are generated on demand.
#[derive(Debug, Clone)]
pub struct FilterResults {
    /// Input rows with one delete column per stage that ran.
    pub table: ReadCountTable,
    pub renkonen_distances: Vec<RenkonenDistance>,
    pub chimera_borderline: Vec<Borderline>,
    pub pcr_error_candidates: Vec<PcrErrorCandidate>,
    /// Groups an external aligner failed on, with the failure message.
    pub failed_groups: Vec<String>,
}

impl FilterResults {
    pub fn surviving_rows(&self) -> Vec<ReadCountRow> {
        self.table.surviving_rows()
    }

    /// Ids of the variants with at least one surviving row, ascending.
    pub fn surviving_variant_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.surviving_rows().iter().map(|r| r.variant_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Generate the per-stage delete table on demand
    pub fn get_filter_table(&self) -> String {
        FilterTableTsv(&self.table).to_string()
    }

    pub fn get_renkonen_distances(&self) -> String {
        RenkonenTsv(&self.renkonen_distances).to_string()
    }

    pub fn get_chimera_borderline(&self) -> String {
        BorderlineTsv(&self.chimera_borderline).to_string()
    }

    pub fn get_read_count_average(&self) -> String {
        ReadCountAverageTsv(&read_count_average_over_replicates(&self.surviving_rows())).to_string()
    }

    /// Generate the ASV table on demand, with LTG columns when `assignments`
    /// is given.
    pub fn get_asv_table(
        &self,
        variants: &VariantStore,
        assignments: Option<&[LtgAssignment]>,
        taxonomy: Option<&Taxonomy>,
    ) -> Result<String> {
        Ok(AsvTable::build(&self.surviving_rows(), variants, assignments, taxonomy)?.to_string())
    }
}

/// Runs the whole filter chain: LFN, Renkonen, chimera, indel, codon stop,
/// then PCR error when a cutoff is configured.
///
/// Every stage sees only the rows left by the one before it. Parameters are
/// validated before any stage runs. If a stage deletes every row the chain
/// stops with [`MetabarError::AllRowsDeleted`].
pub fn run_filters(
    rows: Vec<ReadCountRow>,
    variants: &VariantStore,
    params: &Params,
    cutoffs: Option<&CutoffTable>,
    chimera_oracle: &dyn ChimeraOracle,
    alignment_oracle: &dyn AlignmentOracle,
) -> Result<FilterResults> {
    params.validate()?;
    let code = genetic_code::table(params.genetic_table_number).ok_or_else(|| {
        MetabarError::InvalidConfig(vec![format!(
            "unknown genetic_table_number {}",
            params.genetic_table_number
        )])
    })?;

    let mut table = ReadCountTable::new(rows)?;
    log::info!("Filtering {} read-count rows", table.len());

    LfnFilterChain::new(params, cutoffs).run(&mut table)?;

    let mut renkonen_distances = Vec::new();
    table.run_stage(RENKONEN, |rows| {
        let out = filter_renkonen(rows, params.upper_renkonen_tail);
        renkonen_distances = out.distances;
        Ok(out.delete)
    })?;

    let mut chimera_borderline = Vec::new();
    let mut failed_groups = Vec::new();
    if params.skip_filter_chimera {
        log::info!("{}: skipped", CHIMERA);
    } else {
        table.run_stage(CHIMERA, |rows| {
            let out = filter_chimera(rows, variants, chimera_oracle)?;
            chimera_borderline = out.borderline;
            failed_groups.extend(out.failed_groups.into_iter().map(|(k, msg)| {
                format!(
                    "{} run {} marker {} biosample {} replicate {}: {}",
                    CHIMERA, k.run_id, k.marker_id, k.biosample_id, k.replicate_id, msg
                )
            }));
            Ok(out.delete)
        })?;
    }

    if params.skip_filter_indel {
        log::info!("{}: skipped", INDEL);
    } else {
        table.run_stage(INDEL, |rows| filter_indel(rows, variants))?;
    }

    if params.skip_filter_codon_stop {
        log::info!("{}: skipped", CODON_STOP);
    } else {
        table.run_stage(CODON_STOP, |rows| filter_codon_stop(rows, variants, &code))?;
    }

    let mut pcr_error_candidates = Vec::new();
    if let Some(cutoff) = params.pcr_error_var_prop {
        table.run_stage(PCR_ERROR, |rows| {
            let out = filter_pcr_error(rows, variants, cutoff, params.pcr_error_max_edits, alignment_oracle)?;
            pcr_error_candidates = out.candidates;
            failed_groups.extend(out.failed_groups.into_iter().map(|(k, msg)| {
                format!("{} run {} marker {}: {}", PCR_ERROR, k.run_id, k.marker_id, msg)
            }));
            Ok(out.delete)
        })?;
    }

    Ok(FilterResults {
        table,
        renkonen_distances,
        chimera_borderline,
        pcr_error_candidates,
        failed_groups,
    })
}
