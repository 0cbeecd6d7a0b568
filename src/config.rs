//src/config.rs

use std::io::BufRead;
use std::path::Path;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{MetabarError, Result};
use crate::genetic_code;
use crate::read_count::open_table;

/// Every threshold the filter chain and the LTG assigner recognise.
///
/// Loaded from a flat YAML mapping; missing keys take the defaults below,
/// unknown keys are rejected so a misspelled option is never silently ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Params {
    /// N_ijk / N_jk (all reads of the biosample-replicate)
    pub lfn_biosample_replicate_threshold: f64,
    /// N_ijk / N_i (all reads of the variant in the run and marker)
    pub lfn_variant_threshold: f64,
    /// N_ijk / N_ik; replaces the per-variant rule when set
    pub lfn_variant_replicate_threshold: Option<f64>,
    /// N_ijk / N_ij (reads of the variant in the biosample)
    pub lfn_replicate_series_threshold: Option<f64>,
    pub lfn_read_count_threshold: u64,
    pub min_replicate_number: usize,
    pub min_replicate_proportion: Option<f64>,

    pub upper_renkonen_tail: f64,

    pub genetic_table_number: u8,
    pub skip_filter_indel: bool,
    pub skip_filter_codon_stop: bool,
    pub skip_filter_chimera: bool,

    pub pcr_error_var_prop: Option<f64>,
    pub pcr_error_max_edits: u32,

    /// Width of the identity window below the best hit, in percent identity.
    pub ltg_rule_threshold: f64,
    pub include_prop: f64,
    pub min_number_of_taxa: usize,
    pub min_identity: f64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            lfn_biosample_replicate_threshold: 0.001,
            lfn_variant_threshold: 0.001,
            lfn_variant_replicate_threshold: None,
            lfn_replicate_series_threshold: None,
            lfn_read_count_threshold: 10,
            min_replicate_number: 2,
            min_replicate_proportion: None,
            upper_renkonen_tail: 0.1,
            genetic_table_number: 5,
            skip_filter_indel: false,
            skip_filter_codon_stop: false,
            skip_filter_chimera: false,
            pcr_error_var_prop: None,
            pcr_error_max_edits: 1,
            ltg_rule_threshold: 3.0,
            include_prop: 0.9,
            min_number_of_taxa: 3,
            min_identity: 0.0,
        }
    }
}

impl Params {
    /// Read and validate a YAML parameter file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        // An empty file is a valid "all defaults" configuration.
        let params: Params = if text.trim().is_empty() {
            Params::default()
        } else {
            serde_yaml::from_str(text)?
        };
        params.validate()?;
        Ok(params)
    }

    /// Check every range at once and report all problems in one error.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        let mut proportion = |name: &str, value: f64| {
            if !(0.0..=1.0).contains(&value) {
                problems.push(format!("{name} must be within [0, 1], got {value}"));
            }
        };
        proportion("lfn_biosample_replicate_threshold", self.lfn_biosample_replicate_threshold);
        proportion("lfn_variant_threshold", self.lfn_variant_threshold);
        if let Some(v) = self.lfn_variant_replicate_threshold {
            proportion("lfn_variant_replicate_threshold", v);
        }
        if let Some(v) = self.lfn_replicate_series_threshold {
            proportion("lfn_replicate_series_threshold", v);
        }
        if let Some(v) = self.min_replicate_proportion {
            proportion("min_replicate_proportion", v);
        }
        proportion("upper_renkonen_tail", self.upper_renkonen_tail);
        if let Some(v) = self.pcr_error_var_prop {
            if v < 0.0 || !v.is_finite() {
                problems.push(format!("pcr_error_var_prop must be >= 0, got {v}"));
            }
        }
        if !(0.0..=1.0).contains(&self.include_prop) || self.include_prop == 0.0 {
            problems.push(format!("include_prop must be within (0, 1], got {}", self.include_prop));
        }
        if !(0.0..=100.0).contains(&self.ltg_rule_threshold) {
            problems.push(format!(
                "ltg_rule_threshold must be within [0, 100], got {}",
                self.ltg_rule_threshold
            ));
        }
        if !(0.0..=100.0).contains(&self.min_identity) {
            problems.push(format!("min_identity must be within [0, 100], got {}", self.min_identity));
        }
        if genetic_code::table(self.genetic_table_number).is_none() {
            problems.push(format!("unknown genetic_table_number {}", self.genetic_table_number));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(MetabarError::InvalidConfig(problems))
        }
    }
}

/// Per-variant and per-(variant, replicate) LFN cutoffs that override the
/// global thresholds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CutoffTable {
    pub variant: AHashMap<u32, f64>,
    pub variant_replicate: AHashMap<(u32, u32), f64>,
}

impl CutoffTable {
    pub fn is_empty(&self) -> bool {
        self.variant.is_empty() && self.variant_replicate.is_empty()
    }

    /// Parses a TSV with a header line and rows of either
    /// `variant_id<TAB>cutoff` or `variant_id<TAB>replicate_id<TAB>cutoff`.
    pub fn from_tsv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let name = path.as_ref().display().to_string();
        let reader = open_table(path)?;
        Self::from_reader(reader, &name)
    }

    pub fn from_reader<R: BufRead>(reader: R, source_name: &str) -> Result<Self> {
        let mut table = CutoffTable::default();
        let mut problems = Vec::new();

        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            let line_no = i + 1;
            if i == 0 || line.trim().is_empty() {
                continue; // header
            }
            let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
            let parse_id = |s: &str| {
                s.parse::<u32>()
                    .map_err(|_| MetabarError::malformed(source_name, line_no, format!("bad id '{s}'")))
            };
            let parse_cutoff = |s: &str| {
                s.parse::<f64>()
                    .map_err(|_| MetabarError::malformed(source_name, line_no, format!("bad cutoff '{s}'")))
            };
            match fields.as_slice() {
                [variant, cutoff] => {
                    let cutoff = parse_cutoff(cutoff)?;
                    table.variant.insert(parse_id(variant)?, cutoff);
                    if !(0.0..=1.0).contains(&cutoff) {
                        problems.push(format!("{source_name}:{line_no}: cutoff {cutoff} outside [0, 1]"));
                    }
                }
                [variant, replicate, cutoff] => {
                    let cutoff = parse_cutoff(cutoff)?;
                    table
                        .variant_replicate
                        .insert((parse_id(variant)?, parse_id(replicate)?), cutoff);
                    if !(0.0..=1.0).contains(&cutoff) {
                        problems.push(format!("{source_name}:{line_no}: cutoff {cutoff} outside [0, 1]"));
                    }
                }
                _ => {
                    return Err(MetabarError::malformed(
                        source_name,
                        line_no,
                        format!("expected 2 or 3 columns, got {}", fields.len()),
                    ))
                }
            }
        }

        if problems.is_empty() {
            Ok(table)
        } else {
            Err(MetabarError::InvalidConfig(problems))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_yaml_gives_defaults() {
        let params = Params::from_yaml_str("").unwrap();
        assert_eq!(params, Params::default());
    }

    #[test]
    fn test_partial_yaml_overrides() {
        let params = Params::from_yaml_str("upper_renkonen_tail: 0.05\nmin_number_of_taxa: 1\n").unwrap();
        assert_eq!(params.upper_renkonen_tail, 0.05);
        assert_eq!(params.min_number_of_taxa, 1);
        assert_eq!(params.lfn_read_count_threshold, 10);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = Params::from_yaml_str("lfn_varaint_threshold: 0.1\n").unwrap_err();
        assert!(matches!(err, MetabarError::Yaml(_)));
    }

    #[test]
    fn test_validation_aggregates_problems() {
        let params = Params {
            lfn_variant_threshold: -0.1,
            include_prop: 1.5,
            ltg_rule_threshold: 120.0,
            genetic_table_number: 7,
            ..Params::default()
        };
        match params.validate() {
            Err(MetabarError::InvalidConfig(problems)) => assert_eq!(problems.len(), 4),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn test_cutoff_table_both_shapes() {
        let tsv = "variant_id\tcutoff\n7\t0.05\n9\t2\t0.2\n";
        let table = CutoffTable::from_reader(tsv.as_bytes(), "cutoffs").unwrap();
        assert_eq!(table.variant.get(&7), Some(&0.05));
        assert_eq!(table.variant_replicate.get(&(9, 2)), Some(&0.2));
    }

    #[test]
    fn test_cutoff_table_out_of_range() {
        let tsv = "variant_id\tcutoff\n7\t1.5\n";
        let err = CutoffTable::from_reader(tsv.as_bytes(), "cutoffs").unwrap_err();
        assert!(matches!(err, MetabarError::InvalidConfig(_)));
    }
}
