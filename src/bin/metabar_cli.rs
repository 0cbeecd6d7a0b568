use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use metabar_rs::config::{CutoffTable, Params};
use metabar_rs::error::Result;
use metabar_rs::oracle::{VsearchAlignmentOracle, VsearchChimeraOracle, VsearchOptions};
use metabar_rs::pcr_error::{optimize_pcr_error, read_positive_controls};
use metabar_rs::read_count::read_read_count_tsv;
use metabar_rs::report::LtgTsv;
use metabar_rs::run_filters;
use metabar_rs::taxassign::{assign_taxa, read_hits_tsv, LtgRule};
use metabar_rs::taxdb::Taxonomy;
use metabar_rs::variants::VariantStore;

#[derive(Parser, Debug)]
#[command(name = "metabar-rs")]
#[command(about = "Metabarcoding variant filtering and LTG taxonomic assignment")]
struct Cli {
    /// YAML parameter file; missing keys take their defaults
    #[arg(long, global = true, value_name = "FILE")]
    params: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct VsearchArgs {
    /// vsearch executable
    #[arg(long, default_value = "vsearch")]
    vsearch: PathBuf,

    /// Threads handed to each vsearch call
    #[arg(long, default_value_t = 1)]
    vsearch_threads: usize,

    /// Seconds before a vsearch call is killed
    #[arg(long, default_value_t = 3600)]
    vsearch_timeout: u64,

    /// Minimum identity (0.0-1.0) for a PCR-error parent alignment
    #[arg(long, default_value_t = 0.8)]
    min_identity: f64,
}

impl VsearchArgs {
    fn options(&self) -> VsearchOptions {
        VsearchOptions {
            binary: self.vsearch.clone(),
            threads: self.vsearch_threads,
            timeout: Duration::from_secs(self.vsearch_timeout),
            ..VsearchOptions::default()
        }
    }

    fn aligner(&self) -> VsearchAlignmentOracle {
        VsearchAlignmentOracle::new(self.options(), self.min_identity)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the filter chain and write the per-stage tables
    Filter {
        /// Read-count TSV (run_id, marker_id, biosample_id, replicate_id, variant_id, read_count)
        #[arg(long, value_name = "FILE")]
        read_counts: PathBuf,

        /// Variant sequences (TSV or FASTA)
        #[arg(long, value_name = "FILE")]
        variants: PathBuf,

        /// Variant-specific LFN cutoffs
        #[arg(long, value_name = "FILE")]
        cutoffs: Option<PathBuf>,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        outdir: PathBuf,

        #[command(flatten)]
        vsearch: VsearchArgs,
    },

    /// Calibrate pcr_error_var_prop on positive-control biosamples
    OptimizePcrError {
        #[arg(long, value_name = "FILE")]
        read_counts: PathBuf,

        #[arg(long, value_name = "FILE")]
        variants: PathBuf,

        /// Expected variants per control (run_id, marker_id, biosample_id, variant_id)
        #[arg(long, value_name = "FILE")]
        positive_controls: PathBuf,

        #[arg(short, long, default_value = "optimize_pcr_error.tsv")]
        output: PathBuf,

        #[command(flatten)]
        vsearch: VsearchArgs,
    },

    /// Assign the lowest taxonomic group of each variant
    Taxassign {
        /// Variants to assign (TSV or FASTA)
        #[arg(long, value_name = "FILE")]
        variants: PathBuf,

        /// Similarity hits (variant_id, target_tax_id, identity, ...)
        #[arg(long, value_name = "FILE")]
        hits: PathBuf,

        /// Taxonomy TSV (tax_id, parent_tax_id, rank, name_txt, old_tax_id)
        #[arg(long, value_name = "FILE")]
        taxonomy: PathBuf,

        #[arg(short, long, default_value = "ltg.tsv")]
        output: PathBuf,
    },
}

fn spinner(color: &str, msg: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
        .template(&format!("{{spinner:.{color}}} {{msg}}"))
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    spinner.set_style(style);
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message(msg.to_string());
    spinner
}

fn load_params(path: Option<&Path>) -> Result<Params> {
    match path {
        Some(p) => Params::from_yaml_file(p),
        None => Ok(Params::default()),
    }
}

fn filter(
    params: &Params,
    read_counts: &Path,
    variants: &Path,
    cutoffs: Option<&Path>,
    outdir: &Path,
    vsearch: &VsearchArgs,
) -> Result<()> {
    let sp = spinner("blue", "Loading read counts and variants...");
    let rows = read_read_count_tsv(read_counts)?;
    let variants = VariantStore::from_path(variants)?;
    let cutoffs = cutoffs.map(CutoffTable::from_tsv).transpose()?;
    sp.finish_with_message(format!("Loaded {} rows, {} variants.", rows.len(), variants.len()));

    let sp = spinner("green", "Filtering variants...");
    let chimera = VsearchChimeraOracle::new(vsearch.options());
    let aligner = vsearch.aligner();
    let results = run_filters(rows, &variants, params, cutoffs.as_ref(), &chimera, &aligner)?;
    sp.finish_with_message(format!(
        "Filtering finished: {} variants survive.",
        results.surviving_variant_ids().len()
    ));
    for failure in &results.failed_groups {
        log::warn!("{}", failure);
    }

    let sp = spinner("yellow", "Writing output files...");
    fs::create_dir_all(outdir)?;
    fs::write(outdir.join("filter_table.tsv"), results.get_filter_table())?;
    fs::write(outdir.join("renkonen_distances.tsv"), results.get_renkonen_distances())?;
    fs::write(outdir.join("chimera_borderline.tsv"), results.get_chimera_borderline())?;
    fs::write(outdir.join("read_count_average.tsv"), results.get_read_count_average())?;
    fs::write(outdir.join("asv_table.tsv"), results.get_asv_table(&variants, None, None)?)?;
    sp.finish_with_message(format!("Output files created in {}.", outdir.display()));
    Ok(())
}

fn optimize(
    params: &Params,
    read_counts: &Path,
    variants: &Path,
    positive_controls: &Path,
    output: &Path,
    vsearch: &VsearchArgs,
) -> Result<()> {
    let sp = spinner("blue", "Loading inputs...");
    let rows = read_read_count_tsv(read_counts)?;
    let variants = VariantStore::from_path(variants)?;
    let controls = read_positive_controls(positive_controls)?;
    sp.finish_with_message(format!("Loaded {} positive-control biosamples.", controls.len()));

    let sp = spinner("green", "Searching PCR-error parents...");
    let aligner = vsearch.aligner();
    let cutoff = optimize_pcr_error(&rows, &variants, &controls, params.pcr_error_max_edits, &aligner)?;
    sp.finish_with_message(format!("pcr_error_var_prop = {cutoff}"));

    fs::write(output, format!("optimal_pcr_error_param\n{cutoff}\n"))?;
    Ok(())
}

fn taxassign(params: &Params, variants: &Path, hits: &Path, taxonomy: &Path, output: &Path) -> Result<()> {
    let sp = spinner("blue", "Loading taxonomy...");
    let taxonomy = Taxonomy::from_tsv(taxonomy)?;
    let variants = VariantStore::from_path(variants)?;
    let hits = read_hits_tsv(hits)?;
    sp.finish_with_message(format!("Loaded {} taxa and {} hits.", taxonomy.len(), hits.len()));

    let sp = spinner("green", "Assigning taxa...");
    let ids: Vec<u32> = variants.iter().map(|(id, _)| id).collect();
    let assignments = assign_taxa(&ids, &hits, &taxonomy, &LtgRule::from(params));
    sp.finish_with_message("Assignment finished.");

    let text = LtgTsv { assignments: &assignments, taxonomy: &taxonomy }.to_string();
    fs::write(output, text)?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let params = load_params(cli.params.as_deref())?;
    match &cli.command {
        Command::Filter { read_counts, variants, cutoffs, outdir, vsearch } => {
            filter(&params, read_counts, variants, cutoffs.as_deref(), outdir, vsearch)
        }
        Command::OptimizePcrError {
            read_counts,
            variants,
            positive_controls,
            output,
            vsearch,
        } => optimize(&params, read_counts, variants, positive_controls, output, vsearch),
        Command::Taxassign { variants, hits, taxonomy, output } => {
            taxassign(&params, variants, hits, taxonomy, output)
        }
    }
}
