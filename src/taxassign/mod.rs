pub mod assign;
pub mod ltg;

pub use assign::{assign_taxa, parse_hits, read_hits_tsv};
pub use ltg::{lowest_taxonomic_group, LtgAssignment, LtgRule};
