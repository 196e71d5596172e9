use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::{info, warn};

use strain_tracker::batch::{cut_search_batch, persistence_batch, sharing_batch};
use strain_tracker::cut::{reference_tips, GenotypeMatrix};
use strain_tracker::error::{Error, Result};
use strain_tracker::io::{
    cut_record_line, open_output, read_cut_rows, read_metadata, read_newick_file, read_path_list,
    reference_line, species_from_path, write_genotype_table, write_persistence_table,
    write_sharing_table,
};

/// Analyze microbial strain phylogenies: disease-associated clade splits and
/// cross-tree strain sharing from per-species Newick trees plus a sample
/// metadata table.
#[derive(Parser, Debug)]
#[command(name = "strain-tracker", version, about = "Strain tracking across phylogenetic trees")]
struct Cli {
    /// Number of worker threads for processing trees (default: all cores)
    #[arg(short = 'w', long = "workers", global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Find the most disease-associated split per tree (one row per tree)
    CutSearch {
        /// Metadata file (TSV)
        #[arg(short = 'm', long = "metadata")]
        metadata: PathBuf,

        /// File listing tree files (Newick), one path per line
        #[arg(short = 't', long = "tree-list")]
        tree_list: PathBuf,

        /// Output TSV path (gzip-compressed if it ends in .gz)
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
    },

    /// Strain sharing per sample pair across a batch of trees
    Sharing {
        #[arg(short = 'm', long = "metadata")]
        metadata: PathBuf,

        #[arg(short = 't', long = "tree-list")]
        tree_list: PathBuf,

        #[arg(short = 'o', long = "output")]
        output: PathBuf,

        /// Distance threshold for calling a pair shared (inclusive)
        #[arg(long = "threshold", default_value_t = 0.001)]
        threshold: f64,
    },

    /// Within-individual strain persistence across sampling days
    Persistence {
        #[arg(short = 'm', long = "metadata")]
        metadata: PathBuf,

        #[arg(short = 't', long = "tree-list")]
        tree_list: PathBuf,

        #[arg(short = 'o', long = "output")]
        output: PathBuf,

        #[arg(long = "threshold", default_value_t = 0.001)]
        threshold: f64,
    },

    /// Pivot significant cut-search rows into a species x sample genotype
    /// matrix
    Genotype {
        /// Cut-search output table
        #[arg(short = 'i', long = "input")]
        input: PathBuf,

        #[arg(short = 'o', long = "output")]
        output: PathBuf,

        /// CMH p-value below which a split counts as significant
        #[arg(long = "alpha", default_value_t = 0.05)]
        alpha: f64,
    },

    /// Look up reference tips around the winning splits of a cut-search table
    Reference {
        /// Cut-search output table
        #[arg(short = 'i', long = "input")]
        input: PathBuf,

        #[arg(short = 'o', long = "output")]
        output: PathBuf,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Some(workers) = cli.workers {
        if let Err(e) = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build_global()
        {
            warn!("could not configure {workers} workers: {e}");
        }
    }

    if let Err(e) = run(cli.command) {
        eprintln!("{e}");
        std::process::exit(2);
    }
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::CutSearch { metadata, tree_list, output } => {
            let meta = read_metadata(&metadata)?;
            let trees = read_path_list(&tree_list)?;
            info!("cut search over {} trees, {} samples", trees.len(), meta.len());

            let results = cut_search_batch(&trees, &meta);
            let mut out = open_output(&output).map_err(|e| Error::io(e, &output))?;
            for (tree_id, best) in &results {
                let line = cut_record_line(tree_id, best.as_ref());
                writeln!(out, "{line}").map_err(|e| Error::io(e, &output))?;
            }
            out.flush().map_err(|e| Error::io(e, &output))?;
            info!(
                "wrote {} rows ({} with a qualifying split)",
                results.len(),
                results.iter().filter(|(_, b)| b.is_some()).count()
            );
        }

        Command::Sharing { metadata, tree_list, output, threshold } => {
            let meta = read_metadata(&metadata)?;
            let trees = read_path_list(&tree_list)?;
            info!(
                "strain sharing over {} trees, {} samples, threshold {threshold}",
                trees.len(),
                meta.len()
            );

            let aggregated = sharing_batch(&trees, &meta, threshold);
            let mut out = open_output(&output).map_err(|e| Error::io(e, &output))?;
            write_sharing_table(&mut out, &aggregated, &meta)
                .map_err(|e| Error::io(e, &output))?;
            info!("wrote {} sample pairs", aggregated.pairs.len());
        }

        Command::Persistence { metadata, tree_list, output, threshold } => {
            let meta = read_metadata(&metadata)?;
            let trees = read_path_list(&tree_list)?;
            info!("persistence over {} trees, {} samples", trees.len(), meta.len());

            let per_tree = persistence_batch(&trees, &meta);
            let mut out = open_output(&output).map_err(|e| Error::io(e, &output))?;
            write_persistence_table(&mut out, &per_tree, threshold)
                .map_err(|e| Error::io(e, &output))?;
        }

        Command::Genotype { input, output, alpha } => {
            let rows = read_cut_rows(&input)?;
            let mut matrix = GenotypeMatrix::default();
            let mut significant = 0usize;
            for row in &rows {
                if !row.cmh.parse::<f64>().is_ok_and(|p| p < alpha) {
                    continue;
                }
                let Some(counts) = &row.disease_counts else { continue };
                matrix.add_split(
                    species_from_path(&row.tree_path),
                    counts,
                    &row.ingroup,
                    &row.outgroup,
                );
                significant += 1;
            }
            info!("{significant} of {} rows significant at alpha {alpha}", rows.len());
            let mut out = open_output(&output).map_err(|e| Error::io(e, &output))?;
            write_genotype_table(&mut out, &matrix).map_err(|e| Error::io(e, &output))?;
        }

        Command::Reference { input, output } => {
            let rows = read_cut_rows(&input)?;
            let mut out = open_output(&output).map_err(|e| Error::io(e, &output))?;
            for row in &rows {
                let tips = match &row.disease_counts {
                    Some(counts) => match read_newick_file(&row.tree_path) {
                        Ok(tree) => reference_tips(&tree, &row.node_name, counts),
                        Err(e) => {
                            warn!("skipping tree {}: {e}", row.tree_path);
                            None
                        }
                    },
                    None => None,
                };
                let line = reference_line(row, tips.as_ref());
                writeln!(out, "{line}").map_err(|e| Error::io(e, &output))?;
            }
            out.flush().map_err(|e| Error::io(e, &output))?;
        }
    }

    Ok(())
}
