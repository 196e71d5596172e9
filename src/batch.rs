//! Batch processing of independent trees across a worker pool.
//!
//! Each tree is a self-contained unit of work: a single-threaded, single-pass
//! traversal against the shared read-only metadata table. Trees run in
//! parallel via rayon; completion order is irrelevant because the cross-tree
//! folds are associative and commutative. A malformed tree never aborts the
//! batch; it is logged and contributes an empty result (for the cut search,
//! an explicit "no candidate" entry that downstream renders as an NA row).

use std::collections::BTreeMap;
use std::path::PathBuf;

use log::warn;
use rayon::prelude::*;

use crate::cut::{best_split, CandidateSplit};
use crate::io::read_newick_file;
use crate::meta::SampleMeta;
use crate::sharing::{PersistKey, PersistenceMap, ResultAggregator, SharingMap};

/// Tree identifier used in output rows: the path as given.
fn tree_id(path: &PathBuf) -> String {
    path.display().to_string()
}

/// Run the best-split search over every tree, preserving input order.
///
/// Every input path yields exactly one entry; parse failures and trees
/// without a qualifying split both yield `None`.
pub fn cut_search_batch(
    tree_files: &[PathBuf],
    meta: &SampleMeta,
) -> Vec<(String, Option<CandidateSplit>)> {
    tree_files
        .par_iter()
        .map(|path| {
            let id = tree_id(path);
            match read_newick_file(path) {
                Ok(tree) => {
                    let best = best_split(&tree, meta);
                    (id, best)
                }
                Err(e) => {
                    warn!("skipping tree {id}: {e}");
                    (id, None)
                }
            }
        })
        .collect()
}

/// Compute per-tree sharing minima and fold them into pair statistics.
pub fn sharing_batch(
    tree_files: &[PathBuf],
    meta: &SampleMeta,
    threshold: f64,
) -> ResultAggregator {
    tree_files
        .par_iter()
        .map(|path| {
            let mut agg = ResultAggregator::new(threshold);
            match read_newick_file(path) {
                Ok(tree) => agg.add_tree(&SharingMap::from_tree(&tree, meta)),
                Err(e) => warn!("skipping tree {}: {e}", tree_id(path)),
            }
            agg
        })
        .reduce(|| ResultAggregator::new(threshold), ResultAggregator::merge)
}

/// Per-tree persistence minima (within-individual, cross-day), input order
/// preserved; failed trees contribute an empty map.
pub fn persistence_batch(
    tree_files: &[PathBuf],
    meta: &SampleMeta,
) -> Vec<(String, BTreeMap<PersistKey, f64>)> {
    let meta = meta.without_before_fmt();
    tree_files
        .par_iter()
        .map(|path| {
            let id = tree_id(path);
            let minima = match read_newick_file(path) {
                Ok(tree) => PersistenceMap::from_tree(&tree, &meta)
                    .min_distance
                    .into_iter()
                    .collect(),
                Err(e) => {
                    warn!("skipping tree {id}: {e}");
                    BTreeMap::new()
                }
            };
            (id, minima)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::parse_metadata;
    use std::fs;

    const META: &str = "ID\tCohort\tindividual\tDay\tDisease type\n\
        A\trCDI\tiA\t0\thealthy\n\
        B\trCDI\tiB\t0\thealthy\n";

    fn temp_batch(name: &str, files: &[(&str, &str)]) -> (std::path::PathBuf, Vec<PathBuf>) {
        let dir = std::env::temp_dir().join(format!("{name}-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let paths = files
            .iter()
            .map(|(name, content)| {
                let p = dir.join(name);
                fs::write(&p, content).unwrap();
                p
            })
            .collect();
        (dir, paths)
    }

    #[test]
    fn corrupt_tree_is_skipped_and_the_batch_completes() {
        let meta = parse_metadata(META).unwrap();
        let (dir, paths) = temp_batch(
            "sharing-batch",
            &[
                ("t1.nwk", "(A|1:0.0001,B|2:0.0001);\n"),
                ("bad.nwk", "((((;\n"),
                ("t3.nwk", "(A|1:0.3,B|2:0.3);\n"),
            ],
        );

        let agg = sharing_batch(&paths, &meta, 0.001);
        let stats = agg.pairs[&("A".to_string(), "B".to_string())];
        // Only the two valid trees contribute.
        assert_eq!(stats.trees_observed, 2);
        assert_eq!(stats.trees_shared, 1);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn cut_search_emits_one_entry_per_input_in_order() {
        let meta = parse_metadata(META).unwrap();
        let (dir, paths) = temp_batch(
            "cut-batch",
            &[("t1.nwk", "(A|1:0.1,B|2:0.1);\n"), ("bad.nwk", "((((;\n")],
        );

        let results = cut_search_batch(&paths, &meta);
        assert_eq!(results.len(), 2);
        assert!(results[0].0.ends_with("t1.nwk"));
        // Two group keys total: no side can hold two, so no candidate; the
        // corrupt tree also yields the sentinel entry.
        assert!(results[0].1.is_none());
        assert!(results[1].1.is_none());

        fs::remove_dir_all(&dir).ok();
    }
}
