//! Crate root: lightweight module orchestration and public re-exports.
//!
//! Modules:
//! - `tree`: postorder traversal and leaf-label helpers over `phylotree`.
//! - `meta`: sample metadata table, group keys, pair categories.
//! - `stats`: Fisher exact and CMH tests with tagged inconclusive outcomes.
//! - `cut`: best disease-associated split search + reference-tip lookup.
//! - `sharing`: pairwise minimum patristic distances and the cross-tree fold.
//! - `batch`: parallel dispatch of independent trees.
//! - `io`: Newick/metadata readers and the output table writers.
//! - `error`: crate error type.

pub mod batch;
pub mod cut;
pub mod error;
pub mod io;
pub mod meta;
pub mod sharing;
pub mod stats;
pub mod tree;

// Re-export frequently used types & functions
pub use cut::{best_split, CandidateSplit};
pub use error::{Error, Result};
pub use meta::{categorize_pair, SampleMeta};
pub use sharing::{ResultAggregator, SharingMap};
pub use stats::TestOutcome;
