//! Pairwise minimum patristic distances and cross-tree sharing statistics.
//!
//! # Overview
//! A single postorder pass carries, for every node, the list of known-sample
//! leaves in its subtree together with their accumulated distance up to that
//! node. At each internal node, every unordered pair of children contributes
//! its cross-subtree leaf pairs:
//!
//! ```text
//!            m
//!          /   \
//!     child_i  child_j
//!       ...      ...
//!        a        b      combined = accum(a) + accum(b)
//!                                 + corrected_terminal(a)
//!                                 + corrected_terminal(b)
//! ```
//!
//! `accum` is the path length from the leaf's parent up to `m`, so the
//! combined value is the patristic distance with each terminal branch passed
//! through a quality correction: used in full for tips flagged `low_qual`,
//! halved otherwise (asymmetric sequencing-quality uncertainty shortens
//! confident terminal branches).
//!
//! Summed over the tree this visits every cross-subtree leaf pair exactly
//! once, doing the same work as exhaustive all-pairs patristic distance
//! without re-walking root-to-leaf paths.
//!
//! # Pairing policies
//! What counts as a qualifying pair and what keys the minimum differs per
//! use case, so the update sits behind the [`PairSink`] seam:
//! - [`SharingMap`]: distinct samples, keyed by the sorted sample-id pair;
//! - [`PersistenceMap`]: same cohort and individual on different days, keyed
//!   by (cohort, individual, sorted day pair).
//!
//! Both use insert-or-keep-minimum semantics on a flat map.

use std::collections::HashMap;

use itertools::Itertools;
use phylotree::tree::Tree;

use crate::meta::{Cohort, SampleMeta};
use crate::tree::{branch_length, is_leaf, is_low_quality, node_name, postorder, sample_id};

/// One known-sample leaf carried upward during the traversal.
#[derive(Clone, Debug)]
pub struct LeafRecord {
    pub label: String,
    pub sample_id: String,
    /// The leaf's own terminal branch length.
    pub terminal: f64,
    pub low_quality: bool,
    /// Path length from the leaf's parent node up to the current node.
    pub accum: f64,
}

impl LeafRecord {
    /// Terminal branch contribution: full length for low-quality tips,
    /// halved otherwise.
    pub fn corrected_terminal(&self) -> f64 {
        if self.low_quality { self.terminal } else { self.terminal / 2.0 }
    }
}

/// Consumer of qualifying cross-subtree leaf pairs.
///
/// The traversal guarantees the two records come from different child
/// subtrees and different samples; the sink applies any further pairing
/// constraints and the keep-minimum update.
pub trait PairSink {
    fn observe(&mut self, a: &LeafRecord, b: &LeafRecord, distance: f64);
}

/// Run the distance-aggregation pass over one tree, feeding `sink`.
///
/// Leaves whose sample id is not in `meta` (reference tips, dropped samples)
/// contribute nothing. The tree is read-only; per-node state lives in an
/// auxiliary map consumed as parents take over their children's records.
pub fn aggregate_pairs(tree: &Tree, meta: &SampleMeta, sink: &mut dyn PairSink) {
    let mut state: HashMap<usize, Vec<LeafRecord>> = HashMap::new();

    for node_id in postorder(tree) {
        if is_leaf(tree, node_id) {
            let label = node_name(tree, node_id);
            let id = sample_id(&label).to_string();
            let records = if meta.contains(&id) {
                vec![LeafRecord {
                    low_quality: is_low_quality(&label),
                    terminal: branch_length(tree, node_id),
                    label,
                    sample_id: id,
                    accum: 0.0,
                }]
            } else {
                Vec::new()
            };
            state.insert(node_id, records);
            continue;
        }

        let node = tree.get(&node_id).expect("node id from tree");
        let children = node.children.clone();

        for (ci, cj) in children.iter().tuple_combinations() {
            let (left, right) = (&state[ci], &state[cj]);
            if left.is_empty() || right.is_empty() {
                continue;
            }
            for a in left {
                for b in right {
                    if a.sample_id == b.sample_id {
                        continue;
                    }
                    let distance = a.accum
                        + b.accum
                        + a.corrected_terminal()
                        + b.corrected_terminal();
                    sink.observe(a, b, distance);
                }
            }
        }

        // This node's state: all children's records, lifted by one branch.
        let own_length = branch_length(tree, node_id);
        let mut merged = Vec::new();
        for child in &children {
            if let Some(mut records) = state.remove(child) {
                merged.append(&mut records);
            }
        }
        for record in &mut merged {
            record.accum += own_length;
        }
        state.insert(node_id, merged);
    }
}

/// Minimum distance per unordered sample pair over one tree.
#[derive(Clone, Debug, Default)]
pub struct SharingMap {
    pub min_distance: HashMap<(String, String), f64>,
}

impl SharingMap {
    /// Convenience: run the traversal and return the per-pair minima.
    pub fn from_tree(tree: &Tree, meta: &SampleMeta) -> Self {
        let mut map = SharingMap::default();
        aggregate_pairs(tree, meta, &mut map);
        map
    }
}

impl PairSink for SharingMap {
    fn observe(&mut self, a: &LeafRecord, b: &LeafRecord, distance: f64) {
        let key = if a.sample_id <= b.sample_id {
            (a.sample_id.clone(), b.sample_id.clone())
        } else {
            (b.sample_id.clone(), a.sample_id.clone())
        };
        self.min_distance
            .entry(key)
            .and_modify(|d| *d = d.min(distance))
            .or_insert(distance);
    }
}

/// Key of a within-individual cross-day minimum distance.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PersistKey {
    pub cohort: Cohort,
    pub individual: String,
    pub day_lo: i64,
    pub day_hi: i64,
}

/// Largest power of two not exceeding the day delta. Deltas below 1 have no
/// bucket and such pairs are skipped upstream.
pub fn day_delta_bucket(delta: i64) -> i64 {
    debug_assert!(delta >= 1);
    1i64 << delta.ilog2()
}

/// Minimum distance per (cohort, individual, day pair): strain persistence
/// within one individual sampled over time.
pub struct PersistenceMap<'a> {
    meta: &'a SampleMeta,
    pub min_distance: HashMap<PersistKey, f64>,
}

impl<'a> PersistenceMap<'a> {
    pub fn new(meta: &'a SampleMeta) -> Self {
        PersistenceMap { meta, min_distance: HashMap::new() }
    }

    pub fn from_tree(tree: &Tree, meta: &'a SampleMeta) -> Self {
        let mut map = PersistenceMap::new(meta);
        aggregate_pairs(tree, meta, &mut map);
        map
    }
}

impl PairSink for PersistenceMap<'_> {
    fn observe(&mut self, a: &LeafRecord, b: &LeafRecord, distance: f64) {
        let (Some(ra), Some(rb)) = (self.meta.get(&a.sample_id), self.meta.get(&b.sample_id))
        else {
            return;
        };
        if ra.cohort != rb.cohort || ra.individual != rb.individual || ra.day == rb.day {
            return;
        }
        let key = PersistKey {
            cohort: ra.cohort,
            individual: ra.individual.clone(),
            day_lo: ra.day.min(rb.day),
            day_hi: ra.day.max(rb.day),
        };
        self.min_distance
            .entry(key)
            .and_modify(|d| *d = d.min(distance))
            .or_insert(distance);
    }
}

/// Per-pair statistics folded over a batch of trees.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PairStats {
    pub trees_observed: u64,
    pub trees_shared: u64,
    sum_distance: f64,
}

impl PairStats {
    pub fn sharing_rate(&self) -> f64 {
        if self.trees_observed == 0 {
            0.0
        } else {
            self.trees_shared as f64 / self.trees_observed as f64
        }
    }

    pub fn mean_distance(&self) -> f64 {
        if self.trees_observed == 0 {
            0.0
        } else {
            self.sum_distance / self.trees_observed as f64
        }
    }
}

/// Fold of per-tree [`SharingMap`]s into per-pair sharing statistics.
///
/// `add_tree` and `merge` are associative and commutative in tree order, so
/// per-tree maps can be folded in any order (including rayon's reduction
/// order) without changing the result, up to floating-point summation of
/// `mean_distance`.
#[derive(Clone, Debug)]
pub struct ResultAggregator {
    threshold: f64,
    pub pairs: HashMap<(String, String), PairStats>,
}

impl ResultAggregator {
    /// A pair is "shared" in a tree iff its minimum distance <= `threshold`
    /// (inclusive).
    pub fn new(threshold: f64) -> Self {
        ResultAggregator { threshold, pairs: HashMap::new() }
    }

    pub fn add_tree(&mut self, tree_minima: &SharingMap) {
        for (pair, &distance) in &tree_minima.min_distance {
            let stats = self.pairs.entry(pair.clone()).or_default();
            stats.trees_observed += 1;
            if distance <= self.threshold {
                stats.trees_shared += 1;
            }
            stats.sum_distance += distance;
        }
    }

    pub fn merge(mut self, other: ResultAggregator) -> ResultAggregator {
        for (pair, stats) in other.pairs {
            let entry = self.pairs.entry(pair).or_default();
            entry.trees_observed += stats.trees_observed;
            entry.trees_shared += stats.trees_shared;
            entry.sum_distance += stats.sum_distance;
        }
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{DiseaseType, SampleRecord};
    use std::collections::HashSet;

    fn meta_for(ids: &[&str]) -> SampleMeta {
        SampleMeta::from_records(ids.iter().map(|id| {
            (
                id.to_string(),
                SampleRecord {
                    cohort: Cohort::Rcdi,
                    individual: format!("i{id}"),
                    day: 0,
                    disease: DiseaseType::Healthy,
                    donor: None,
                },
            )
        }))
    }

    /// Independent brute force: root-to-leaf depths and ancestor chains give
    /// the patristic distance; terminal branches get the quality correction.
    fn brute_force_minima(tree: &Tree, meta: &SampleMeta) -> HashMap<(String, String), f64> {
        // DFS from the root collecting (leaf id, depth, ancestor path).
        let root = tree.get_root().unwrap();
        let mut leaves: Vec<(usize, f64, Vec<usize>)> = Vec::new();
        let mut stack = vec![(root, 0.0, vec![root])];
        while let Some((id, depth, path)) = stack.pop() {
            let node = tree.get(&id).unwrap();
            if node.children.is_empty() {
                leaves.push((id, depth, path));
                continue;
            }
            for &child in &node.children {
                let mut child_path = path.clone();
                child_path.push(child);
                stack.push((child, depth + branch_length(tree, child), child_path));
            }
        }

        let depth_of = |id: usize, path: &[usize]| -> f64 {
            let mut d = 0.0;
            for &n in path.iter().skip_while(|&&n| n != id).skip(1) {
                d += branch_length(tree, n);
            }
            d
        };

        let mut minima: HashMap<(String, String), f64> = HashMap::new();
        for i in 0..leaves.len() {
            for j in i + 1..leaves.len() {
                let (a_id, _, a_path) = &leaves[i];
                let (b_id, _, b_path) = &leaves[j];
                let a_label = node_name(tree, *a_id);
                let b_label = node_name(tree, *b_id);
                let a_sample = sample_id(&a_label).to_string();
                let b_sample = sample_id(&b_label).to_string();
                if a_sample == b_sample
                    || !meta.contains(&a_sample)
                    || !meta.contains(&b_sample)
                {
                    continue;
                }

                let a_set: HashSet<usize> = a_path.iter().copied().collect();
                let lca = *b_path.iter().rev().find(|n| a_set.contains(n)).unwrap();
                // depth_of sums the edges below the LCA along each path.
                let patristic = depth_of(lca, a_path) + depth_of(lca, b_path);

                let correction = |id: usize, label: &str| {
                    let term = branch_length(tree, id);
                    if is_low_quality(label) { 0.0 } else { term / 2.0 }
                };
                assert!(is_leaf(tree, *a_id) && is_leaf(tree, *b_id));
                let dist = patristic - correction(*a_id, &a_label) - correction(*b_id, &b_label);

                let key = if a_sample <= b_sample {
                    (a_sample, b_sample)
                } else {
                    (b_sample, a_sample)
                };
                minima
                    .entry(key)
                    .and_modify(|d: &mut f64| *d = d.min(dist))
                    .or_insert(dist);
            }
        }
        minima
    }

    #[test]
    fn aggregated_minima_match_brute_force() {
        // 10 leaves, multifurcation, duplicate tips for sample C, one
        // low-quality tip, one unknown sample (X) and one reference tip.
        let newick = "(((A|1:0.11,B|2:0.07)n1:0.05,(C|3:0.02,C|4:0.3,D|5|low_qual:0.09)n2:0.04)n3:0.01,((E|6:0.2,F|7:0.13)n4:0.06,(X|8:0.1,GCF_9:0.5)n5:0.03)n6:0.08);";
        let tree = Tree::from_newick(newick).unwrap();
        let meta = meta_for(&["A", "B", "C", "D", "E", "F"]);

        let computed = SharingMap::from_tree(&tree, &meta).min_distance;
        let expected = brute_force_minima(&tree, &meta);

        assert_eq!(computed.len(), expected.len());
        for (pair, want) in &expected {
            let got = computed.get(pair).unwrap_or_else(|| panic!("missing {pair:?}"));
            assert!((got - want).abs() < 1e-12, "{pair:?}: {got} vs {want}");
        }
    }

    #[test]
    fn duplicate_tips_keep_the_minimum() {
        // Sample C appears twice; the pair (C,D) must use the closer tip.
        let tree = Tree::from_newick("((C|1:0.1,D|2:0.1)n1:0.1,C|9:2.0);").unwrap();
        let meta = meta_for(&["C", "D"]);
        let minima = SharingMap::from_tree(&tree, &meta).min_distance;
        let d = minima[&("C".to_string(), "D".to_string())];
        assert!((d - 0.1).abs() < 1e-12, "d = {d}");
    }

    #[test]
    fn threshold_boundary_is_inclusive() {
        // Both terminals used in full (low_qual): combined distance is
        // exactly 0.001, which must count as shared.
        let tree = Tree::from_newick("(A|x|low_qual:0.0005,B|y|low_qual:0.0005);").unwrap();
        let meta = meta_for(&["A", "B"]);
        let minima = SharingMap::from_tree(&tree, &meta);

        let mut agg = ResultAggregator::new(0.001);
        agg.add_tree(&minima);
        let stats = agg.pairs[&("A".to_string(), "B".to_string())];
        assert_eq!(stats.trees_observed, 1);
        assert_eq!(stats.trees_shared, 1);
        assert_eq!(stats.sharing_rate(), 1.0);
    }

    #[test]
    fn fold_is_order_independent() {
        let tree1 = Tree::from_newick("(A|1:0.2,B|2:0.2);").unwrap();
        let tree2 = Tree::from_newick("((A|1:0.0001,B|2:0.0001)n1:0.5,C|3:0.4);").unwrap();
        let meta = meta_for(&["A", "B", "C"]);
        let m1 = SharingMap::from_tree(&tree1, &meta);
        let m2 = SharingMap::from_tree(&tree2, &meta);

        let mut f = ResultAggregator::new(0.001);
        f.add_tree(&m1);
        f.add_tree(&m2);

        let mut a = ResultAggregator::new(0.001);
        a.add_tree(&m2);
        let mut b = ResultAggregator::new(0.001);
        b.add_tree(&m1);
        let r = a.merge(b);

        assert_eq!(f.pairs.len(), r.pairs.len());
        for (pair, stats) in &f.pairs {
            let other = &r.pairs[pair];
            assert_eq!(stats.trees_observed, other.trees_observed);
            assert_eq!(stats.trees_shared, other.trees_shared);
            assert!((stats.mean_distance() - other.mean_distance()).abs() < 1e-15);
            assert_eq!(stats.sharing_rate(), other.sharing_rate());
        }

        let ab = r.pairs[&("A".to_string(), "B".to_string())];
        assert_eq!(ab.trees_observed, 2);
        assert_eq!(ab.trees_shared, 1);
        assert_eq!(ab.sharing_rate(), 0.5);
    }

    #[test]
    fn persistence_pairs_within_individual_across_days() {
        let meta = SampleMeta::from_records([
            (
                "S1".to_string(),
                SampleRecord {
                    cohort: Cohort::Rcdi,
                    individual: "p1".to_string(),
                    day: 0,
                    disease: DiseaseType::Responder,
                    donor: None,
                },
            ),
            (
                "S2".to_string(),
                SampleRecord {
                    cohort: Cohort::Rcdi,
                    individual: "p1".to_string(),
                    day: 3,
                    disease: DiseaseType::Responder,
                    donor: None,
                },
            ),
            (
                "S3".to_string(),
                SampleRecord {
                    cohort: Cohort::Rcdi,
                    individual: "p2".to_string(),
                    day: 3,
                    disease: DiseaseType::Responder,
                    donor: None,
                },
            ),
        ]);
        let tree =
            Tree::from_newick("((S1|a:0.1,S2|b:0.1)n1:0.1,S3|c:0.1);").unwrap();
        let map = PersistenceMap::from_tree(&tree, &meta);

        // Only the within-individual, cross-day pair (S1,S2) qualifies.
        assert_eq!(map.min_distance.len(), 1);
        let key = PersistKey {
            cohort: Cohort::Rcdi,
            individual: "p1".to_string(),
            day_lo: 0,
            day_hi: 3,
        };
        let d = map.min_distance[&key];
        assert!((d - 0.1).abs() < 1e-12, "d = {d}");
    }

    #[test]
    fn day_delta_buckets_are_powers_of_two() {
        assert_eq!(day_delta_bucket(1), 1);
        assert_eq!(day_delta_bucket(3), 2);
        assert_eq!(day_delta_bucket(4), 4);
        assert_eq!(day_delta_bucket(9), 8);
        assert_eq!(day_delta_bucket(64), 64);
    }
}
