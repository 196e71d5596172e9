//! Best disease-associated split: clade aggregation + candidate evaluation.
//!
//! # Overview
//! A single postorder pass computes, for every node, the set of metadata
//! group keys (cohort, individual, disease code) present in its subtree:
//! a leaf contributes its sample's key if the sample is known, internal nodes
//! take the union of their children. Whenever a subtree spans more than one
//! group key, the node is a candidate bipartition: every group key in the
//! whole tree falls either in the ingroup (present below the node) or the
//! outgroup (everything else).
//!
//! Candidates pass through balance filters before testing:
//! - both sides must hold at least 2 distinct group keys;
//! - the ingroup must hold 10–90% of all keys (extreme imbalance invalidates
//!   the test);
//! - at least half of the cohorts must have both in- and out-counts of at
//!   least 10% of that cohort's total (a split explained by cohort
//!   composition is an artifact, not a disease signal).
//!
//! Surviving candidates get a disease Fisher test, a cohort Fisher test, and
//! a CMH test of disease association stratified by cohort. The best candidate
//! is the lexicographic minimum of (cmh, health fisher, cohort fisher, node
//! name), making the selection deterministic.
//!
//! Aggregation state lives in a map keyed by node id and is consumed by the
//! parent as soon as it is built; the tree itself is never touched.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use log::warn;
use phylotree::tree::Tree;

use crate::meta::{Cohort, GroupKey, SampleMeta};
use crate::stats::{cmh_test, fisher_exact, TestOutcome};
use crate::tree::{is_leaf, is_reference, leaf_names, node_name, postorder, sample_id};

/// A qualifying split with its test results and group memberships.
#[derive(Clone, Debug)]
pub struct CandidateSplit {
    pub cmh: TestOutcome,
    pub health_fisher: f64,
    pub cohort_fisher: f64,
    pub node_name: String,
    /// {ingroup, outgroup} × {H, D}
    pub disease_counts: [[u64; 2]; 2],
    /// {ingroup, outgroup} × cohorts
    pub cohort_counts: [[u64; 4]; 2],
    pub ingroup: Vec<String>,
    pub outgroup: Vec<String>,
}

impl CandidateSplit {
    /// Deterministic ordering: most significant disease association first,
    /// node name as the final tie-break.
    fn cmp_key(&self, other: &Self) -> Ordering {
        self.cmh
            .p_value()
            .total_cmp(&other.cmh.p_value())
            .then(self.health_fisher.total_cmp(&other.health_fisher))
            .then(self.cohort_fisher.total_cmp(&other.cohort_fisher))
            .then(self.node_name.cmp(&other.node_name))
    }
}

/// Row-0/row-1 bincounts of disease codes over two key sets.
fn disease_table<'a>(
    ingroup: impl Iterator<Item = &'a GroupKey>,
    outgroup: impl Iterator<Item = &'a GroupKey>,
) -> [[u64; 2]; 2] {
    let mut table = [[0u64; 2]; 2];
    for key in ingroup {
        table[0][key.code.index()] += 1;
    }
    for key in outgroup {
        table[1][key.code.index()] += 1;
    }
    table
}

/// Search the whole tree for the most disease-associated split.
///
/// Returns `None` when no node qualifies (too few known samples, or every
/// candidate fails the balance filters).
pub fn best_split(tree: &Tree, meta: &SampleMeta) -> Option<CandidateSplit> {
    // Leaf label -> group key, for every tip whose sample id is known.
    let mut tips: HashMap<String, GroupKey> = HashMap::new();
    // Group key -> distinct raw sample ids sharing it, over the whole tree.
    let mut by_key: BTreeMap<GroupKey, BTreeSet<String>> = BTreeMap::new();
    for label in leaf_names(tree, tree.get_root().ok()?) {
        let id = sample_id(&label);
        if let Some(record) = meta.get(id) {
            let key = record.group_key();
            by_key.entry(key.clone()).or_default().insert(id.to_string());
            tips.insert(label, key);
        }
    }
    let total_keys = by_key.len() as f64;

    let mut best: Option<CandidateSplit> = None;
    let mut state: HashMap<usize, HashSet<GroupKey>> = HashMap::new();

    for node_id in postorder(tree) {
        if is_leaf(tree, node_id) {
            let mut keys = HashSet::new();
            let name = node_name(tree, node_id);
            if let Some(key) = tips.get(&name) {
                keys.insert(key.clone());
            }
            state.insert(node_id, keys);
            continue;
        }

        // Union the children's states, consuming them.
        let node = tree.get(&node_id).expect("node id from tree");
        let mut keys: HashSet<GroupKey> = HashSet::new();
        for child in &node.children {
            if let Some(child_keys) = state.remove(child) {
                if child_keys.len() > keys.len() {
                    let prev = std::mem::replace(&mut keys, child_keys);
                    keys.extend(prev);
                } else {
                    keys.extend(child_keys);
                }
            }
        }

        if keys.len() > 1 {
            if let Some(candidate) = evaluate_cut(tree, node_id, &keys, &by_key, total_keys) {
                best = match best.take() {
                    Some(b) if b.cmp_key(&candidate) != Ordering::Greater => Some(b),
                    _ => Some(candidate),
                };
            }
        }
        state.insert(node_id, keys);
    }

    best
}

/// Evaluate one candidate node: apply the balance filters and run the tests.
fn evaluate_cut(
    tree: &Tree,
    node_id: usize,
    in_keys: &HashSet<GroupKey>,
    by_key: &BTreeMap<GroupKey, BTreeSet<String>>,
    total_keys: f64,
) -> Option<CandidateSplit> {
    let out_keys: Vec<&GroupKey> = by_key.keys().filter(|k| !in_keys.contains(*k)).collect();
    if in_keys.len() < 2 || out_keys.len() < 2 {
        return None;
    }

    let d_h = disease_table(in_keys.iter(), out_keys.iter().copied());
    let in_total = (d_h[0][0] + d_h[0][1]) as f64;
    if in_total < 0.1 * total_keys || in_total > 0.9 * total_keys {
        return None;
    }

    let mut d_c = [[0u64; 4]; 2];
    for key in in_keys {
        d_c[0][key.cohort.index()] += 1;
    }
    for key in &out_keys {
        d_c[1][key.cohort.index()] += 1;
    }
    // A cohort is "represented" when both sides hold >= 10% of its total;
    // cohorts with no data pass vacuously. Require at least half of them.
    let represented = (0..Cohort::ALL.len())
        .filter(|&j| {
            let col_total = (d_c[0][j] + d_c[1][j]) as f64;
            (d_c[0][j].min(d_c[1][j]) as f64) >= 0.1 * col_total
        })
        .count();
    if 2 * represented < Cohort::ALL.len() {
        return None;
    }

    let health_fisher = fisher_exact(&d_h[0], &d_h[1]).p_value();
    let cohort_fisher = fisher_exact(&d_c[0], &d_c[1]).p_value();

    // One 2x2 stratum per cohort that has any data.
    let mut strata = Vec::with_capacity(Cohort::ALL.len());
    for cohort in Cohort::ALL {
        let mut stratum = [[0u64; 2]; 2];
        for key in in_keys.iter().filter(|k| k.cohort == cohort) {
            stratum[0][key.code.index()] += 1;
        }
        for key in out_keys.iter().filter(|k| k.cohort == cohort) {
            stratum[1][key.code.index()] += 1;
        }
        if stratum.iter().flatten().sum::<u64>() > 0 {
            strata.push(stratum);
        }
    }
    let name = node_name(tree, node_id);
    let cmh = cmh_test(&strata);
    if cmh.is_inconclusive() {
        // Keep the candidate with the neutral p-value; dropping it would hide
        // the node entirely.
        warn!("CMH test inconclusive at node '{name}' ({} strata)", strata.len());
    }

    let ingroup: Vec<String> = in_keys
        .iter()
        .flat_map(|k| by_key[k].iter().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let outgroup: Vec<String> = out_keys
        .iter()
        .flat_map(|k| by_key[*k].iter().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    Some(CandidateSplit {
        cmh,
        health_fisher,
        cohort_fisher,
        node_name: name,
        disease_counts: d_h,
        cohort_counts: d_c,
        ingroup,
        outgroup,
    })
}

/// Diseased fraction of one {H, D} count row; zero totals count as 0.
fn diseased_proportion(row: &[u64; 2]) -> f64 {
    let total = row[0] + row[1];
    if total == 0 { 0.0 } else { row[1] as f64 / total as f64 }
}

/// Reference tips inside and outside a named clade, healthier side first.
#[derive(Clone, Debug, PartialEq)]
pub struct ReferenceTips {
    /// Reference tips on the side with the lower diseased proportion.
    pub healthy_side: Vec<String>,
    /// Reference tips on the side with the higher diseased proportion.
    pub diseased_side: Vec<String>,
}

/// Post-hoc lookup of reference-genome tips around a winning split.
///
/// `disease_counts` is the winning candidate's {in,out} × {H,D} table and
/// decides which side is the healthier one; sides with a zero total count as
/// proportion 0. Returns `None` when no node carries `name` (callers emit an
/// NA sentinel row, never an error).
pub fn reference_tips(
    tree: &Tree,
    name: &str,
    disease_counts: &[[u64; 2]; 2],
) -> Option<ReferenceTips> {
    let node_id = crate::tree::find_named(tree, name)?;

    let inside: BTreeSet<String> = leaf_names(tree, node_id).into_iter().collect();
    let in_refs: Vec<String> = inside.iter().filter(|l| is_reference(l)).cloned().collect();
    let out_refs: Vec<String> = leaf_names(tree, tree.get_root().ok()?)
        .into_iter()
        .filter(|l| !inside.contains(l) && is_reference(l))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let (healthy_side, diseased_side) =
        if diseased_proportion(&disease_counts[0]) < diseased_proportion(&disease_counts[1]) {
            (in_refs, out_refs)
        } else {
            (out_refs, in_refs)
        };

    Some(ReferenceTips { healthy_side, diseased_side })
}

/// Species-by-sample genotype assignments pivoted from significant splits.
///
/// Each split assigns 'D' to the samples on the side with the higher diseased
/// proportion and 'H' to the other side (ties give the ingroup 'H'). Samples
/// listed on both sides of a split are dropped from that split's assignments.
#[derive(Clone, Debug, Default)]
pub struct GenotypeMatrix {
    assignments: BTreeMap<String, BTreeMap<String, char>>,
    samples: BTreeSet<String>,
}

impl GenotypeMatrix {
    pub fn add_split(
        &mut self,
        species: &str,
        disease_counts: &[[u64; 2]; 2],
        ingroup: &[String],
        outgroup: &[String],
    ) {
        let in_set: HashSet<&String> = ingroup.iter().collect();
        let out_set: HashSet<&String> = outgroup.iter().collect();
        let (geno_in, geno_out) =
            if diseased_proportion(&disease_counts[0]) > diseased_proportion(&disease_counts[1]) {
                ('D', 'H')
            } else {
                ('H', 'D')
            };

        let row = self.assignments.entry(species.to_string()).or_default();
        for sample in ingroup.iter().filter(|s| !out_set.contains(*s)) {
            row.insert(sample.clone(), geno_in);
            self.samples.insert(sample.clone());
        }
        for sample in outgroup.iter().filter(|s| !in_set.contains(*s)) {
            row.insert(sample.clone(), geno_out);
            self.samples.insert(sample.clone());
        }
    }

    /// All samples assigned by any split, sorted.
    pub fn samples(&self) -> impl Iterator<Item = &String> {
        self.samples.iter()
    }

    /// Per-species assignment rows, sorted by species.
    pub fn species(&self) -> impl Iterator<Item = (&String, &BTreeMap<String, char>)> {
        self.assignments.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}
