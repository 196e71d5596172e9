//! Traversal and leaf-label helpers over `phylotree` trees.
//!
//! # Overview
//! Strain phylogenies arrive as rooted Newick trees with named internal nodes
//! and arbitrary branching factors. Both analysis passes (best-split search
//! and pairwise distance aggregation) consume the tree through a single
//! postorder traversal: every node is visited after all of its descendants,
//! so per-subtree state can be built bottom-up in one pass.
//!
//! The traversal never mutates the tree. Aggregation state lives in auxiliary
//! maps keyed by node id and is discarded when the traversal ends, which keeps
//! the tree shareable across rayon workers.
//!
//! # Leaf labels
//! Leaf labels encode the sample a tip was derived from:
//!
//! ```text
//! SRR123456|bin.3          sample-derived tip, sample id "SRR123456"
//! SRR123456|bin.3|low_qual sample-derived tip flagged low quality
//! GCF_000012345.1          reference-genome tip (no '|')
//! ```

use phylotree::tree::Tree;

/// Iterative postorder traversal with an explicit stack.
///
/// Yields node ids with parents after all of their descendants. Recursion is
/// avoided deliberately: gut phylogenies can be deep and unbalanced enough to
/// overflow the call stack.
pub struct Postorder<'a> {
    tree: &'a Tree,
    /// (node id, index of the next child to descend into)
    stack: Vec<(usize, usize)>,
}

impl<'a> Postorder<'a> {
    pub fn new(tree: &'a Tree) -> Self {
        let stack = match tree.get_root() {
            Ok(root) => vec![(root, 0)],
            Err(_) => Vec::new(),
        };
        Postorder { tree, stack }
    }
}

impl Iterator for Postorder<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let tree = self.tree;
        loop {
            let &(node_id, child_idx) = self.stack.last()?;
            let node = tree.get(&node_id).expect("node id from tree");

            if child_idx < node.children.len() {
                // Descend into the next unvisited child.
                let child = node.children[child_idx];
                self.stack.last_mut().expect("non-empty stack").1 += 1;
                self.stack.push((child, 0));
            } else {
                // All children done: emit this node.
                self.stack.pop();
                return Some(node_id);
            }
        }
    }
}

/// Postorder sequence of all node ids in `tree`.
pub fn postorder(tree: &Tree) -> Postorder<'_> {
    Postorder::new(tree)
}

/// Whether `node_id` is a leaf (no children).
pub fn is_leaf(tree: &Tree, node_id: usize) -> bool {
    tree.get(&node_id)
        .map(|n| n.children.is_empty())
        .unwrap_or(false)
}

/// Name of a node, with unnamed nodes rendered as the empty string.
///
/// Matches the behavior of tree toolkits that default missing internal names
/// to "" (node names take part in candidate tie-breaks).
pub fn node_name(tree: &Tree, node_id: usize) -> String {
    tree.get(&node_id)
        .ok()
        .and_then(|n| n.name.clone())
        .unwrap_or_default()
}

/// Branch length from `node_id` to its parent; missing lengths are 0.
pub fn branch_length(tree: &Tree, node_id: usize) -> f64 {
    tree.get(&node_id)
        .ok()
        .and_then(|n| n.parent_edge)
        .unwrap_or(0.0)
}

/// Labels of all leaves in the subtree rooted at `node_id`.
pub fn leaf_names(tree: &Tree, node_id: usize) -> Vec<String> {
    let mut names = Vec::new();
    let mut stack = vec![node_id];
    while let Some(id) = stack.pop() {
        let node = tree.get(&id).expect("node id from tree");
        if node.children.is_empty() {
            if let Some(name) = &node.name {
                names.push(name.clone());
            }
        } else {
            stack.extend(&node.children);
        }
    }
    names
}

/// First node whose name equals `name`, if any.
pub fn find_named(tree: &Tree, name: &str) -> Option<usize> {
    postorder(tree).find(|&id| {
        tree.get(&id)
            .ok()
            .and_then(|n| n.name.as_deref())
            .is_some_and(|n| n == name)
    })
}

/// Sample id encoded in a leaf label: the part before the first `|`.
///
/// Labels without a separator are reference-genome tips; their full label is
/// returned but [`is_reference`] distinguishes them.
pub fn sample_id(label: &str) -> &str {
    label.split('|').next().unwrap_or(label)
}

/// Reference-genome tips carry no `|` separator.
pub fn is_reference(label: &str) -> bool {
    !label.contains('|')
}

/// Tips flagged as low sequencing quality carry a `low_qual` marker.
pub fn is_low_quality(label: &str) -> bool {
    label.contains("low_qual")
}
