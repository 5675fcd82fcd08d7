//! Enumeration of independent branch pairs.

use crate::error::GrandConvError;
use crate::ids::NodeId;
use crate::tree::{bit_is_set, Tree};
use serde::Serialize;

/// One enumerated branch pair, `u < v`, both non-root.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BranchPair {
    /// Lower node id.
    pub u: NodeId,
    /// Higher node id.
    pub v: NodeId,
    /// Whether per-site output was requested for this pair.
    pub selected: bool,
}

/// Enumerates every unordered pair `{u, v}` of distinct non-root nodes
/// such that neither is an ancestor of the other, in ascending
/// `(u, v)` order.
///
/// `selected_pairs` are user-supplied `(u, v)` pairs (in either order)
/// for which per-site output is requested. Each must canonicalize to
/// `u < v`, refer to valid non-root nodes, and be independent; violating
/// any of these surfaces [`GrandConvError::InvalidBranchPairSelection`]
/// naming the offending pair rather than dropping it silently.
pub fn enumerate_branch_pairs(
    tree: &Tree,
    selected_pairs: &[(i64, i64)],
) -> Result<Vec<BranchPair>, GrandConvError> {
    let ancestors = tree.ancestor_bitsets();
    let nnode = tree.nnode();

    let mut selected_canonical: Vec<(usize, usize)> = Vec::with_capacity(selected_pairs.len());
    for &(a, b) in selected_pairs {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let lo_id = NodeId::from(lo);
        let hi_id = NodeId::from(hi);
        if lo == hi || !tree.is_valid_non_root(lo_id) || !tree.is_valid_non_root(hi_id) {
            return Err(GrandConvError::InvalidBranchPairSelection {
                u: a,
                v: b,
                reason: "pair references an out-of-range or root node id".to_string(),
            });
        }
        let lo_idx = lo as usize;
        let hi_idx = hi as usize;
        let independent =
            !bit_is_set(&ancestors[hi_idx], lo_idx) && !bit_is_set(&ancestors[lo_idx], hi_idx);
        if !independent {
            return Err(GrandConvError::InvalidBranchPairSelection {
                u: a,
                v: b,
                reason: "one node is an ancestor of the other".to_string(),
            });
        }
        selected_canonical.push((lo_idx, hi_idx));
    }

    let root_idx = tree.root().as_usize().expect("valid root id");
    let mut out = Vec::new();
    for u in 0..nnode {
        if u == root_idx {
            continue;
        }
        for v in (u + 1)..nnode {
            if v == root_idx {
                continue;
            }
            if bit_is_set(&ancestors[v], u) || bit_is_set(&ancestors[u], v) {
                continue;
            }
            let selected = selected_canonical.contains(&(u, v));
            out.push(BranchPair {
                u: NodeId::from(u),
                v: NodeId::from(v),
                selected,
            });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::TreeBuilder;

    fn three_leaf_tree() -> Tree {
        let mut b = TreeBuilder::new();
        let leaf_a = b.add_node(NodeId::from(4usize), vec![], 0.1, Some("A".into()));
        let leaf_b = b.add_node(NodeId::from(3usize), vec![], 0.1, Some("B".into()));
        let leaf_c = b.add_node(NodeId::from(3usize), vec![], 0.1, Some("C".into()));
        let internal = b.add_node(NodeId::from(4usize), vec![leaf_b, leaf_c], 0.2, None);
        b.add_node(NodeId::NULL, vec![leaf_a, internal], 0.0, None);
        b.build().unwrap()
    }

    #[test]
    fn two_leaf_tree_has_one_pair() {
        let mut b = TreeBuilder::new();
        let a = b.add_node(NodeId::from(2usize), vec![], 0.1, Some("A".into()));
        let c = b.add_node(NodeId::from(2usize), vec![], 0.1, Some("B".into()));
        b.add_node(NodeId::NULL, vec![a, c], 0.0, None);
        let tree = b.build().unwrap();
        let pairs = enumerate_branch_pairs(&tree, &[]).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].u, NodeId::from(0usize));
        assert_eq!(pairs[0].v, NodeId::from(1usize));
    }

    #[test]
    fn three_leaf_tree_excludes_ancestor_pairs() {
        let tree = three_leaf_tree();
        let pairs = enumerate_branch_pairs(&tree, &[]).unwrap();
        // leaves: 0(A), 1(B), 2(C); internal: 3; root: 4 (excluded).
        // independent pairs: (0,1),(0,2),(0,3),(1,2). (1,3) and (2,3) are
        // ancestor pairs and must be excluded.
        let as_tuples: Vec<(i64, i64)> = pairs.iter().map(|p| (p.u.into(), p.v.into())).collect();
        assert_eq!(as_tuples, vec![(0, 1), (0, 2), (0, 3), (1, 2)]);
    }

    #[test]
    fn no_pair_is_self_paired() {
        let tree = three_leaf_tree();
        let pairs = enumerate_branch_pairs(&tree, &[]).unwrap();
        assert!(pairs.iter().all(|p| p.u != p.v));
    }

    #[test]
    fn rejects_non_independent_selection() {
        let tree = three_leaf_tree();
        // (1, 3): leaf B is a descendant of internal node 3.
        let err = enumerate_branch_pairs(&tree, &[(1, 3)]).unwrap_err();
        assert!(matches!(
            err,
            GrandConvError::InvalidBranchPairSelection { .. }
        ));
    }

    #[test]
    fn rejects_out_of_range_selection() {
        let tree = three_leaf_tree();
        let err = enumerate_branch_pairs(&tree, &[(0, 99)]).unwrap_err();
        assert!(matches!(
            err,
            GrandConvError::InvalidBranchPairSelection { .. }
        ));
    }

    #[test]
    fn selection_is_marked_regardless_of_argument_order() {
        let tree = three_leaf_tree();
        let pairs = enumerate_branch_pairs(&tree, &[(2, 0)]).unwrap();
        let marked: Vec<_> = pairs.iter().filter(|p| p.selected).collect();
        assert_eq!(marked.len(), 1);
        assert_eq!(marked[0].u, NodeId::from(0usize));
        assert_eq!(marked[0].v, NodeId::from(2usize));
    }
}
