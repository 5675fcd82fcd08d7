//! Integer id newtypes.
//!
//! Follows the pattern of `tskit`'s row-id types: a thin wrapper around
//! a signed integer with a `NULL` sentinel, ordering against the raw
//! integer, and cheap conversions, so call sites read `NodeId` rather
//! than a bare `i64` at every boundary.

use serde::Serialize;
use std::fmt;

/// A node id in `[0, nnode)`, or [`NodeId::NULL`] for "no parent".
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(transparent)]
pub struct NodeId(i64);

impl Default for NodeId {
    fn default() -> Self {
        Self::NULL
    }
}

impl NodeId {
    /// Sentinel used for the root's father and for "not found" lookups.
    pub const NULL: NodeId = NodeId(-1);

    /// Returns `true` if this id is [`NodeId::NULL`].
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    /// The underlying integer, e.g. for use as a `Vec` index once
    /// non-negativity has been established.
    pub fn as_usize(self) -> Option<usize> {
        if self.0 < 0 {
            None
        } else {
            Some(self.0 as usize)
        }
    }
}

impl From<i64> for NodeId {
    fn from(value: i64) -> Self {
        NodeId(value)
    }
}

impl From<usize> for NodeId {
    fn from(value: usize) -> Self {
        NodeId(value as i64)
    }
}

impl From<NodeId> for i64 {
    fn from(value: NodeId) -> Self {
        value.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a site within the alignment, `[0, numSites)`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SiteIndex(usize);

impl From<usize> for SiteIndex {
    fn from(value: usize) -> Self {
        SiteIndex(value)
    }
}

impl From<SiteIndex> for usize {
    fn from(value: SiteIndex) -> Self {
        value.0
    }
}

impl fmt::Display for SiteIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index into the enumerated branch-pair sequence, `[0, numBranchPairs)`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct BranchPairIndex(usize);

impl From<usize> for BranchPairIndex {
    fn from(value: usize) -> Self {
        BranchPairIndex(value)
    }
}

impl From<BranchPairIndex> for usize {
    fn from(value: BranchPairIndex) -> Self {
        value.0
    }
}

impl fmt::Display for BranchPairIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
