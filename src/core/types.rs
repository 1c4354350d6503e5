/*!
 * Core Types
 * Common scalar types used across the triage service
 */

use serde::{Deserialize, Serialize};

/// Process ID type
pub type Pid = u32;

/// User ID type
pub type Uid = u32;

/// Control-group ID type
pub type CgroupId = u32;

/// Page count type for memory accounting
pub type Pages = u64;

/// Memory node (NUMA) identifier
pub type NodeId = u32;

/// Set of memory nodes, one bit per node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct NodeMask(pub u64);

impl NodeMask {
    /// Mask containing no nodes
    pub const EMPTY: NodeMask = NodeMask(0);

    /// Mask containing every representable node
    #[inline]
    #[must_use]
    pub const fn all() -> Self {
        NodeMask(u64::MAX)
    }

    /// Mask containing a single node; ids at or past the 64-node capacity
    /// are not representable
    #[inline]
    #[must_use]
    pub const fn single(node: NodeId) -> Self {
        debug_assert!(node < u64::BITS);
        NodeMask(1 << (node % u64::BITS))
    }

    /// Mask containing the given nodes
    #[must_use]
    pub fn of(nodes: &[NodeId]) -> Self {
        let mut mask = NodeMask::EMPTY;
        for &node in nodes {
            mask.insert(node);
        }
        mask
    }

    #[inline]
    pub fn insert(&mut self, node: NodeId) {
        debug_assert!(node < u64::BITS);
        self.0 |= 1 << (node % u64::BITS);
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, node: NodeId) -> bool {
        node < u64::BITS && self.0 & (1 << node) != 0
    }

    #[inline]
    #[must_use]
    pub const fn intersects(&self, other: NodeMask) -> bool {
        self.0 & other.0 != 0
    }

    /// True when every node in `self` is also in `other`
    #[inline]
    #[must_use]
    pub const fn is_subset_of(&self, other: NodeMask) -> bool {
        self.0 & !other.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterate the node ids present in the mask
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        let bits = self.0;
        (0..u64::BITS).filter(move |&n| bits & (1 << n) != 0)
    }
}
