/*!
 * Collaborator Traits
 * Seams to the host process model, memory topology, and signal delivery
 */

use crate::core::types::{NodeId, NodeMask, Pages, Pid};
use std::sync::Arc;

use super::process::{AddressSpace, ProcessRecord, Region};

/// Read-only view of the host's process/thread registry
///
/// The triage service never owns this structure; the host backs it with
/// whatever concurrent snapshot mechanism its process model provides.
pub trait ProcessDirectory: Send + Sync {
    /// Snapshot of every live task, threads included
    fn processes(&self) -> Vec<Arc<ProcessRecord>>;

    /// All tasks belonging to one thread group, leader first
    fn threads_of(&self, tgid: Pid) -> Vec<Arc<ProcessRecord>>;

    /// Direct children of one task
    fn children_of(&self, pid: Pid) -> Vec<Arc<ProcessRecord>>;
}

/// Memory layout of the host: present nodes, their sizes, and the
/// administrative restriction in effect for the allocating context
pub trait MemoryTopology: Send + Sync {
    fn present_nodes(&self) -> NodeMask;

    fn node_spanned_pages(&self, node: NodeId) -> Pages;

    fn total_ram_pages(&self) -> Pages;

    fn total_swap_pages(&self) -> Pages;

    /// Administrative (node-set policy) restriction for the caller;
    /// defaults to no restriction
    fn allowed_nodes(&self) -> NodeMask {
        self.present_nodes()
    }
}

/// Forced fatal signal delivery
pub trait SignalSender: Send + Sync {
    /// Deliver a forced fatal signal to the task; must not block
    fn force_kill(&self, process: &ProcessRecord);
}

/// Capability to invalidate and unmap the pages of one region
pub trait RegionUnmapper: Send + Sync {
    /// Unmap the region's pages from the space; returns pages reclaimed
    fn unmap(&self, space: &AddressSpace, region: &Region) -> Pages;
}
