/*!
 * Constraint Resolver
 * Classifies how narrow an allocation failure actually was
 */

use crate::core::types::Pages;

use super::traits::MemoryTopology;
use super::types::{AllocationContext, Constraint, ConstraintKind};

/// Resolve the scope of a failed allocation and the size of the memory
/// universe it could have drawn from.
///
/// A never-fail allocation cannot safely narrow the victim pool, so it is
/// always treated as unconstrained. A policy mask that does not cover all
/// present nodes limits the universe to swap plus the pages spanned by the
/// mask; an administrative node restriction does the same over the allowed
/// set.
pub fn resolve(ctx: &AllocationContext, topology: &dyn MemoryTopology) -> Constraint {
    let total = topology.total_ram_pages() + topology.total_swap_pages();
    if ctx.never_fail {
        return Constraint::unconstrained(total);
    }

    let present = topology.present_nodes();
    if let Some(mask) = ctx.nodemask {
        if !present.is_subset_of(mask) {
            let spanned: Pages = mask.iter().map(|node| topology.node_spanned_pages(node)).sum();
            return Constraint {
                kind: ConstraintKind::PolicyConstrained,
                total_pages: topology.total_swap_pages() + spanned,
                mask: Some(mask),
            };
        }
    }

    let allowed = topology.allowed_nodes();
    if !present.is_subset_of(allowed) {
        let spanned: Pages = allowed
            .iter()
            .map(|node| topology.node_spanned_pages(node))
            .sum();
        return Constraint {
            kind: ConstraintKind::NodeSetConstrained,
            total_pages: topology.total_swap_pages() + spanned,
            mask: None,
        };
    }

    Constraint::unconstrained(total)
}
