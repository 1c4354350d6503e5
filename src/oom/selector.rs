/*!
 * Victim Selector
 * Scans live tasks and picks the highest-scoring eligible candidate
 */

use crate::core::types::{CgroupId, NodeMask, Pages};
use std::sync::Arc;

use super::badness::{badness, eligible};
use super::process::{will_free_mem, ProcessRecord};
use super::traits::ProcessDirectory;
use super::types::{ScanDecision, Selection};

/// Decide what to do with one task during a selection scan.
///
/// The order matters: ineligible tasks are skipped outright; an existing
/// victim that is still dying blocks the whole scan (it already has access
/// to memory reserves, nobody else should get any) unless the caller
/// forces a kill; tasks with no address space have nothing to give back;
/// the allocation-origin hint wins immediately; a task that will free its
/// memory by itself makes killing pointless this round.
pub fn scan_task(
    task: &Arc<ProcessRecord>,
    directory: &dyn ProcessDirectory,
    cgroup: Option<CgroupId>,
    mask: NodeMask,
    force_kill: bool,
) -> ScanDecision {
    if !eligible(task, directory, cgroup, mask) {
        return ScanDecision::Continue;
    }
    if task.is_victim() && !force_kill {
        return ScanDecision::Abort;
    }
    if task.space().is_none() {
        return ScanDecision::Continue;
    }
    if task.is_alloc_origin() {
        return ScanDecision::Select;
    }
    if will_free_mem(directory, task) && !force_kill {
        return ScanDecision::Abort;
    }
    ScanDecision::Score
}

/// Scan every live task and choose the one with the most points.
///
/// `Select` short-circuits to maximum priority. An `Abort` anywhere
/// cancels the selection entirely; that is distinct from finding nobody,
/// which the caller must treat as fatal. On exact ties the non-leader is
/// preferred as victim, keeping the group leader alive as the more
/// informative reference when reporting.
pub fn select_victim(
    directory: &dyn ProcessDirectory,
    cgroup: Option<CgroupId>,
    mask: NodeMask,
    total_pages: Pages,
    force_kill: bool,
) -> Selection {
    let mut chosen: Option<Arc<ProcessRecord>> = None;
    let mut chosen_points: u64 = 0;

    for task in directory.processes() {
        match scan_task(&task, directory, cgroup, mask, force_kill) {
            ScanDecision::Continue => continue,
            ScanDecision::Abort => return Selection::Aborted,
            ScanDecision::Select => {
                chosen = Some(task);
                chosen_points = u64::MAX;
                continue;
            }
            ScanDecision::Score => {}
        }

        let Some(points) = badness(&task, directory, cgroup, mask, total_pages) else {
            continue;
        };
        if points < chosen_points {
            continue;
        }
        // Exact tie: a leader does not displace the current choice
        if points == chosen_points && task.is_group_leader() {
            continue;
        }
        chosen = Some(task);
        chosen_points = points;
    }

    match chosen {
        Some(process) => Selection::Victim {
            process,
            points: chosen_points,
        },
        None => Selection::NoCandidate,
    }
}

/// Chosen points expressed per mille of the constrained total, for
/// diagnostics
pub(crate) fn normalized_points(points: u64, total_pages: Pages) -> u64 {
    if total_pages == 0 {
        return 0;
    }
    points.saturating_mul(1000) / total_pages
}
