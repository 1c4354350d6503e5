/*!
 * Score Evaluator
 * Badness heuristic: how much memory a candidate would give back and how
 * desirable it is to kill it
 */

use crate::core::types::{CgroupId, NodeMask, Pages};
use std::sync::Arc;

use super::process::{find_live_thread, ProcessRecord};
use super::traits::ProcessDirectory;
use super::types::SCORE_ADJ_NEVER_KILL;

/// Whether the task may be considered as a victim at all.
///
/// Global init and kernel-internal tasks are never adequate; a cgroup
/// scope excludes non-members; a task none of whose threads can allocate
/// from the constrained nodes would not free anything useful.
pub fn eligible(
    task: &Arc<ProcessRecord>,
    directory: &dyn ProcessDirectory,
    cgroup: Option<CgroupId>,
    mask: NodeMask,
) -> bool {
    if task.is_global_init() || task.is_kernel_internal() {
        return false;
    }
    if let Some(cgroup) = cgroup {
        if task.cgroup() != cgroup {
            return false;
        }
    }
    directory
        .threads_of(task.tgid())
        .iter()
        .any(|thread| thread.mems_allowed().intersects(mask))
}

/// Compute the badness score for one candidate.
///
/// Returns `None` for candidates that must not be scored at all: the
/// ineligible, groups with no live address space, never-kill adjustment,
/// an already-reaped space, or a mid-vfork handoff. An eligible candidate
/// never scores below 1, so the selector can use the absence as "no
/// score" without ambiguity.
///
/// The baseline is the proportion of memory the task's resident set, page
/// tables, and swap use. Privileged tasks get a 3% discount, and the
/// policy adjustment is normalized against the constrained total.
pub fn badness(
    task: &Arc<ProcessRecord>,
    directory: &dyn ProcessDirectory,
    cgroup: Option<CgroupId>,
    mask: NodeMask,
    total_pages: Pages,
) -> Option<u64> {
    if !eligible(task, directory, cgroup, mask) {
        return None;
    }

    let task = find_live_thread(directory, task)?;
    let space = task.space()?;

    let adj = i64::from(task.score_adj());
    if adj == i64::from(SCORE_ADJ_NEVER_KILL) || space.is_reaped() || task.in_vfork() {
        return None;
    }

    let mut points = (space.rss() + space.swap_ents() + space.page_table_pages()) as i64;

    // Administrative privilege earns a 3% bonus
    if task.privileged() {
        points -= points * 3 / 100;
    }

    // Normalize the adjustment to the constrained memory universe
    points += adj * (total_pages / 1000) as i64;

    Some(points.max(1) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oom::process::{AddressSpace, Region};
    use crate::oom::table::ProcessTable;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const TOTAL_PAGES: Pages = 100_000;

    fn process_with_rss(table: &ProcessTable, pid: u32, rss: Pages) -> Arc<ProcessRecord> {
        let task = table.insert(ProcessRecord::new(pid, pid, 1000, format!("task-{pid}")));
        let space = AddressSpace::new(u64::from(pid));
        space.map_region(Region::anonymous(rss));
        task.attach_space(&space);
        task
    }

    #[test]
    fn score_is_resident_plus_swap_plus_page_tables() {
        let table = ProcessTable::new();
        let task = process_with_rss(&table, 1, 1000);
        // Scenario A: rss=1000, swap=0, adj=0, total=100000
        assert_eq!(
            badness(&task, &table, None, NodeMask::all(), TOTAL_PAGES),
            Some(1000)
        );

        task.space().unwrap().add_swap_ents(200);
        task.space().unwrap().add_page_table_pages(50);
        assert_eq!(
            badness(&task, &table, None, NodeMask::all(), TOTAL_PAGES),
            Some(1250)
        );
    }

    #[test]
    fn never_kill_adjustment_is_not_scored() {
        let table = ProcessTable::new();
        let task = table.insert(
            ProcessRecord::new(2, 2, 1000, "pinned").with_score_adj(SCORE_ADJ_NEVER_KILL),
        );
        let space = AddressSpace::new(2);
        space.map_region(Region::anonymous(1000));
        task.attach_space(&space);

        // Scenario B: nonzero usage but the sentinel makes it absent
        assert_eq!(
            badness(&task, &table, None, NodeMask::all(), TOTAL_PAGES),
            None
        );
    }

    #[test]
    fn privileged_scores_below_identical_unprivileged() {
        let table = ProcessTable::new();
        let plain = process_with_rss(&table, 3, 5000);
        let admin = table.insert(ProcessRecord::new(4, 4, 0, "admin").with_privilege());
        let space = AddressSpace::new(4);
        space.map_region(Region::anonymous(5000));
        admin.attach_space(&space);

        let plain_score = badness(&plain, &table, None, NodeMask::all(), TOTAL_PAGES).unwrap();
        let admin_score = badness(&admin, &table, None, NodeMask::all(), TOTAL_PAGES).unwrap();
        assert!(admin_score < plain_score);
        assert_eq!(admin_score, 5000 - 5000 * 3 / 100);
    }

    #[test]
    fn adjustment_normalizes_against_total_pages() {
        let table = ProcessTable::new();
        let task = table.insert(ProcessRecord::new(5, 5, 1000, "adjusted").with_score_adj(300));
        let space = AddressSpace::new(5);
        space.map_region(Region::anonymous(1000));
        task.attach_space(&space);

        assert_eq!(
            badness(&task, &table, None, NodeMask::all(), TOTAL_PAGES),
            Some(1000 + 300 * 100)
        );
    }

    #[test]
    fn kernel_internal_and_init_are_ineligible() {
        let table = ProcessTable::new();
        let init = table.insert(ProcessRecord::new(1, 1, 0, "init").with_global_init());
        let worker = table.insert(ProcessRecord::new(6, 6, 0, "kworker").with_kernel_internal());
        for task in [init, worker] {
            let space = AddressSpace::new(u64::from(task.pid()));
            space.map_region(Region::anonymous(10_000));
            task.attach_space(&space);
            assert_eq!(
                badness(&task, &table, None, NodeMask::all(), TOTAL_PAGES),
                None
            );
        }
    }

    #[test]
    fn cgroup_scope_excludes_non_members() {
        let table = ProcessTable::new();
        let member = table.insert(ProcessRecord::new(10, 10, 1000, "member").with_cgroup(7));
        let outsider = table.insert(ProcessRecord::new(11, 11, 1000, "outsider").with_cgroup(9));
        for task in [&member, &outsider] {
            let space = AddressSpace::new(u64::from(task.pid()));
            space.map_region(Region::anonymous(1000));
            task.attach_space(&space);
        }

        assert_eq!(
            badness(&outsider, &table, Some(7), NodeMask::all(), TOTAL_PAGES),
            None
        );
        assert_eq!(
            badness(&member, &table, Some(7), NodeMask::all(), TOTAL_PAGES),
            Some(1000)
        );
        // Unscoped invocations score everyone
        assert!(badness(&outsider, &table, None, NodeMask::all(), TOTAL_PAGES).is_some());
    }

    #[test]
    fn reaped_space_is_not_scored() {
        let table = ProcessTable::new();
        let task = process_with_rss(&table, 7, 1000);
        task.space().unwrap().mark_reaped();
        assert_eq!(
            badness(&task, &table, None, NodeMask::all(), TOTAL_PAGES),
            None
        );
    }

    #[test]
    fn no_intersection_with_constraint_mask_is_ineligible() {
        let table = ProcessTable::new();
        let task = table.insert(
            ProcessRecord::new(8, 8, 1000, "pinned-node").with_mems_allowed(NodeMask::single(0)),
        );
        let space = AddressSpace::new(8);
        space.map_region(Region::anonymous(1000));
        task.attach_space(&space);

        assert_eq!(
            badness(&task, &table, None, NodeMask::single(1), TOTAL_PAGES),
            None
        );
        assert!(badness(&task, &table, None, NodeMask::single(0), TOTAL_PAGES).is_some());
    }

    proptest! {
        // Eligible candidates never report 0, no matter how hostile the
        // adjustment or how small the resident set
        #[test]
        fn eligible_score_is_at_least_one(
            rss in 0u64..1_000_000,
            adj in -999i16..=1000,
            privileged in any::<bool>(),
            total in 0u64..10_000_000,
        ) {
            let table = ProcessTable::new();
            let mut record = ProcessRecord::new(9, 9, 1000, "prop").with_score_adj(adj);
            if privileged {
                record = record.with_privilege();
            }
            let task = table.insert(record);
            let space = AddressSpace::new(9);
            space.map_region(Region::anonymous(rss));
            task.attach_space(&space);

            let score = badness(&task, &table, None, NodeMask::all(), total);
            prop_assert!(score.is_some());
            prop_assert!(score.unwrap() >= 1);
        }
    }
}
