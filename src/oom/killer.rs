/*!
 * Killer
 * Marks the chosen victim, substitutes a child when that frees more, and
 * terminates every process sharing the victim's address space
 */

use crate::core::types::{CgroupId, NodeMask, Pages, Pid};
use log::{error, info};
use std::collections::HashSet;
use std::sync::Arc;

use super::badness::badness;
use super::process::{find_live_thread, shares_space, will_free_mem, ProcessRecord};
use super::reaper::OomReaper;
use super::service::OomState;
use super::traits::{ProcessDirectory, SignalSender};

/// What the kill path actually did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KillOutcome {
    /// The candidate was already on its way out; marked and queued for
    /// reaping without signaling
    MarkedExiting(Pid),
    /// A victim was signal-killed
    Killed {
        victim: Pid,
        sacrificed: bool,
        reap_queued: bool,
    },
    /// The candidate exited before a signal could be delivered
    VictimVanished,
}

pub(crate) struct Killer {
    directory: Arc<dyn ProcessDirectory>,
    signals: Arc<dyn SignalSender>,
}

impl Killer {
    pub(crate) fn new(
        directory: Arc<dyn ProcessDirectory>,
        signals: Arc<dyn SignalSender>,
    ) -> Self {
        Self { directory, signals }
    }

    /// Kill `candidate` or a better child of it. Must run under the
    /// triage lock.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn kill(
        &self,
        state: &OomState,
        reaper: &OomReaper,
        candidate: &Arc<ProcessRecord>,
        points: u64,
        cgroup: Option<CgroupId>,
        mask: NodeMask,
        total_pages: Pages,
        reason: &str,
    ) -> KillOutcome {
        // An exiting candidate just needs the mark so it can die quickly;
        // no reason to alarm anyone or touch its children
        if will_free_mem(&*self.directory, candidate) {
            state.mark_victim(candidate);
            reaper.wake(candidate);
            return KillOutcome::MarkedExiting(candidate.pid());
        }

        error!(
            "{}: kill process {} ({}) score {} or sacrifice child",
            reason,
            candidate.pid(),
            candidate.name(),
            points
        );

        // Sacrifice: a child with its own address space and a higher
        // score loses less work for the same pages
        let mut victim = candidate.clone();
        let mut victim_points = points;
        let mut sacrificed = false;
        let candidate_space = candidate.space();
        for thread in self.directory.threads_of(candidate.tgid()) {
            for child in self.directory.children_of(thread.pid()) {
                if let Some(space) = &candidate_space {
                    if shares_space(&*self.directory, &child, space) {
                        continue;
                    }
                }
                let Some(child_points) =
                    badness(&child, &*self.directory, cgroup, mask, total_pages)
                else {
                    continue;
                };
                if child_points > victim_points {
                    victim = child;
                    victim_points = child_points;
                    sacrificed = true;
                }
            }
        }
        if sacrificed {
            info!(
                "sacrificing child {} ({}) score {} for parent {}",
                victim.pid(),
                victim.name(),
                victim_points,
                candidate.pid()
            );
        }

        // The settled victim may have detached its space already; another
        // thread of its group keeps the kill meaningful
        let Some(victim) = find_live_thread(&*self.directory, &victim) else {
            return KillOutcome::VictimVanished;
        };
        // Durable reference: the space must stay comparable even after
        // the victim starts tearing itself down
        let Some(space) = victim.space() else {
            return KillOutcome::VictimVanished;
        };

        // Signal before the victim mark, so the victim cannot widen its
        // access to memory reserves before being flagged for death
        self.signals.force_kill(&victim);
        state.mark_victim(&victim);
        error!(
            "killed process {} ({}) total-vm:{} pages, anon-rss:{}, file-rss:{}, shmem-rss:{}",
            victim.pid(),
            victim.name(),
            space.total_vm(),
            space.anon_pages(),
            space.file_pages(),
            space.shmem_pages()
        );

        // Everyone else using the same address space dies too; otherwise
        // a sharer contending on it could livelock the exit. Privileged
        // infrastructure stays alive, which makes reaping unsafe: the
        // pages would still be in use. Each group is handled once through
        // whichever of its records the snapshot carries.
        let mut reap_queued = true;
        let mut seen_groups = HashSet::new();
        for other in self.directory.processes() {
            if other.tgid() == victim.tgid() || !seen_groups.insert(other.tgid()) {
                continue;
            }
            if !shares_space(&*self.directory, &other, &space) {
                continue;
            }
            if other.is_kernel_internal() || other.is_global_init() {
                reap_queued = false;
                continue;
            }
            self.signals.force_kill(&other);
        }

        if reap_queued {
            reaper.wake(&victim);
        }

        KillOutcome::Killed {
            victim: victim.pid(),
            sacrificed,
            reap_queued,
        }
    }
}
