/*!
 * Triage Service
 * Process-wide entry points: trigger, enable/disable, victim accounting,
 * and diagnostics
 */

use crate::core::types::{CgroupId, NodeMask, Pages};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::constraint::resolve;
use super::killer::{KillOutcome, Killer};
use super::notifier::{NotifierCallback, NotifierChain};
use super::process::{find_live_thread, will_free_mem, ProcessRecord};
use super::reaper::OomReaper;
use super::selector::{normalized_points, select_victim};
use super::traits::{MemoryTopology, ProcessDirectory, RegionUnmapper, SignalSender};
use super::types::{
    AllocationContext, Constraint, ConstraintKind, FatalOom, NotifierId, PanicPolicy, Selection,
    TriageConfig, TriageResult, TriageStats, SCORE_ADJ_NEVER_KILL,
};

/// Shared synchronized state: the global triage lock, the disable gate,
/// and the in-flight victim counter
pub(crate) struct OomState {
    /// Serializes every selection-and-kill sequence and every individual
    /// reap attempt; only one "decide who dies" or "reclaim this space"
    /// proceeds at a time system-wide
    pub(crate) triage_lock: Arc<Mutex<()>>,
    killer_disabled: AtomicBool,
    victims_in_flight: AtomicUsize,
    drain_lock: Mutex<()>,
    drained: Condvar,
}

impl OomState {
    pub(crate) fn new() -> Self {
        Self {
            triage_lock: Arc::new(Mutex::new(())),
            killer_disabled: AtomicBool::new(false),
            victims_in_flight: AtomicUsize::new(0),
            drain_lock: Mutex::new(()),
            drained: Condvar::new(),
        }
    }

    /// Mark a victim; re-marking is a no-op and leaves the counter alone
    pub(crate) fn mark_victim(&self, task: &Arc<ProcessRecord>) {
        if task.mark_victim() {
            self.victims_in_flight.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Note a marked victim's exit; decrements exactly once per process
    /// that was ever marked. Runs on arbitrary exiting threads, so it
    /// must never touch the triage lock.
    fn victim_exited(&self, task: &Arc<ProcessRecord>) {
        if !task.clear_victim() {
            return;
        }
        if self.victims_in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _drain = self.drain_lock.lock();
            self.drained.notify_all();
        }
    }

    fn in_flight(&self) -> usize {
        self.victims_in_flight.load(Ordering::Acquire)
    }

    /// Block until every in-flight victim has exited or the timeout
    /// elapses; true when drained
    fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut drain = self.drain_lock.lock();
        while self.in_flight() != 0 {
            if self.drained.wait_until(&mut drain, deadline).timed_out() {
                return self.in_flight() == 0;
            }
        }
        true
    }
}

#[derive(Default)]
struct Counters {
    kills: AtomicU64,
    sacrifices: AtomicU64,
    notifier_rescues: AtomicU64,
    aborted_scans: AtomicU64,
    fast_path_marks: AtomicU64,
}

/// Memory-pressure triage service
///
/// One instance per host. The allocator calls [`trigger`](Self::trigger)
/// when reclaim has failed; the process-exit path calls
/// [`notify_victim_exited`](Self::notify_victim_exited) exactly once per
/// marked victim.
pub struct OomService {
    config: TriageConfig,
    state: OomState,
    directory: Arc<dyn ProcessDirectory>,
    topology: Arc<dyn MemoryTopology>,
    notifiers: NotifierChain,
    killer: Killer,
    reaper: OomReaper,
    stats: Counters,
}

impl OomService {
    #[must_use]
    pub fn new(
        directory: Arc<dyn ProcessDirectory>,
        topology: Arc<dyn MemoryTopology>,
        signals: Arc<dyn SignalSender>,
        unmapper: Arc<dyn RegionUnmapper>,
        config: TriageConfig,
    ) -> Self {
        let state = OomState::new();
        let reaper = OomReaper::spawn(
            directory.clone(),
            unmapper,
            state.triage_lock.clone(),
            config.reap_retries,
            config.reap_retry_delay,
        );
        let killer = Killer::new(directory.clone(), signals);
        info!(
            "oom triage service initialized (panic policy: {}, reap retries: {})",
            config.panic_policy, config.reap_retries
        );
        Self {
            config,
            state,
            directory,
            topology,
            notifiers: NotifierChain::new(),
            killer,
            reaper,
            stats: Counters::default(),
        }
    }

    /// Run the full triage sequence for a failed allocation.
    ///
    /// Returns whether the caller should retry the allocation. `Ok(false)`
    /// means the killer is disabled and allocation should be treated as
    /// unconditionally failing. A fatal outcome means the host must stop.
    pub fn trigger(&self, ctx: &AllocationContext) -> TriageResult<bool> {
        let guard = self.state.triage_lock.lock();
        self.triage(ctx, guard)
    }

    /// Like [`trigger`](Self::trigger), but backs off when a parallel
    /// triage is already in progress (the page-fault path)
    pub fn try_trigger(&self, ctx: &AllocationContext) -> TriageResult<bool> {
        match self.state.triage_lock.try_lock() {
            Some(guard) => self.triage(ctx, guard),
            // Somebody else is already killing; let them finish
            None => Ok(true),
        }
    }

    fn triage(&self, ctx: &AllocationContext, _guard: MutexGuard<'_, ()>) -> TriageResult<bool> {
        if self.state.killer_disabled.load(Ordering::Acquire) {
            return Ok(false);
        }

        // One chance for other subsystems to free memory before any kill
        let freed = self.notifiers.call_chain();
        if freed > 0 {
            self.stats.notifier_rescues.fetch_add(1, Ordering::AcqRel);
            info!("oom averted: notifiers freed {} pages", freed);
            return Ok(true);
        }

        // A caller that is already exiting just needs to be allowed to
        // finish; mark it so it can die quickly
        if will_free_mem(&*self.directory, &ctx.caller) {
            self.state.mark_victim(&ctx.caller);
            self.reaper.wake(&ctx.caller);
            self.stats.fast_path_marks.fetch_add(1, Ordering::AcqRel);
            return Ok(true);
        }

        let constraint = resolve(ctx, &*self.topology);
        self.check_panic_policy(ctx, &constraint)?;

        let cgroup: Option<CgroupId> = None;
        let mask = constraint.mask.unwrap_or_else(|| ctx.caller.mems_allowed());

        if self.config.kill_allocating_caller
            && ctx.caller.space().is_some()
            && ctx.caller.score_adj() != SCORE_ADJ_NEVER_KILL
            && super::badness::eligible(&ctx.caller, &*self.directory, cgroup, mask)
        {
            self.dump_header(ctx, &constraint, mask);
            self.kill_and_pause(
                &ctx.caller,
                0,
                cgroup,
                mask,
                constraint.total_pages,
                "out of memory (kill_allocating_caller)",
            );
            return Ok(true);
        }

        match select_victim(
            &*self.directory,
            cgroup,
            mask,
            constraint.total_pages,
            ctx.force_kill,
        ) {
            Selection::Aborted => {
                self.stats.aborted_scans.fetch_add(1, Ordering::AcqRel);
                debug!("victim selection aborted: a concurrent victim is still exiting");
                Ok(true)
            }
            Selection::NoCandidate => {
                self.dump_header(ctx, &constraint, mask);
                error!("out of memory and no killable processes");
                Err(FatalOom::NoKillableProcess)
            }
            Selection::Victim { process, points } => {
                self.dump_header(ctx, &constraint, mask);
                info!(
                    "selected victim pid {} ({}) points {} ({} per mille of total)",
                    process.pid(),
                    process.name(),
                    points,
                    normalized_points(points, constraint.total_pages)
                );
                self.kill_and_pause(
                    &process,
                    points,
                    cgroup,
                    mask,
                    constraint.total_pages,
                    "out of memory",
                );
                Ok(true)
            }
        }
    }

    fn kill_and_pause(
        &self,
        candidate: &Arc<ProcessRecord>,
        points: u64,
        cgroup: Option<CgroupId>,
        mask: NodeMask,
        total_pages: Pages,
        reason: &str,
    ) {
        match self.killer.kill(
            &self.state,
            &self.reaper,
            candidate,
            points,
            cgroup,
            mask,
            total_pages,
            reason,
        ) {
            KillOutcome::Killed { sacrificed, .. } => {
                self.stats.kills.fetch_add(1, Ordering::AcqRel);
                if sacrificed {
                    self.stats.sacrifices.fetch_add(1, Ordering::AcqRel);
                }
                // Give the killed process a chance to exit before the
                // caller retries its allocation
                thread::sleep(self.config.post_kill_pause);
            }
            KillOutcome::MarkedExiting(_) => {
                self.stats.fast_path_marks.fetch_add(1, Ordering::AcqRel);
            }
            KillOutcome::VictimVanished => {}
        }
    }

    fn check_panic_policy(
        &self,
        ctx: &AllocationContext,
        constraint: &Constraint,
    ) -> TriageResult<()> {
        let policy = self.config.panic_policy;
        if policy == PanicPolicy::Never {
            return Ok(());
        }
        // A system-wide policy does not fire for policy or node-set
        // constrained failures; only compulsory does
        if policy == PanicPolicy::Unconstrained && constraint.kind != ConstraintKind::None {
            return Ok(());
        }
        self.dump_header(ctx, constraint, ctx.caller.mems_allowed());
        error!("out of memory: {} panic policy is enabled", policy);
        Err(FatalOom::PanicPolicyTriggered { policy })
    }

    /// Register a memory-freed notifier; runs before every selection
    pub fn register_notifier(&self, callback: NotifierCallback) -> NotifierId {
        self.notifiers.register(callback)
    }

    /// Remove a previously registered notifier
    pub fn unregister_notifier(&self, id: NotifierId) -> bool {
        self.notifiers.unregister(id)
    }

    /// Fast path for a caller that recognizes it is already exiting:
    /// mark it and hand it to the reaper without any selection
    pub fn mark_self_victim(&self, process: &Arc<ProcessRecord>) {
        let _guard = self.state.triage_lock.lock();
        self.state.mark_victim(process);
        self.reaper.wake(process);
    }

    /// Must be called exactly once when a marked victim's last observable
    /// work is done. Never blocks.
    pub fn notify_victim_exited(&self, process: &Arc<ProcessRecord>) {
        self.state.victim_exited(process);
    }

    /// Disable the killer and wait for in-flight victims to drain.
    ///
    /// Refuses when the calling task is itself a marked victim. On
    /// timeout the killer is re-enabled and `false` is returned. While
    /// disabled, every `trigger` reports `Ok(false)`.
    pub fn disable_killer(&self, current: &Arc<ProcessRecord>, timeout: Duration) -> bool {
        {
            // Do not race an ongoing triage, and never let a victim turn
            // the killer off
            let _guard = self.state.triage_lock.lock();
            if current.is_victim() {
                return false;
            }
            self.state.killer_disabled.store(true, Ordering::Release);
        }

        if !self.state.wait_drained(timeout) {
            warn!("oom killer disable timed out with victims still in flight");
            self.enable_killer();
            return false;
        }
        info!("oom killer disabled");
        true
    }

    /// Re-enable the killer unconditionally
    pub fn enable_killer(&self) {
        self.state.killer_disabled.store(false, Ordering::Release);
        info!("oom killer enabled");
    }

    pub fn is_killer_disabled(&self) -> bool {
        self.state.killer_disabled.load(Ordering::Acquire)
    }

    /// Victims marked but not yet observed to exit
    pub fn victims_in_flight(&self) -> usize {
        self.state.in_flight()
    }

    /// Snapshot of service counters
    pub fn stats(&self) -> TriageStats {
        TriageStats {
            kills: self.stats.kills.load(Ordering::Acquire),
            sacrifices: self.stats.sacrifices.load(Ordering::Acquire),
            notifier_rescues: self.stats.notifier_rescues.load(Ordering::Acquire),
            aborted_scans: self.stats.aborted_scans.load(Ordering::Acquire),
            fast_path_marks: self.stats.fast_path_marks.load(Ordering::Acquire),
            victims_in_flight: self.state.in_flight(),
        }
    }

    /// Diagnostic header plus, when configured, the per-task memory table
    fn dump_header(
        &self,
        ctx: &AllocationContext,
        constraint: &Constraint,
        mask: NodeMask,
    ) {
        warn!(
            "{} (pid {}) invoked oom-killer: order={}, nodemask={:?}, constraint={:?}, score_adj={}",
            ctx.caller.name(),
            ctx.caller.pid(),
            ctx.order,
            ctx.nodemask,
            constraint.kind,
            ctx.caller.score_adj()
        );
        if self.config.dump_tasks {
            self.dump_tasks(mask);
        }
    }

    fn dump_tasks(&self, mask: NodeMask) {
        info!("[  pid  ]   uid  tgid total_vm      rss pgtables swapents score_adj name");
        for task in self.directory.processes() {
            if !task.is_group_leader() {
                continue;
            }
            if !super::badness::eligible(&task, &*self.directory, None, mask) {
                continue;
            }
            // Groups whose every thread has detached cannot be killed
            // anyway; no need to report them
            let Some(live) = find_live_thread(&*self.directory, &task) else {
                continue;
            };
            let Some(space) = live.space() else {
                continue;
            };
            info!(
                "[{:7}] {:5} {:5} {:8} {:8} {:8} {:8} {:9} {}",
                live.pid(),
                live.uid(),
                live.tgid(),
                space.total_vm(),
                space.rss(),
                space.page_table_pages(),
                space.swap_ents(),
                live.score_adj(),
                live.name()
            );
        }
    }
}
