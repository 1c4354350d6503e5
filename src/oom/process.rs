/*!
 * Process and Address-Space Records
 * The triage-facing view of tasks and the memory they own
 */

use crate::core::types::{CgroupId, NodeMask, Pages, Pid, Uid};
use arc_swap::ArcSwapOption;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use super::traits::ProcessDirectory;

/// Backing of a mapped region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionBacking {
    Anonymous,
    File { shared: bool },
}

/// One mapped region of an address space
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Region {
    pub pages: Pages,
    pub backing: RegionBacking,
    pub huge: bool,
    pub locked: bool,
}

impl Region {
    #[must_use]
    pub fn anonymous(pages: Pages) -> Self {
        Self {
            pages,
            backing: RegionBacking::Anonymous,
            huge: false,
            locked: false,
        }
    }

    #[must_use]
    pub fn file(pages: Pages, shared: bool) -> Self {
        Self {
            pages,
            backing: RegionBacking::File { shared },
            huge: false,
            locked: false,
        }
    }

    #[must_use]
    pub fn with_huge_pages(mut self) -> Self {
        self.huge = true;
        self
    }

    /// Explicitly pinned; the reaper must leave it alone
    #[must_use]
    pub fn with_locked(mut self) -> Self {
        self.locked = true;
        self
    }

    /// Only anonymous and private regions can be dropped without extra
    /// steps; huge-page-backed and pinned regions are always skipped
    #[inline]
    pub(crate) fn reapable(&self) -> bool {
        if self.huge || self.locked {
            return false;
        }
        matches!(
            self.backing,
            RegionBacking::Anonymous | RegionBacking::File { shared: false }
        )
    }
}

/// Address space shared by every task that attached to it
///
/// The `users` counter tracks attached tasks; the last detach tears the
/// region table down. `reaped` and `unreapable` are sticky.
pub struct AddressSpace {
    id: u64,
    users: AtomicUsize,
    anon_pages: AtomicU64,
    file_pages: AtomicU64,
    shmem_pages: AtomicU64,
    swap_ents: AtomicU64,
    page_table_pages: AtomicU64,
    total_vm: AtomicU64,
    reaped: AtomicBool,
    unreapable: AtomicBool,
    external_observers: AtomicBool,
    pub(crate) regions: RwLock<Vec<Region>>,
}

impl AddressSpace {
    #[must_use]
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            users: AtomicUsize::new(0),
            anon_pages: AtomicU64::new(0),
            file_pages: AtomicU64::new(0),
            shmem_pages: AtomicU64::new(0),
            swap_ents: AtomicU64::new(0),
            page_table_pages: AtomicU64::new(0),
            total_vm: AtomicU64::new(0),
            reaped: AtomicBool::new(false),
            unreapable: AtomicBool::new(false),
            external_observers: AtomicBool::new(false),
            regions: RwLock::new(Vec::new()),
        })
    }

    /// Map a region and account its pages to the matching counter
    pub fn map_region(&self, region: Region) {
        match region.backing {
            RegionBacking::Anonymous => {
                self.anon_pages.fetch_add(region.pages, Ordering::AcqRel);
            }
            RegionBacking::File { shared: true } => {
                self.shmem_pages.fetch_add(region.pages, Ordering::AcqRel);
            }
            RegionBacking::File { shared: false } => {
                self.file_pages.fetch_add(region.pages, Ordering::AcqRel);
            }
        }
        self.total_vm.fetch_add(region.pages, Ordering::AcqRel);
        self.regions.write().push(region);
    }

    /// Account pages moved to swap
    pub fn add_swap_ents(&self, pages: Pages) {
        self.swap_ents.fetch_add(pages, Ordering::AcqRel);
    }

    /// Account pages spent on page tables
    pub fn add_page_table_pages(&self, pages: Pages) {
        self.page_table_pages.fetch_add(pages, Ordering::AcqRel);
    }

    /// Drop a region's pages from the resident counters after an unmap;
    /// returns the page count for the caller's accounting
    pub fn note_unmapped(&self, region: &Region) -> Pages {
        let counter = match region.backing {
            RegionBacking::Anonymous => &self.anon_pages,
            RegionBacking::File { shared: true } => &self.shmem_pages,
            RegionBacking::File { shared: false } => &self.file_pages,
        };
        counter.fetch_sub(region.pages, Ordering::AcqRel);
        region.pages
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn users(&self) -> usize {
        self.users.load(Ordering::Acquire)
    }

    pub fn anon_pages(&self) -> Pages {
        self.anon_pages.load(Ordering::Acquire)
    }

    pub fn file_pages(&self) -> Pages {
        self.file_pages.load(Ordering::Acquire)
    }

    pub fn shmem_pages(&self) -> Pages {
        self.shmem_pages.load(Ordering::Acquire)
    }

    pub fn swap_ents(&self) -> Pages {
        self.swap_ents.load(Ordering::Acquire)
    }

    pub fn page_table_pages(&self) -> Pages {
        self.page_table_pages.load(Ordering::Acquire)
    }

    pub fn total_vm(&self) -> Pages {
        self.total_vm.load(Ordering::Acquire)
    }

    /// Resident set: anonymous + file-backed + shared pages
    pub fn rss(&self) -> Pages {
        self.anon_pages() + self.file_pages() + self.shmem_pages()
    }

    #[inline]
    pub fn is_reaped(&self) -> bool {
        self.reaped.load(Ordering::Acquire)
    }

    pub fn mark_reaped(&self) {
        self.reaped.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_unreapable(&self) -> bool {
        self.unreapable.load(Ordering::Acquire)
    }

    /// Sticky-set the unreapable flag; returns whether it was already set
    pub fn mark_unreapable(&self) -> bool {
        self.unreapable.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub fn has_external_observers(&self) -> bool {
        self.external_observers.load(Ordering::Acquire)
    }

    /// Flag active external memory-validity observers (device mappings)
    /// that cannot tolerate racing invalidation
    pub fn set_external_observers(&self, present: bool) {
        self.external_observers.store(present, Ordering::Release);
    }

    pub(crate) fn attach_user(&self) {
        self.users.fetch_add(1, Ordering::AcqRel);
    }

    /// Take an extra user reference, but only while at least one task is
    /// still attached; the exit path may have won the race already
    pub(crate) fn pin_users(&self) -> bool {
        let mut current = self.users.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.users.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Drop a user reference; the last one tears the region table down
    pub fn release_user(&self) {
        if self.users.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.regions.write().clear();
        }
    }
}

impl std::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("users", &self.users())
            .field("rss", &self.rss())
            .field("reaped", &self.is_reaped())
            .field("unreapable", &self.is_unreapable())
            .finish()
    }
}

/// Record of one task as the triage service sees it
///
/// Identity and role fields are fixed at creation by the process model;
/// only the victim mark, the reap-queue mark, and the lifecycle flags
/// change afterwards.
pub struct ProcessRecord {
    pid: Pid,
    tgid: Pid,
    uid: Uid,
    cgroup: CgroupId,
    parent: Option<Pid>,
    name: String,
    score_adj: i16,
    privileged: bool,
    global_init: bool,
    kernel_internal: bool,
    mems_allowed: NodeMask,
    alloc_origin: AtomicBool,
    exiting: AtomicBool,
    coredumping: AtomicBool,
    vforked: AtomicBool,
    victim: AtomicBool,
    pub(crate) reap_queued: AtomicBool,
    space: ArcSwapOption<AddressSpace>,
}

impl ProcessRecord {
    #[must_use]
    pub fn new(pid: Pid, tgid: Pid, uid: Uid, name: impl Into<String>) -> Self {
        Self {
            pid,
            tgid,
            uid,
            cgroup: 0,
            parent: None,
            name: name.into(),
            score_adj: 0,
            privileged: false,
            global_init: false,
            kernel_internal: false,
            mems_allowed: NodeMask::all(),
            alloc_origin: AtomicBool::new(false),
            exiting: AtomicBool::new(false),
            coredumping: AtomicBool::new(false),
            vforked: AtomicBool::new(false),
            victim: AtomicBool::new(false),
            reap_queued: AtomicBool::new(false),
            space: ArcSwapOption::empty(),
        }
    }

    #[must_use]
    pub fn with_parent(mut self, parent: Pid) -> Self {
        self.parent = Some(parent);
        self
    }

    #[must_use]
    pub fn with_score_adj(mut self, adj: i16) -> Self {
        self.score_adj = adj;
        self
    }

    /// Grant elevated administrative privilege (earns the 3% score bonus)
    #[must_use]
    pub fn with_privilege(mut self) -> Self {
        self.privileged = true;
        self
    }

    #[must_use]
    pub fn with_global_init(mut self) -> Self {
        self.global_init = true;
        self
    }

    #[must_use]
    pub fn with_kernel_internal(mut self) -> Self {
        self.kernel_internal = true;
        self
    }

    #[must_use]
    pub fn with_mems_allowed(mut self, mask: NodeMask) -> Self {
        self.mems_allowed = mask;
        self
    }

    #[must_use]
    pub fn with_cgroup(mut self, cgroup: CgroupId) -> Self {
        self.cgroup = cgroup;
        self
    }

    #[inline]
    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[inline]
    #[must_use]
    pub fn tgid(&self) -> Pid {
        self.tgid
    }

    #[inline]
    pub fn uid(&self) -> Uid {
        self.uid
    }

    #[inline]
    pub fn cgroup(&self) -> CgroupId {
        self.cgroup
    }

    #[inline]
    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn score_adj(&self) -> i16 {
        self.score_adj
    }

    #[inline]
    pub fn privileged(&self) -> bool {
        self.privileged
    }

    #[inline]
    pub fn is_global_init(&self) -> bool {
        self.global_init
    }

    #[inline]
    pub fn is_kernel_internal(&self) -> bool {
        self.kernel_internal
    }

    #[inline]
    pub fn mems_allowed(&self) -> NodeMask {
        self.mems_allowed
    }

    /// Thread-group leader: its pid doubles as the group id
    #[inline]
    #[must_use]
    pub fn is_group_leader(&self) -> bool {
        self.pid == self.tgid
    }

    /// Attach this task to an address space
    pub fn attach_space(&self, space: &Arc<AddressSpace>) {
        space.attach_user();
        self.space.store(Some(space.clone()));
    }

    /// Detach from the address space, as the exit path does
    pub fn detach_space(&self) {
        if let Some(space) = self.space.swap(None) {
            space.release_user();
        }
    }

    /// The currently attached address space, if any
    #[must_use]
    pub fn space(&self) -> Option<Arc<AddressSpace>> {
        self.space.load_full()
    }

    /// Caller-settable hint: this task originated the failing allocation
    /// and should be picked first
    pub fn set_alloc_origin(&self, origin: bool) {
        self.alloc_origin.store(origin, Ordering::Release);
    }

    pub fn is_alloc_origin(&self) -> bool {
        self.alloc_origin.load(Ordering::Acquire)
    }

    pub fn set_exiting(&self) {
        self.exiting.store(true, Ordering::Release);
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    pub fn set_coredumping(&self, active: bool) {
        self.coredumping.store(active, Ordering::Release);
    }

    pub fn is_coredumping(&self) -> bool {
        self.coredumping.load(Ordering::Acquire)
    }

    /// Mid-fork handoff: the address space still belongs to the parent
    pub fn set_vforked(&self, active: bool) {
        self.vforked.store(active, Ordering::Release);
    }

    pub fn in_vfork(&self) -> bool {
        self.vforked.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_victim(&self) -> bool {
        self.victim.load(Ordering::Acquire)
    }

    /// Set the victim mark; returns false when it was already set
    pub(crate) fn mark_victim(&self) -> bool {
        !self.victim.swap(true, Ordering::AcqRel)
    }

    /// Clear the victim mark; returns false when it was never set
    pub(crate) fn clear_victim(&self) -> bool {
        self.victim.swap(false, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for ProcessRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ProcessRecord")
            .field("pid", &self.pid)
            .field("tgid", &self.tgid)
            .field("name", &self.name)
            .field("score_adj", &self.score_adj)
            .field("victim", &self.is_victim())
            .finish()
    }
}

/// Find a thread in the task's group that still owns a live address space.
/// A task may have detached its own space while exiting even though
/// siblings still hold a valid one.
pub(crate) fn find_live_thread(
    directory: &dyn ProcessDirectory,
    task: &Arc<ProcessRecord>,
) -> Option<Arc<ProcessRecord>> {
    if task.space().is_some() {
        return Some(task.clone());
    }
    directory
        .threads_of(task.tgid())
        .into_iter()
        .find(|thread| thread.space().is_some())
}

/// Whether any thread of `task`'s group is attached to `space`
pub(crate) fn shares_space(
    directory: &dyn ProcessDirectory,
    task: &Arc<ProcessRecord>,
    space: &Arc<AddressSpace>,
) -> bool {
    directory.threads_of(task.tgid()).iter().any(|thread| {
        thread
            .space()
            .map_or(false, |other| Arc::ptr_eq(&other, space))
    })
}

/// Whole thread group on its way out: a coredump can stall the exit for
/// a long time, so it never counts
fn group_exit_in_progress(directory: &dyn ProcessDirectory, task: &Arc<ProcessRecord>) -> bool {
    if task.is_coredumping() {
        return false;
    }
    let threads = directory.threads_of(task.tgid());
    if threads.len() <= 1 {
        return task.is_exiting();
    }
    threads.iter().all(|thread| thread.is_exiting())
}

/// Whether the task is dying anyway and will release its address space by
/// itself, making a kill pointless
pub(crate) fn will_free_mem(directory: &dyn ProcessDirectory, task: &Arc<ProcessRecord>) -> bool {
    let Some(space) = task.space() else {
        return false;
    };
    if !group_exit_in_progress(directory, task) {
        return false;
    }
    // Already drained by the reaper; small chance it frees more
    if space.is_reaped() {
        return false;
    }
    if space.users() <= 1 {
        return true;
    }
    // Really pessimistic: there is no reliable way to know which external
    // processes share this space, so every sharer in another group has to
    // be on its way out too
    for other in directory.processes() {
        if !other.is_group_leader() || other.tgid() == task.tgid() {
            continue;
        }
        if !shares_space(directory, &other, &space) {
            continue;
        }
        if !group_exit_in_progress(directory, &other) {
            return false;
        }
    }
    true
}
