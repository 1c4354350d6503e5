/*!
 * Reaper
 * Dedicated worker that asynchronously unmaps a victim's anonymous memory
 * so the allocator can make progress before the victim has fully exited
 */

use log::{info, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::process::{find_live_thread, AddressSpace, ProcessRecord};
use super::traits::{ProcessDirectory, RegionUnmapper};

/// Handle to the reaper worker; dropping it shuts the worker down
pub(crate) struct OomReaper {
    inner: Arc<ReaperInner>,
    worker: Option<JoinHandle<()>>,
}

struct ReaperInner {
    queue: Mutex<VecDeque<Arc<ProcessRecord>>>,
    available: Condvar,
    shutdown: AtomicBool,
    /// Shared with the killer: a reap must not shrink a candidate's
    /// footprint in the middle of a victim selection
    triage_lock: Arc<Mutex<()>>,
    directory: Arc<dyn ProcessDirectory>,
    unmapper: Arc<dyn RegionUnmapper>,
    retries: u32,
    retry_delay: Duration,
}

impl OomReaper {
    pub(crate) fn spawn(
        directory: Arc<dyn ProcessDirectory>,
        unmapper: Arc<dyn RegionUnmapper>,
        triage_lock: Arc<Mutex<()>>,
        retries: u32,
        retry_delay: Duration,
    ) -> Self {
        let inner = Arc::new(ReaperInner {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            triage_lock,
            directory,
            unmapper,
            retries,
            retry_delay,
        });
        let worker = {
            let inner = inner.clone();
            thread::spawn(move || inner.run())
        };
        Self {
            inner,
            worker: Some(worker),
        }
    }

    /// Queue a victim for reaping; queuing is idempotent
    pub(crate) fn wake(&self, task: &Arc<ProcessRecord>) {
        if task.reap_queued.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.queue.lock().push_back(task.clone());
        self.inner.available.notify_one();
    }
}

impl Drop for OomReaper {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.available.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl ReaperInner {
    fn run(&self) {
        loop {
            let task = {
                let mut queue = self.queue.lock();
                loop {
                    if self.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    if let Some(task) = queue.pop_front() {
                        break task;
                    }
                    self.available.wait(&mut queue);
                }
            };
            self.reap_process(&task);
        }
    }

    /// Bounded retry loop for one queued victim
    fn reap_process(&self, task: &Arc<ProcessRecord>) {
        // The exit path may have raced us; no space left means the work
        // is already done
        let space = find_live_thread(&*self.directory, task).and_then(|live| live.space());
        if let Some(space) = space {
            let mut reaped = false;
            for attempt in 0..self.retries {
                if self.try_reap(task, &space) {
                    reaped = true;
                    break;
                }
                if attempt + 1 < self.retries {
                    thread::sleep(self.retry_delay);
                }
            }
            if !reaped {
                warn!(
                    "oom reaper: unable to reap pid {} ({})",
                    task.pid(),
                    task.name()
                );
                // A space that already failed a full retry budget once is
                // not worth trying forever; hide it from the killer so it
                // can move on to a different one
                if space.mark_unreapable() {
                    warn!(
                        "oom reaper: giving up on pid {} ({})",
                        task.pid(),
                        task.name()
                    );
                    space.mark_reaped();
                }
            }
        }
        task.reap_queued.store(false, Ordering::Release);
    }

    /// One reap attempt under the shared triage lock; false means try again
    fn try_reap(&self, task: &Arc<ProcessRecord>, space: &Arc<AddressSpace>) -> bool {
        let _triage = self.triage_lock.lock();

        if space.is_reaped() {
            return true;
        }

        // External observers cannot tolerate racing invalidation; give
        // the victim some more time to exit on its own instead
        if space.has_external_observers() {
            thread::sleep(self.retry_delay);
            return true;
        }

        let Some(regions) = space.regions.try_read() else {
            return false;
        };

        // Pin the space so it cannot be torn down mid-walk; a failed pin
        // means the exit path already won
        if !space.pin_users() {
            return true;
        }

        let mut reclaimed = 0;
        for region in regions.iter().filter(|region| region.reapable()) {
            reclaimed += self.unmapper.unmap(space, region);
        }

        info!(
            "oom reaper: reaped pid {} ({}), {} pages reclaimed, anon-rss now {} pages, file-rss {} pages",
            task.pid(),
            task.name(),
            reclaimed,
            space.anon_pages(),
            space.file_pages()
        );
        drop(regions);
        space.mark_reaped();

        // The pinned reference may be the last one; never pay for the
        // teardown on the reaper thread
        let space = space.clone();
        thread::spawn(move || space.release_user());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Pages;
    use crate::oom::process::Region;
    use crate::oom::table::ProcessTable;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicU64;

    struct CountingUnmapper {
        reclaimed: AtomicU64,
    }

    impl CountingUnmapper {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                reclaimed: AtomicU64::new(0),
            })
        }

        fn total(&self) -> Pages {
            self.reclaimed.load(Ordering::Acquire)
        }
    }

    impl RegionUnmapper for CountingUnmapper {
        fn unmap(&self, space: &AddressSpace, region: &Region) -> Pages {
            let pages = space.note_unmapped(region);
            self.reclaimed.fetch_add(pages, Ordering::AcqRel);
            pages
        }
    }

    fn inner(
        directory: Arc<ProcessTable>,
        unmapper: Arc<CountingUnmapper>,
        retries: u32,
    ) -> ReaperInner {
        ReaperInner {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            triage_lock: Arc::new(Mutex::new(())),
            directory,
            unmapper,
            retries,
            retry_delay: Duration::from_millis(1),
        }
    }

    fn victim(table: &ProcessTable) -> (Arc<ProcessRecord>, Arc<AddressSpace>) {
        let task = table.insert(ProcessRecord::new(100, 100, 1000, "victim"));
        let space = AddressSpace::new(100);
        space.map_region(Region::anonymous(4000));
        space.map_region(Region::file(500, false));
        space.map_region(Region::file(300, true));
        space.map_region(Region::anonymous(128).with_huge_pages());
        space.map_region(Region::anonymous(64).with_locked());
        task.attach_space(&space);
        (task, space)
    }

    #[test]
    fn reap_unmaps_anonymous_and_private_regions_only() {
        let table = Arc::new(ProcessTable::new());
        let unmapper = CountingUnmapper::new();
        let reaper = inner(table.clone(), unmapper.clone(), 3);
        let (task, space) = victim(&table);

        reaper.reap_process(&task);

        // Shared file pages, huge pages, and locked pages stay mapped
        assert_eq!(unmapper.total(), 4000 + 500);
        assert!(space.is_reaped());
        assert!(!space.is_unreapable());
        assert_eq!(space.anon_pages(), 128 + 64);
        assert_eq!(space.shmem_pages(), 300);
        assert!(!task.reap_queued.load(Ordering::Acquire));
    }

    #[test]
    fn contended_space_lock_exhausts_retries_and_marks_unreapable() {
        // Scenario E: the read lock never becomes available
        let table = Arc::new(ProcessTable::new());
        let unmapper = CountingUnmapper::new();
        let reaper = inner(table.clone(), unmapper.clone(), 5);
        let (task, space) = victim(&table);

        let _held = space.regions.write();
        reaper.reap_process(&task);

        assert!(space.is_unreapable());
        assert!(!space.is_reaped());
        assert_eq!(unmapper.total(), 0);
    }

    #[test]
    fn second_exhaustion_forces_reaped() {
        let table = Arc::new(ProcessTable::new());
        let unmapper = CountingUnmapper::new();
        let reaper = inner(table.clone(), unmapper.clone(), 2);
        let (task, space) = victim(&table);

        let held = space.regions.write();
        reaper.reap_process(&task);
        assert!(space.is_unreapable());
        assert!(!space.is_reaped());

        // Still failing after the budget was already spent once: give up
        // permanently rather than retry forever
        reaper.reap_process(&task);
        assert!(space.is_reaped());
        drop(held);
        assert_eq!(unmapper.total(), 0);
    }

    #[test]
    fn external_observers_defer_instead_of_reaping() {
        let table = Arc::new(ProcessTable::new());
        let unmapper = CountingUnmapper::new();
        let reaper = inner(table.clone(), unmapper.clone(), 3);
        let (task, space) = victim(&table);
        space.set_external_observers(true);

        reaper.reap_process(&task);

        assert_eq!(unmapper.total(), 0);
        assert!(!space.is_reaped());
        assert!(!space.is_unreapable());
    }

    #[test]
    fn exited_task_is_a_no_op() {
        let table = Arc::new(ProcessTable::new());
        let unmapper = CountingUnmapper::new();
        let reaper = inner(table.clone(), unmapper.clone(), 3);
        let (task, _space) = victim(&table);
        task.detach_space();
        task.reap_queued.store(true, Ordering::Release);

        reaper.reap_process(&task);

        assert_eq!(unmapper.total(), 0);
        assert!(!task.reap_queued.load(Ordering::Acquire));
    }
}
