/*!
 * Test Fixtures
 * Shared topology, signal recorder, and unmapper fakes
 */

#![allow(dead_code)]

use oom_triage::core::types::{NodeId, NodeMask, Pages, Pid};
use oom_triage::oom::process::{AddressSpace, ProcessRecord, Region};
use oom_triage::{
    MemoryTopology, OomService, ProcessTable, RegionUnmapper, SignalSender, TriageConfig,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Two-node topology: node 0 spans 60k pages, node 1 spans 40k, no swap
pub struct StaticTopology {
    pub nodes: Vec<(NodeId, Pages)>,
    pub swap: Pages,
}

impl Default for StaticTopology {
    fn default() -> Self {
        Self {
            nodes: vec![(0, 60_000), (1, 40_000)],
            swap: 0,
        }
    }
}

impl MemoryTopology for StaticTopology {
    fn present_nodes(&self) -> NodeMask {
        NodeMask::of(&self.nodes.iter().map(|&(id, _)| id).collect::<Vec<_>>())
    }

    fn node_spanned_pages(&self, node: NodeId) -> Pages {
        self.nodes
            .iter()
            .find(|&&(id, _)| id == node)
            .map_or(0, |&(_, pages)| pages)
    }

    fn total_ram_pages(&self) -> Pages {
        self.nodes.iter().map(|&(_, pages)| pages).sum()
    }

    fn total_swap_pages(&self) -> Pages {
        self.swap
    }
}

/// One recorded forced-kill delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalEvent {
    pub pid: Pid,
    /// Whether the task already carried the victim mark when signalled
    pub was_marked_victim: bool,
}

#[derive(Default)]
pub struct RecordingSignals {
    events: Mutex<Vec<SignalEvent>>,
}

impl RecordingSignals {
    pub fn events(&self) -> Vec<SignalEvent> {
        self.events.lock().clone()
    }

    pub fn killed_pids(&self) -> Vec<Pid> {
        self.events.lock().iter().map(|event| event.pid).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl SignalSender for RecordingSignals {
    fn force_kill(&self, process: &ProcessRecord) {
        self.events.lock().push(SignalEvent {
            pid: process.pid(),
            was_marked_victim: process.is_victim(),
        });
    }
}

#[derive(Default)]
pub struct CountingUnmapper {
    reclaimed: AtomicU64,
}

impl CountingUnmapper {
    pub fn total(&self) -> Pages {
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

pub struct Harness {
    pub table: Arc<ProcessTable>,
    pub signals: Arc<RecordingSignals>,
    pub unmapper: Arc<CountingUnmapper>,
    pub service: Arc<OomService>,
}

/// Build a service over the default topology with fast test timings
pub fn harness(config: TriageConfig) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let table = Arc::new(ProcessTable::new());
    let signals = Arc::new(RecordingSignals::default());
    let unmapper = Arc::new(CountingUnmapper::default());
    let service = Arc::new(OomService::new(
        table.clone(),
        Arc::new(StaticTopology::default()),
        signals.clone(),
        unmapper.clone(),
        config,
    ));
    Harness {
        table,
        signals,
        unmapper,
        service,
    }
}

/// Fast timings for tests: short reap delays, no post-kill pause
pub fn test_config() -> TriageConfig {
    TriageConfig::default()
        .with_reap_retries(3)
        .with_reap_retry_delay(Duration::from_millis(2))
}

/// Register a task owning one anonymous region
pub fn spawn_task(table: &ProcessTable, pid: Pid, tgid: Pid, rss: Pages) -> Arc<ProcessRecord> {
    let task = table.insert(ProcessRecord::new(pid, tgid, 1000, format!("task-{pid}")));
    let space = AddressSpace::new(u64::from(pid));
    space.map_region(Region::anonymous(rss));
    task.attach_space(&space);
    task
}

/// Register a caller task with no address space of its own
pub fn spawn_caller(table: &ProcessTable) -> Arc<ProcessRecord> {
    table.insert(ProcessRecord::new(999, 999, 0, "allocator"))
}

/// Poll until the condition holds or the timeout elapses
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}
