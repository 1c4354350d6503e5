/*!
 * Process Table
 * Concrete pid-indexed process directory backed by a concurrent map
 */

use crate::core::types::Pid;
use dashmap::DashMap;
use std::sync::Arc;

use super::process::ProcessRecord;
use super::traits::ProcessDirectory;

/// In-memory process directory
///
/// Snapshots are sorted by pid so scans are deterministic regardless of
/// map shard order.
#[derive(Default)]
pub struct ProcessTable {
    tasks: DashMap<Pid, Arc<ProcessRecord>>,
}

impl ProcessTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task; returns the shared record
    pub fn insert(&self, record: ProcessRecord) -> Arc<ProcessRecord> {
        let record = Arc::new(record);
        self.tasks.insert(record.pid(), record.clone());
        record
    }

    /// Remove a task once the process model has destroyed it
    pub fn remove(&self, pid: Pid) -> Option<Arc<ProcessRecord>> {
        self.tasks.remove(&pid).map(|(_, record)| record)
    }

    #[must_use]
    pub fn get(&self, pid: Pid) -> Option<Arc<ProcessRecord>> {
        self.tasks.get(&pid).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl ProcessDirectory for ProcessTable {
    fn processes(&self) -> Vec<Arc<ProcessRecord>> {
        let mut tasks: Vec<_> = self.tasks.iter().map(|entry| Arc::clone(entry.value())).collect();
        tasks.sort_by_key(|task| task.pid());
        tasks
    }

    fn threads_of(&self, tgid: Pid) -> Vec<Arc<ProcessRecord>> {
        let mut threads: Vec<_> = self
            .tasks
            .iter()
            .filter(|entry| entry.tgid() == tgid)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        threads.sort_by_key(|thread| (!thread.is_group_leader(), thread.pid()));
        threads
    }

    fn children_of(&self, pid: Pid) -> Vec<Arc<ProcessRecord>> {
        let mut children: Vec<_> = self
            .tasks
            .iter()
            .filter(|entry| entry.parent() == Some(pid))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        children.sort_by_key(|child| child.pid());
        children
    }
}
