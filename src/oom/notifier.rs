/*!
 * Notification Gate
 * Gives other subsystems one chance to free memory before any kill
 */

use crate::core::types::Pages;
use log::debug;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use super::types::NotifierId;

/// Callback invoked before victim selection; reports pages it freed
pub type NotifierCallback = Box<dyn Fn() -> Pages + Send + Sync>;

/// Ordered chain of memory-freed notifiers
///
/// Callbacks run in registration order. Any nonzero total aborts the
/// triage invocation: the allocator just retries.
#[derive(Default)]
pub struct NotifierChain {
    entries: Mutex<Vec<(NotifierId, NotifierCallback)>>,
    next_id: AtomicU64,
}

impl NotifierChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a callback to the chain
    pub fn register(&self, callback: NotifierCallback) -> NotifierId {
        let id = NotifierId(self.next_id.fetch_add(1, Ordering::AcqRel));
        self.entries.lock().push((id, callback));
        id
    }

    /// Remove a callback; returns false when the id is unknown
    pub fn unregister(&self, id: NotifierId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Invoke every callback in order and sum the pages they freed
    pub fn call_chain(&self) -> Pages {
        let entries = self.entries.lock();
        let mut freed = 0;
        for (id, callback) in entries.iter() {
            let pages = callback();
            if pages > 0 {
                debug!("oom notifier {:?} freed {} pages", id, pages);
            }
            freed += pages;
        }
        freed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
