/*!
 * Triage Types
 * Common types for memory-pressure triage
 */

use crate::core::types::{NodeMask, Pages};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::process::ProcessRecord;

/// Result type for triage entry points
pub type TriageResult<T> = Result<T, FatalOom>;

/// Score adjustment sentinel: the process must never be killed
pub const SCORE_ADJ_NEVER_KILL: i16 = -1000;

/// Upper bound of the score adjustment range
pub const SCORE_ADJ_MAX: i16 = 1000;

/// Unrecoverable triage outcomes
///
/// These are not ordinary errors. The host must treat either variant as a
/// stop-the-world condition; diagnostics have already been dumped by the
/// time one is returned.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum FatalOom {
    #[error("out of memory and no killable processes")]
    NoKillableProcess,

    #[error("out of memory: {policy} panic policy is enabled")]
    PanicPolicyTriggered { policy: PanicPolicy },
}

/// Panic-on-OOM policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanicPolicy {
    /// Never panic; always try to kill a process instead
    Never,
    /// Panic only when the failure was not policy or node-set constrained
    Unconstrained,
    /// Panic on every invocation
    Always,
}

impl std::fmt::Display for PanicPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            PanicPolicy::Never => write!(f, "disabled"),
            PanicPolicy::Unconstrained => write!(f, "system-wide"),
            PanicPolicy::Always => write!(f, "compulsory"),
        }
    }
}

/// Scope an allocation failure was actually limited to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    /// The whole system ran dry
    None,
    /// A memory policy narrowed the failure to a node subset
    PolicyConstrained,
    /// An administrative node-set restriction narrowed the failure
    NodeSetConstrained,
}

/// Resolved allocation constraint: failure scope plus the reclaimable
/// universe it spans
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constraint {
    pub kind: ConstraintKind,
    /// Pages the failed allocation could in principle have drawn from
    pub total_pages: Pages,
    /// Policy mask to score candidates against, when one applies
    pub mask: Option<NodeMask>,
}

impl Constraint {
    #[inline]
    #[must_use]
    pub const fn unconstrained(total_pages: Pages) -> Self {
        Self {
            kind: ConstraintKind::None,
            total_pages,
            mask: None,
        }
    }
}

/// Per-candidate decision taken during a selection scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanDecision {
    /// Skip this candidate, keep scanning
    Continue,
    /// Stop the scan entirely: a concurrent victim already exists
    Abort,
    /// Pick this candidate immediately, regardless of later scores
    Select,
    /// Score the candidate normally
    Score,
}

/// Outcome of a full selection scan
#[derive(Debug, Clone)]
pub enum Selection {
    /// Highest-scoring eligible candidate
    Victim {
        process: Arc<ProcessRecord>,
        points: u64,
    },
    /// A concurrent victim blocked the scan; no kill this round
    Aborted,
    /// Nobody is eligible anywhere
    NoCandidate,
}

/// Allocation context handed in by the allocator when it gives up
#[derive(Clone)]
pub struct AllocationContext {
    /// The task whose allocation failed
    pub caller: Arc<ProcessRecord>,
    /// Allocation order magnitude (diagnostics only)
    pub order: u32,
    /// Memory-policy node mask the allocation was restricted to, if any
    pub nodemask: Option<NodeMask>,
    /// The caller demands the allocation never fail; the victim pool
    /// cannot safely be narrowed
    pub never_fail: bool,
    /// Kill even if another victim is still on its way out
    pub force_kill: bool,
}

impl AllocationContext {
    #[must_use]
    pub fn new(caller: Arc<ProcessRecord>) -> Self {
        Self {
            caller,
            order: 0,
            nodemask: None,
            never_fail: false,
            force_kill: false,
        }
    }

    #[must_use]
    pub fn with_order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    #[must_use]
    pub fn with_nodemask(mut self, mask: NodeMask) -> Self {
        self.nodemask = Some(mask);
        self
    }

    #[must_use]
    pub fn with_never_fail(mut self) -> Self {
        self.never_fail = true;
        self
    }

    #[must_use]
    pub fn with_force_kill(mut self) -> Self {
        self.force_kill = true;
        self
    }
}

/// Handle returned by notifier registration, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotifierId(pub u64);

/// Service configuration
///
/// Defaults mirror the conventional host settings: no panic policy, scan
/// for the best victim rather than killing the allocating task, dump the
/// task table on every kill, ten reap attempts 100ms apart.
#[derive(Debug, Clone)]
pub struct TriageConfig {
    pub panic_policy: PanicPolicy,
    /// Kill the allocating caller instead of scanning, when it is eligible
    pub kill_allocating_caller: bool,
    /// Dump the per-task memory table with each diagnostic header
    pub dump_tasks: bool,
    /// Reap attempts before an address space is declared unreapable
    pub reap_retries: u32,
    /// Fixed delay between reap attempts
    pub reap_retry_delay: Duration,
    /// Pause after a kill so the victim can start exiting before the
    /// caller retries its allocation
    pub post_kill_pause: Duration,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            panic_policy: PanicPolicy::Never,
            kill_allocating_caller: false,
            dump_tasks: true,
            reap_retries: 10,
            reap_retry_delay: Duration::from_millis(100),
            post_kill_pause: Duration::from_millis(1),
        }
    }
}

impl TriageConfig {
    #[must_use]
    pub fn with_panic_policy(mut self, policy: PanicPolicy) -> Self {
        self.panic_policy = policy;
        self
    }

    #[must_use]
    pub fn with_kill_allocating_caller(mut self, enabled: bool) -> Self {
        self.kill_allocating_caller = enabled;
        self
    }

    #[must_use]
    pub fn with_dump_tasks(mut self, enabled: bool) -> Self {
        self.dump_tasks = enabled;
        self
    }

    #[must_use]
    pub fn with_reap_retries(mut self, retries: u32) -> Self {
        self.reap_retries = retries;
        self
    }

    #[must_use]
    pub fn with_reap_retry_delay(mut self, delay: Duration) -> Self {
        self.reap_retry_delay = delay;
        self
    }
}

/// Snapshot of service counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TriageStats {
    pub kills: u64,
    pub sacrifices: u64,
    pub notifier_rescues: u64,
    pub aborted_scans: u64,
    pub fast_path_marks: u64,
    pub victims_in_flight: usize,
}
