/*!
 * OOM Triage Library
 * When a memory manager cannot satisfy an allocation and ordinary reclaim
 * has failed, this service selects one process to terminate, sacrifices
 * its memory, and forcibly reclaims its address space if it does not die
 * promptly.
 */

pub mod core;
pub mod oom;

// Re-exports
pub use oom::{
    AddressSpace, AllocationContext, ConstraintKind, FatalOom, MemoryTopology, NotifierId,
    OomService, PanicPolicy, ProcessDirectory, ProcessRecord, ProcessTable, Region, RegionBacking,
    RegionUnmapper, SignalSender, TriageConfig, TriageResult, TriageStats, SCORE_ADJ_NEVER_KILL,
};
