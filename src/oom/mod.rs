/*!
 * OOM Module
 * Memory-pressure triage: victim selection, killing, and reaping
 */

pub mod badness;
pub mod constraint;
mod killer;
pub mod notifier;
pub mod process;
mod reaper;
pub mod selector;
pub mod service;
pub mod table;
pub mod traits;
pub mod types;

// Re-export for convenience
pub use notifier::{NotifierCallback, NotifierChain};
pub use process::{AddressSpace, ProcessRecord, Region, RegionBacking};
pub use service::OomService;
pub use table::ProcessTable;
pub use traits::{MemoryTopology, ProcessDirectory, RegionUnmapper, SignalSender};
pub use types::*;
