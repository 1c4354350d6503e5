/*!
 * Core Module
 * Fundamental types shared by every triage component
 */

pub mod types;

// Re-export for convenience
pub use types::*;
