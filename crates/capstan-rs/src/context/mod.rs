//! Context window management: budgets, offloading, and compaction.
//!
//! The context window is the scarcest resource in any LLM agent. This module
//! provides layered remediation for keeping history inside it:
//!
//! 1. **[`budget`]** — [`TokenEstimator`] approximates token usage from the
//!    serialized history size, with no tokenizer dependency.
//!
//! 2. **[`offload`]** — moves bulky tool results into an [`OffloadStore`]
//!    on disk, leaving a one-line `"Tool result is at: <path>"` reference
//!    behind. Lossless and cheap: no model call, and the content stays
//!    recoverable.
//!
//! 3. **[`compactor`]** — LLM-written summary replacing everything but a
//!    recency window. Lossy and costly, used only when offloading wasn't
//!    enough.
//!
//! 4. **[`manager`]** — [`ContextBudgetManager`] sequences the above once
//!    per turn: inspect, offload, then compact behind a trigger and a
//!    cooldown.

pub mod budget;
pub mod compactor;
pub mod manager;
pub mod offload;

// Re-export commonly used items at the module level.
pub use budget::{DEFAULT_CHARS_PER_TOKEN, TokenEstimator};
pub use compactor::{COMPACTION_SUMMARY_PREFIX, CompactionResult, Compactor};
pub use manager::{ContextBudgetConfig, ContextBudgetManager, OffloadSummary, RemediationOutcome};
pub use offload::{
    OFFLOAD_REFERENCE_PREFIX, OffloadStore, offload_reference, parse_offload_reference,
};
