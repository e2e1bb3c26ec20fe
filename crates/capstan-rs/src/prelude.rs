//! Convenience re-exports for common `capstan-rs` types.
//!
//! Meant to be glob-imported when wiring up a turn loop:
//!
//! ```ignore
//! use capstan_rs::prelude::*;
//! ```
//!
//! This pulls in the types needed for the vast majority of callers: the
//! [`Message`] constructors, [`StreamAssembler`], [`ToolScheduler`] +
//! [`ToolInvoker`], [`ContextBudgetManager`] + config, event handlers,
//! and the cancellation token threaded through a turn. Specialized types
//! (raw pending units, the offload reference parser) are intentionally
//! excluded — import those from their modules directly when needed.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{
    ContentPart, EngineError, Message, MessageRole, TokenUsage, ToolCall, ToolDefinition,
    ToolResult, ToolReturnValue, json_schema_for,
};

// ── Stream assembly ─────────────────────────────────────────────────
pub use crate::stream::{AssembledTurn, StreamAssembler, StreamFragment};

// ── Tool execution ──────────────────────────────────────────────────
pub use crate::exec::{
    DEFAULT_MAX_PARALLEL, InvokeFuture, PendingTask, ScheduledBatch, TASK_COMMAND_PREFIX,
    TaskDispatchArgs, ToolInvoker, ToolScheduler, is_task_dispatch, task_description,
};

// ── Context management ──────────────────────────────────────────────
pub use crate::context::{
    CompactionResult, Compactor, ContextBudgetConfig, ContextBudgetManager, OFFLOAD_REFERENCE_PREFIX,
    OffloadStore, OffloadSummary, RemediationOutcome, TokenEstimator,
};

// ── Model interface ─────────────────────────────────────────────────
pub use crate::api::{FragmentStream, GenerateFuture, GenerationOptions, ModelClient};

// ── Events ──────────────────────────────────────────────────────────
pub use crate::events::{
    CompositeEventHandler, EngineEvent, EventHandler, FnEventHandler, LoggingHandler, NoopHandler,
};

// ── Cancellation ────────────────────────────────────────────────────
pub use tokio_util::sync::CancellationToken;
