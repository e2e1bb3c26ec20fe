//! Turn execution engine for LLM-powered tool-use agents.
//!
//! `capstan-rs` implements the per-turn machinery an agentic loop runs on:
//! assembling a streamed model response into a complete message
//! ([`StreamAssembler`](stream::StreamAssembler)), dispatching the tool calls
//! that message requests under ordering and concurrency constraints
//! ([`ToolScheduler`](exec::ToolScheduler)), and keeping the growing history
//! inside the model's context window by offloading large tool outputs and
//! compacting old messages into a model-written summary
//! ([`ContextBudgetManager`](context::ContextBudgetManager)).
//!
//! The outer loop (stop conditions, session persistence, settings, the
//! actual tools) lives in the caller. This crate owns one turn at a time
//! and guarantees the hard parts: every tool call produces exactly one
//! result, cancellation never leaves work running detached, and history
//! remediation never corrupts or loses content that is still referenced.
//!
//! # Getting started
//!
//! Add `capstan-rs` to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! capstan-rs = { path = "../capstan-rs" }
//! ```
//!
//! Then drive a turn:
//!
//! ```ignore
//! use capstan_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), String> {
//!     let client: std::sync::Arc<dyn ModelClient> = make_client()?;
//!     let invoker: std::sync::Arc<dyn ToolInvoker> = make_invoker()?;
//!     let cancel = CancellationToken::new();
//!
//!     // 1. Assemble the streamed response into a message.
//!     let fragments = client
//!         .generate("You are a coding agent.", &history, &tool_defs, &cancel)
//!         .await?;
//!     let turn = StreamAssembler::new().assemble(fragments, &cancel).await
//!         .map_err(|e| e.to_string())?;
//!     history.push(turn.message.clone());
//!
//!     // 2. Execute the requested tool calls.
//!     let scheduler = ToolScheduler::new(invoker).with_max_parallel(4);
//!     let batch = scheduler.schedule(turn.tool_calls, &cancel);
//!     for result in batch.collect_results().await.map_err(|e| e.to_string())? {
//!         history.push(Message::tool_result(&result.tool_call_id, &result.return_value.output));
//!     }
//!
//!     // 3. Keep history inside budget before the next call.
//!     let store = OffloadStore::open(session_dir.join("offload")).await?;
//!     let mut manager = ContextBudgetManager::new(client, store, ContextBudgetConfig::new());
//!     let outcome = manager.remediate(history).await;
//!     history = outcome.messages;
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! If you're looking for how to...
//!
//! - **Assemble a streamed response:** see
//!   [`StreamAssembler`](stream::StreamAssembler) and
//!   [`StreamFragment`](stream::StreamFragment). Attach
//!   [`on_fragment`](stream::StreamAssembler::on_fragment) /
//!   [`on_tool_call`](stream::StreamAssembler::on_tool_call) observers for
//!   live UI updates; both are passive and cannot alter assembly.
//!
//! - **Execute tool calls:** implement [`ToolInvoker`](exec::ToolInvoker)
//!   (one method, boxed future) and hand it to
//!   [`ToolScheduler`](exec::ToolScheduler). Sequential calls run strictly
//!   in order; contiguous runs of task-dispatch calls (see
//!   [`is_task_dispatch`](exec::is_task_dispatch)) run in bounded-parallel
//!   chunks. [`ScheduledBatch::collect_results`](exec::ScheduledBatch::collect_results)
//!   returns exactly one [`ToolResult`] per call.
//!
//! - **Keep history inside budget:** see
//!   [`ContextBudgetManager`](context::ContextBudgetManager) and
//!   [`ContextBudgetConfig`](context::ContextBudgetConfig). Offloading and
//!   compaction run from one [`remediate`](context::ContextBudgetManager::remediate)
//!   call; the pieces ([`OffloadStore`](context::OffloadStore),
//!   [`Compactor`](context::Compactor), [`TokenEstimator`](context::TokenEstimator))
//!   are usable on their own.
//!
//! - **Observe the engine:** implement [`EventHandler`](events::EventHandler)
//!   to react to tool starts/settles, task-dispatch timing, offload and
//!   compaction outcomes. Use [`LoggingHandler`](events::LoggingHandler) for
//!   tracing-based logging, [`CompositeEventHandler`](events::CompositeEventHandler)
//!   to compose handlers, or [`FnEventHandler`](events::FnEventHandler) for
//!   closures.
//!
//! - **Plug in a provider:** implement [`ModelClient`](api::ModelClient).
//!   The engine only ever sees [`StreamFragment`](stream::StreamFragment)s,
//!   so wire formats stay in the adapter.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`stream`] | [`StreamAssembler`](stream::StreamAssembler), fragment merge, tool-call materialization |
//! | [`exec`] | [`ToolScheduler`](exec::ToolScheduler), pending tasks, partitioning, cancellation |
//! | [`context`] | [`ContextBudgetManager`](context::ContextBudgetManager), offload store, compactor, token estimation |
//! | [`api`] | [`ModelClient`](api::ModelClient) provider seam, generation options |
//! | [`events`] | [`EventHandler`](events::EventHandler) trait and stock handlers |
//!
//! # Design principles
//!
//! 1. **Exactly-once results.** Every scheduled tool call settles into
//!    exactly one [`ToolResult`]: on success, on failure, and on
//!    cancellation (a synthesized error). Callers never see a hole.
//!
//! 2. **Context is the scarcest resource.** Token counts are recomputed
//!    from a full re-serialization on every inspection, large outputs move
//!    to disk behind a short reference, and compaction is all-or-nothing.
//!
//! 3. **Cancellation is explicit.** One
//!    [`CancellationToken`](tokio_util::sync::CancellationToken) threads the
//!    whole turn and every task gets a child of it. Cancelled work is
//!    drained, never detached.
//!
//! 4. **Observability over magic.** The engine decides scheduling and
//!    remediation automatically but reports every decision through
//!    [`EventHandler`](events::EventHandler) and `tracing`.

pub mod api;
pub mod context;
pub mod events;
pub mod exec;
pub mod prelude;
pub mod stream;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// Re-export schemars for downstream crates.
pub use schemars;

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`. This is the bridge between strong Rust types
/// and the `serde_json::Value` carried by [`ToolDefinition::parameters`].
///
/// # Example
///
/// ```
/// use capstan_rs::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct SearchArgs {
///     query: String,
///     #[serde(default)]
///     limit: Option<u32>,
/// }
///
/// let schema = json_schema_for::<SearchArgs>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["required"].as_array().unwrap().contains(&"query".into()));
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// One segment of message content.
///
/// Only `Text` and `Thinking` participate in stream merging; `ImageRef` is
/// carried through untouched. A `Thinking` segment with a signature is
/// closed: the signature attests the content that precedes it, so nothing
/// may be appended afterwards.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Thinking {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ImageRef {
        url: String,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn thinking(content: impl Into<String>) -> Self {
        ContentPart::Thinking {
            content: content.into(),
            signature: None,
        }
    }

    pub fn image_ref(url: impl Into<String>) -> Self {
        ContentPart::ImageRef { url: url.into() }
    }

    /// The text of a `Text` part, `None` for every other variant.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// A message in the conversation.
///
/// `content` is an ordered list of parts. Empty/absent fields are skipped
/// during serialization so token estimates don't pay for them.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ContentPart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: vec![ContentPart::text(content)],
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: vec![ContentPart::text(content)],
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: vec![ContentPart::text(content)],
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: Vec::new(),
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    /// A tool-result message answering the given call id.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: vec![ContentPart::text(content)],
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }

    /// All `Text` parts joined with newlines. Thinking and image parts are
    /// excluded; this is the message as downstream consumers read it.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ── Tool types ─────────────────────────────────────────────────────

/// A tool call requested by the model.
///
/// Built incrementally during streaming (id and name arrive first,
/// arguments accumulate as raw deltas); immutable once the assembler
/// flushes it. `arguments` is the raw serialized string the model
/// produced, never parsed or validated here.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// Tool definition handed to the provider client.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Maximum characters kept in a result's `brief` preview.
const BRIEF_MAX_CHARS: usize = 200;

/// The outcome of one tool call. Produced exactly once per call, even on
/// cancellation or internal failure (a synthesized error result).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub return_value: ToolReturnValue,
}

/// Structured payload of a tool result.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolReturnValue {
    pub is_error: bool,
    /// Full output text, folded back into history.
    pub output: String,
    /// Status or error description. Empty on plain success.
    pub message: String,
    /// Short preview for logs and UIs.
    pub brief: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extras: Option<serde_json::Value>,
}

impl ToolResult {
    /// A successful result carrying the tool's output.
    pub fn ok(tool_call_id: impl Into<String>, output: impl Into<String>) -> Self {
        let output = output.into();
        Self {
            tool_call_id: tool_call_id.into(),
            return_value: ToolReturnValue {
                is_error: false,
                brief: preview(&output),
                output,
                message: String::new(),
                extras: None,
            },
        }
    }

    /// A failure result. `message` describes what went wrong.
    pub fn error(tool_call_id: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            tool_call_id: tool_call_id.into(),
            return_value: ToolReturnValue {
                is_error: true,
                output: String::new(),
                brief: preview(&message),
                message,
                extras: None,
            },
        }
    }

    /// Attach structured extras (tool-specific metadata).
    pub fn with_extras(mut self, extras: serde_json::Value) -> Self {
        self.return_value.extras = Some(extras);
        self
    }
}

fn preview(text: &str) -> String {
    text.chars().take(BRIEF_MAX_CHARS).collect()
}

// ── Usage ──────────────────────────────────────────────────────────

/// Token usage reported by the provider for one generation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

// ── Errors ─────────────────────────────────────────────────────────

/// The two failures the engine surfaces to its caller.
///
/// Everything else is recovered internally: tool failures become error
/// results, compaction failures fall back to the original history. These
/// two propagate because only the caller can decide retry-vs-stop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineError {
    /// The assembled response had neither content nor tool calls.
    EmptyResponse,
    /// The turn's cancellation token fired.
    Aborted,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::EmptyResponse => {
                write!(f, "model response contained no content and no tool calls")
            }
            EngineError::Aborted => write!(f, "turn aborted by cancellation"),
        }
    }
}

impl std::error::Error for EngineError {}
