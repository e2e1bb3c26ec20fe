//! Streamed-response assembly.
//!
//! A model response arrives as an incremental sequence of
//! [`StreamFragment`]s: text deltas, thinking deltas, tool-call openings,
//! and raw argument deltas. [`StreamAssembler`] folds that sequence into
//! one complete assistant [`Message`] plus the materialized [`ToolCall`]s,
//! suspending once per fragment so the caller's runtime stays responsive.
//!
//! Merging keeps exactly one pending unit at a time. Adjacent fragments of
//! the same kind merge into it (text concatenates, thinking concatenates
//! until a signature closes the segment, argument deltas append to the open
//! tool call's buffer); anything else flushes the pending unit into the
//! output and takes its place. Argument buffers are carried verbatim and
//! never parsed or validated during assembly.

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{ContentPart, EngineError, Message, MessageRole, TokenUsage, ToolCall};

// ── Fragments ──────────────────────────────────────────────────────

/// One incremental unit of a streamed model response.
///
/// Transient: fragments exist only between the provider stream and the
/// assembler, and are never persisted.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamFragment {
    /// Incremental text content.
    TextDelta(String),
    /// Incremental thinking content. A non-`None` signature closes the
    /// thinking segment; nothing merges into it afterwards.
    ThinkingDelta {
        content: String,
        signature: Option<String>,
    },
    /// A tool call opened. Id and name arrive up front; arguments follow
    /// as [`ToolCallArgsDelta`](Self::ToolCallArgsDelta) fragments.
    ToolCallStart { id: String, name: String },
    /// Raw argument text for the currently open tool call.
    ToolCallArgsDelta(String),
    /// Usage totals, typically the final fragment of a response. Recorded
    /// on the assembled turn; never message content.
    Usage(TokenUsage),
}

// ── Pending unit ───────────────────────────────────────────────────

/// The single merge slot. At most one unit is ever pending; everything
/// before it has already been flushed into the output.
enum PendingUnit {
    Empty,
    Text(String),
    Thinking {
        content: String,
        signature: Option<String>,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
}

enum Absorb {
    Merged,
    Rejected,
}

impl PendingUnit {
    /// Try to merge a fragment into this unit. `Rejected` means the caller
    /// must flush the unit and adopt the fragment fresh.
    fn absorb(&mut self, fragment: &StreamFragment) -> Absorb {
        match (self, fragment) {
            (PendingUnit::Text(buffer), StreamFragment::TextDelta(text)) => {
                buffer.push_str(text);
                Absorb::Merged
            }
            (
                PendingUnit::Thinking { content, signature },
                StreamFragment::ThinkingDelta {
                    content: delta,
                    signature: closing,
                },
            ) if signature.is_none() => {
                content.push_str(delta);
                if closing.is_some() {
                    *signature = closing.clone();
                }
                Absorb::Merged
            }
            (PendingUnit::ToolCall { arguments, .. }, StreamFragment::ToolCallArgsDelta(delta)) => {
                arguments.push_str(delta);
                Absorb::Merged
            }
            _ => Absorb::Rejected,
        }
    }

    /// Begin a fresh unit from a fragment. Only called on an empty slot.
    fn adopt(fragment: StreamFragment) -> PendingUnit {
        match fragment {
            StreamFragment::TextDelta(text) => PendingUnit::Text(text),
            StreamFragment::ThinkingDelta { content, signature } => {
                PendingUnit::Thinking { content, signature }
            }
            StreamFragment::ToolCallStart { id, name } => PendingUnit::ToolCall {
                id,
                name,
                arguments: String::new(),
            },
            StreamFragment::ToolCallArgsDelta(_) => {
                // An orphan delta has no id or name to hang a call on.
                warn!("argument delta arrived with no open tool call; dropped");
                PendingUnit::Empty
            }
            // Usage is intercepted before merge ever sees it.
            StreamFragment::Usage(_) => PendingUnit::Empty,
        }
    }
}

// ── Assembler ──────────────────────────────────────────────────────

/// A fully assembled model response.
#[derive(Clone, Debug)]
pub struct AssembledTurn {
    /// The complete assistant message, content parts in arrival order.
    pub message: Message,
    /// The materialized tool calls, in arrival order. Duplicates
    /// `message.tool_calls` so callers can hand them straight to the
    /// scheduler.
    pub tool_calls: Vec<ToolCall>,
    /// Usage reported in-stream, if the provider sent it.
    pub usage: Option<TokenUsage>,
}

/// Folds a fragment stream into an [`AssembledTurn`].
///
/// Observers are optional and strictly passive: `on_fragment` sees every
/// raw fragment before it is merged, `on_tool_call` fires once per
/// completed tool call at flush time. Both receive shared borrows, so they
/// cannot alter what the assembler builds.
///
/// # Example
///
/// ```ignore
/// let turn = StreamAssembler::new()
///     .on_fragment(|f| ui.render_delta(f))
///     .on_tool_call(|c| ui.show_call(&c.name))
///     .assemble(fragments, &cancel)
///     .await?;
/// ```
pub struct StreamAssembler<'a> {
    on_fragment: Option<Box<dyn FnMut(&StreamFragment) + Send + 'a>>,
    on_tool_call: Option<Box<dyn FnMut(&ToolCall) + Send + 'a>>,
}

impl Default for StreamAssembler<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> StreamAssembler<'a> {
    pub fn new() -> Self {
        Self {
            on_fragment: None,
            on_tool_call: None,
        }
    }

    /// Observe every raw fragment before merging.
    pub fn on_fragment(mut self, observer: impl FnMut(&StreamFragment) + Send + 'a) -> Self {
        self.on_fragment = Some(Box::new(observer));
        self
    }

    /// Observe each completed tool call as it is flushed.
    pub fn on_tool_call(mut self, observer: impl FnMut(&ToolCall) + Send + 'a) -> Self {
        self.on_tool_call = Some(Box::new(observer));
        self
    }

    /// Consume the fragment stream and build the complete turn.
    ///
    /// Suspends once per fragment. Returns [`EngineError::Aborted`] if the
    /// token fires while waiting for the next fragment, and
    /// [`EngineError::EmptyResponse`] if the finished message has neither
    /// content nor tool calls.
    pub async fn assemble<S>(
        mut self,
        mut fragments: S,
        cancel: &CancellationToken,
    ) -> Result<AssembledTurn, EngineError>
    where
        S: Stream<Item = StreamFragment> + Unpin,
    {
        let mut pending = PendingUnit::Empty;
        let mut parts: Vec<ContentPart> = Vec::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut usage: Option<TokenUsage> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Aborted);
            }
            let fragment = tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Aborted),
                next = fragments.next() => match next {
                    Some(fragment) => fragment,
                    None => break,
                },
            };

            if let Some(observer) = self.on_fragment.as_mut() {
                observer(&fragment);
            }

            if let StreamFragment::Usage(reported) = &fragment {
                usage = Some(*reported);
                continue;
            }

            if let Absorb::Rejected = pending.absorb(&fragment) {
                self.flush(&mut pending, &mut parts, &mut tool_calls);
                pending = PendingUnit::adopt(fragment);
            }
        }

        self.flush(&mut pending, &mut parts, &mut tool_calls);

        if parts.is_empty() && tool_calls.is_empty() {
            return Err(EngineError::EmptyResponse);
        }

        let message = Message {
            role: MessageRole::Assistant,
            content: parts,
            tool_calls: (!tool_calls.is_empty()).then(|| tool_calls.clone()),
            tool_call_id: None,
        };

        Ok(AssembledTurn {
            message,
            tool_calls,
            usage,
        })
    }

    /// Move the pending unit into the output. Empty text/thinking units
    /// are dropped rather than emitted as empty parts; a tool call takes
    /// its argument buffer verbatim, defaulting to `{}`.
    fn flush(
        &mut self,
        pending: &mut PendingUnit,
        parts: &mut Vec<ContentPart>,
        tool_calls: &mut Vec<ToolCall>,
    ) {
        match std::mem::replace(pending, PendingUnit::Empty) {
            PendingUnit::Empty => {}
            PendingUnit::Text(text) => {
                if !text.is_empty() {
                    parts.push(ContentPart::Text { text });
                }
            }
            PendingUnit::Thinking { content, signature } => {
                if !content.is_empty() || signature.is_some() {
                    parts.push(ContentPart::Thinking { content, signature });
                }
            }
            PendingUnit::ToolCall {
                id,
                name,
                arguments,
            } => {
                let arguments = if arguments.is_empty() {
                    "{}".to_string()
                } else {
                    arguments
                };
                let call = ToolCall {
                    id,
                    name,
                    arguments,
                };
                if let Some(observer) = self.on_tool_call.as_mut() {
                    observer(&call);
                }
                tool_calls.push(call);
            }
        }
    }
}
