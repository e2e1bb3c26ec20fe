//! Events and handlers for observing the engine.
//!
//! The scheduler and the context budget manager report what they decide
//! through [`EngineEvent`] variants. Callers implement [`EventHandler`] to
//! observe them for logging, TUI rendering, or metrics. Handlers are
//! strictly passive: they cannot influence scheduling or remediation, and
//! a panicking handler is caught and logged rather than breaking the turn.
//!
//! # Choosing an event handler
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget runs |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |
//! | Custom `impl EventHandler` | Full control (TUI, metrics) |

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::{ToolCall, ToolResult};

// ── Events ─────────────────────────────────────────────────────────

/// Events emitted by the engine during a turn.
#[derive(Debug)]
pub enum EngineEvent<'a> {
    /// A tool call is about to be dispatched.
    ToolStarted { call: &'a ToolCall },
    /// A tool call settled (success, failure, or synthesized cancellation).
    ToolSettled {
        call_id: &'a str,
        result: &'a ToolResult,
    },
    /// A task-dispatch call started. `description` is the human-readable
    /// summary parsed from the call's arguments.
    TaskStarted {
        call_id: &'a str,
        description: &'a str,
    },
    /// A task-dispatch call ended. Fires at most once per call, whether it
    /// settled normally or was swept up by cancellation.
    TaskFinished {
        call_id: &'a str,
        description: &'a str,
        elapsed: Duration,
    },
    /// Tool results were offloaded to external storage.
    Offloaded { count: usize, freed_tokens: u64 },
    /// Compaction succeeded and the history was replaced.
    Compacted {
        previous_tokens: u64,
        current_tokens: u64,
        freed_tokens: u64,
        deleted_files: usize,
    },
    /// Compaction failed; the history was left untouched.
    CompactionFailed { error: &'a str },
}

// ── Handler trait ──────────────────────────────────────────────────

/// Handler for engine events.
///
/// Implement this trait to react to scheduling and remediation events. The
/// default implementation ignores everything, so implementors match only
/// the variants they care about.
///
/// # Example
///
/// ```ignore
/// struct MyHandler;
///
/// impl EventHandler for MyHandler {
///     fn on_event(&self, event: &EngineEvent<'_>) {
///         if let EngineEvent::TaskFinished { description, elapsed, .. } = event {
///             println!("{description} took {elapsed:?}");
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    /// Called for each event during a turn.
    fn on_event(&self, event: &EngineEvent<'_>) {
        let _ = event;
    }
}

/// A no-op event handler.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
///
/// Wraps an `Fn(&EngineEvent)` closure into an [`EventHandler`]
/// implementation, avoiding the boilerplate of defining a full struct and
/// impl for simple observation.
///
/// # Example
///
/// ```ignore
/// let handler = FnEventHandler::new(|event| {
///     if let EngineEvent::ToolSettled { call_id, .. } = event {
///         println!("settled {call_id}");
///     }
/// });
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&EngineEvent<'_>) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&EngineEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&EngineEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &EngineEvent<'_>) {
        (self.0)(event)
    }
}

/// An event handler that delegates to multiple inner handlers.
///
/// Events are dispatched to all handlers in registration order. This allows
/// composing specialized handlers that each observe a subset of events.
///
/// # Example
///
/// ```ignore
/// let handler = CompositeEventHandler::new()
///     .with(LoggingHandler)
///     .with(my_tui_handler);
/// ```
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Add a handler to the chain. Handlers are called in registration order.
    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Conditionally add a handler to the chain. When `condition` is
    /// `false`, this is a no-op, keeping the builder chain intact.
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &EngineEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// An event handler that logs events via `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &EngineEvent<'_>) {
        match event {
            EngineEvent::ToolStarted { call } => {
                debug!("executing tool: {} ({})", call.name, call.id);
            }
            EngineEvent::ToolSettled { call_id, result } => {
                if result.return_value.is_error {
                    debug!("tool {call_id} failed: {}", result.return_value.brief);
                } else {
                    debug!(
                        "tool {call_id} settled: {} chars",
                        result.return_value.output.len()
                    );
                }
            }
            EngineEvent::TaskStarted {
                call_id,
                description,
            } => {
                let preview: String = description.chars().take(200).collect();
                info!("task {call_id} started: {preview}");
            }
            EngineEvent::TaskFinished {
                call_id, elapsed, ..
            } => {
                info!("task {call_id} finished in {:.1}s", elapsed.as_secs_f64());
            }
            EngineEvent::Offloaded {
                count,
                freed_tokens,
            } => {
                info!("offloaded {count} tool result(s), freed ~{freed_tokens} tokens");
            }
            EngineEvent::Compacted {
                previous_tokens,
                current_tokens,
                freed_tokens,
                deleted_files,
            } => {
                info!(
                    "compacted history: {previous_tokens}t -> {current_tokens}t \
                     (freed {freed_tokens}t, deleted {deleted_files} file(s))"
                );
            }
            EngineEvent::CompactionFailed { error } => {
                warn!("compaction failed, history unchanged: {error}");
            }
        }
    }
}

// ── Dispatch ───────────────────────────────────────────────────────

/// Deliver one event to a handler, containing any panic.
///
/// Handlers are caller-supplied code running inside the engine's critical
/// paths; a panic here must never take down a turn that is otherwise
/// proceeding fine.
pub fn dispatch(handler: &dyn EventHandler, event: &EngineEvent<'_>) {
    if catch_unwind(AssertUnwindSafe(|| handler.on_event(event))).is_err() {
        warn!("event handler panicked; event dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn composite_dispatches_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (seen.clone(), seen.clone());
        let handler = CompositeEventHandler::new()
            .with(FnEventHandler::new(move |_| a.lock().unwrap().push("first")))
            .with(FnEventHandler::new(move |_| {
                b.lock().unwrap().push("second")
            }));

        handler.on_event(&EngineEvent::Offloaded {
            count: 1,
            freed_tokens: 10,
        });
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn with_if_skips_handler() {
        let seen = Arc::new(Mutex::new(0u32));
        let s = seen.clone();
        let handler = CompositeEventHandler::new()
            .with_if(false, FnEventHandler::new(move |_| *s.lock().unwrap() += 1));

        handler.on_event(&EngineEvent::Offloaded {
            count: 1,
            freed_tokens: 0,
        });
        assert_eq!(*seen.lock().unwrap(), 0);
    }

    #[test]
    fn dispatch_contains_handler_panic() {
        struct Panicky;
        impl EventHandler for Panicky {
            fn on_event(&self, _event: &EngineEvent<'_>) {
                panic!("handler bug");
            }
        }

        // Must not unwind past dispatch.
        dispatch(
            &Panicky,
            &EngineEvent::Offloaded {
                count: 0,
                freed_tokens: 0,
            },
        );
    }
}
