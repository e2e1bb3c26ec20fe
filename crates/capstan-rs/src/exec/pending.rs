//! In-flight tool-call state.
//!
//! A [`PendingTask`] is the unit the scheduler tracks: one tool call, one
//! child cancellation token, one eventual [`ToolResult`]. The task settles
//! exactly once no matter how execution ends: normal completion, invoke
//! error, panic inside the invoke future, and cancellation all collapse
//! into a result, synthesized where necessary.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{ToolCall, ToolResult};

/// Boxed future returned by [`ToolInvoker::invoke`].
///
/// Type alias to keep trait signatures and implementations readable.
pub type InvokeFuture<'a> = Pin<Box<dyn Future<Output = Result<ToolResult, String>> + Send + 'a>>;

/// Executes one tool call.
///
/// This is the whole capability surface the scheduler needs. Name-to-tool
/// resolution, argument parsing, and sandboxing all live behind this one
/// method, owned by the caller. Implementations clone what they need from
/// the borrowed call before returning the future; the boxed future
/// borrows only `self`.
///
/// Cancellation is the scheduler's concern: when a task's token fires, the
/// invoke future is dropped where it stands.
pub trait ToolInvoker: Send + Sync {
    fn invoke(&self, call: &ToolCall) -> InvokeFuture<'_>;
}

enum TaskState {
    NotStarted,
    Running(JoinHandle<ToolResult>),
    Settled,
}

/// One in-flight tool call, owned by a single scheduler batch.
///
/// At most one task exists per tool-call id within a batch. The task holds
/// a child of the turn's cancellation token, so cancelling the turn fans
/// out to every task automatically; [`cancel`](Self::cancel) additionally
/// marks the task so callers can observe that cancellation reached it.
pub struct PendingTask {
    call: ToolCall,
    cancel: CancellationToken,
    cancelled: AtomicBool,
    state: Mutex<TaskState>,
}

impl PendingTask {
    pub(crate) fn new(call: ToolCall, turn: &CancellationToken) -> Self {
        Self {
            call,
            cancel: turn.child_token(),
            cancelled: AtomicBool::new(false),
            state: Mutex::new(TaskState::NotStarted),
        }
    }

    /// The call this task executes.
    pub fn tool_call(&self) -> &ToolCall {
        &self.call
    }

    /// Request cancellation. Idempotent; an unstarted task simply never
    /// runs, a running one settles with a synthesized cancellation result.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Whether [`cancel`](Self::cancel) has been invoked on this task.
    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Whether the task has reached its terminal state.
    pub fn is_settled(&self) -> bool {
        matches!(*self.state.lock().unwrap(), TaskState::Settled)
    }

    /// Spawn the invocation. Idempotent: a task already running or settled
    /// is left alone.
    pub(crate) fn start(self: &Arc<Self>, invoker: &Arc<dyn ToolInvoker>) {
        let mut state = self.state.lock().unwrap();
        if !matches!(*state, TaskState::NotStarted) {
            return;
        }
        let task = Arc::clone(self);
        let invoker = Arc::clone(invoker);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task.cancel.cancelled() => cancelled_result(&task.call),
                outcome = invoker.invoke(&task.call) => match outcome {
                    Ok(result) => result,
                    Err(error) => failure_result(&task.call, &error),
                },
            }
        });
        *state = TaskState::Running(handle);
    }

    /// Await the task's result, transitioning to `Settled`.
    ///
    /// A panic inside the invoke future surfaces here as a join error and
    /// becomes a synthesized failure result; a task that was never started
    /// settles with a synthesized cancellation result.
    pub(crate) async fn settle(&self) -> ToolResult {
        match self.take_handle() {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(error) => failure_result(&self.call, &format!("task join error: {error}")),
            },
            None => cancelled_result(&self.call),
        }
    }

    /// Await a running invocation without keeping its result. Used by the
    /// cancellation sweep so no spawned work outlives the batch.
    pub(crate) async fn drain(&self) {
        if let Some(handle) = self.take_handle() {
            let _ = handle.await;
        }
    }

    /// Abort a still-running invocation outright. Only reached when the
    /// batch itself is dropped mid-collection.
    pub(crate) fn abort(&self) {
        if let Some(handle) = self.take_handle() {
            handle.abort();
        }
    }

    fn take_handle(&self) -> Option<JoinHandle<ToolResult>> {
        let mut state = self.state.lock().unwrap();
        match std::mem::replace(&mut *state, TaskState::Settled) {
            TaskState::Running(handle) => Some(handle),
            _ => None,
        }
    }
}

/// Result synthesized for a task that was cancelled before producing one.
pub(crate) fn cancelled_result(call: &ToolCall) -> ToolResult {
    ToolResult::error(
        call.id.clone(),
        format!("tool '{}' cancelled before completion", call.name),
    )
}

/// Result synthesized when the invoke future fails or panics.
pub(crate) fn failure_result(call: &ToolCall, detail: &str) -> ToolResult {
    ToolResult::error(
        call.id.clone(),
        format!("tool '{}' failed: {detail}", call.name),
    )
}
