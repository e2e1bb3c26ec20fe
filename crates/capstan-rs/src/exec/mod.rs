//! Tool execution: pending tasks, batch scheduling, task-dispatch routing.
//!
//! A turn's tool calls arrive as one ordered list. The scheduler splits
//! that list into execution groups: ordinary calls run one at a time, in
//! order, because they usually touch shared state (the filesystem, the
//! shell), while contiguous runs of *task dispatches*, which are
//! self-contained delegated jobs, run concurrently up to a configurable
//! cap. Whatever the grouping, results come back as exactly one
//! [`ToolResult`](crate::ToolResult) per call, in submission order.
//!
//! A call counts as a task dispatch when its arguments parse as
//! [`TaskDispatchArgs`] and the command carries the
//! [`TASK_COMMAND_PREFIX`]. Everything else, including calls with
//! malformed arguments, stays on the sequential path.

use schemars::JsonSchema;
use serde::Deserialize;

use crate::ToolCall;

pub mod pending;
pub mod scheduler;

pub use pending::{InvokeFuture, PendingTask, ToolInvoker};
pub use scheduler::{DEFAULT_MAX_PARALLEL, ScheduledBatch, ToolScheduler};

/// Command prefix marking a tool call as a delegated task.
pub const TASK_COMMAND_PREFIX: &str = "task:";

/// Arguments of a task-dispatch tool call.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct TaskDispatchArgs {
    /// The command to run, prefixed with `task:`.
    pub command: String,
    /// Optional human-readable description shown in task events.
    #[serde(default)]
    pub description: Option<String>,
}

/// Whether a call is a delegated task eligible for concurrent execution.
///
/// Calls whose arguments do not parse, or whose command lacks the prefix,
/// are ordinary sequential calls.
pub fn is_task_dispatch(call: &ToolCall) -> bool {
    match serde_json::from_str::<TaskDispatchArgs>(&call.arguments) {
        Ok(args) => args.command.starts_with(TASK_COMMAND_PREFIX),
        Err(_) => false,
    }
}

/// Human-readable description for task lifecycle events.
///
/// Prefers the explicit description field, then the command with its
/// prefix stripped, then the tool name.
pub fn task_description(call: &ToolCall) -> String {
    if let Ok(args) = serde_json::from_str::<TaskDispatchArgs>(&call.arguments) {
        if let Some(description) = args.description {
            if !description.trim().is_empty() {
                return description;
            }
        }
        let command = args
            .command
            .strip_prefix(TASK_COMMAND_PREFIX)
            .unwrap_or(&args.command)
            .trim();
        if !command.is_empty() {
            return command.to_string();
        }
    }
    call.name.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call_with_args(arguments: &str) -> ToolCall {
        ToolCall::new("c1", "dispatch_task", arguments)
    }

    #[test]
    fn prefixed_command_is_task_dispatch() {
        let call = call_with_args(r#"{"command":"task: build the index"}"#);
        assert!(is_task_dispatch(&call));
    }

    #[test]
    fn unprefixed_command_is_not_task_dispatch() {
        let call = call_with_args(r#"{"command":"ls -la"}"#);
        assert!(!is_task_dispatch(&call));
    }

    #[test]
    fn malformed_arguments_are_not_task_dispatch() {
        assert!(!is_task_dispatch(&call_with_args("not json")));
        assert!(!is_task_dispatch(&call_with_args(r#"{"command":42}"#)));
        assert!(!is_task_dispatch(&call_with_args(r#"{"other":"task: x"}"#)));
    }

    #[test]
    fn description_prefers_explicit_field() {
        let call = call_with_args(
            r#"{"command":"task: grep the tree","description":"Search for usages"}"#,
        );
        assert_eq!(task_description(&call), "Search for usages");
    }

    #[test]
    fn description_falls_back_to_stripped_command() {
        let call = call_with_args(r#"{"command":"task:  grep the tree "}"#);
        assert_eq!(task_description(&call), "grep the tree");
    }

    #[test]
    fn description_falls_back_to_tool_name() {
        assert_eq!(task_description(&call_with_args("not json")), "dispatch_task");
        assert_eq!(
            task_description(&call_with_args(r#"{"command":"task:"}"#)),
            "dispatch_task"
        );
        assert_eq!(
            task_description(&call_with_args(r#"{"command":"task: x","description":"  "}"#)),
            "x"
        );
    }
}
