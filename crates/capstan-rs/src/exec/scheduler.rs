//! Batch scheduling and result collection.
//!
//! [`ToolScheduler::schedule`] snapshots one assistant message's tool calls
//! into a [`ScheduledBatch`] of pending tasks; nothing executes until
//! [`ScheduledBatch::collect_results`] runs the batch. Between those two
//! calls the task list is visible for observation, which is also how
//! callers inspect cancellation after an abort.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::pending::{PendingTask, ToolInvoker};
use super::{is_task_dispatch, task_description};
use crate::events::{EngineEvent, EventHandler, NoopHandler, dispatch};
use crate::{EngineError, ToolCall, ToolResult};

/// Default concurrency cap for task batches.
pub const DEFAULT_MAX_PARALLEL: usize = 4;

// ── Scheduler ──────────────────────────────────────────────────────

/// Orders and dispatches the tool calls of one turn.
///
/// The invoker, the concurrency cap, and the event handler are injected at
/// construction; each [`schedule`](Self::schedule) call then owns its own
/// batch, so one scheduler can serve many turns without shared state.
pub struct ToolScheduler {
    invoker: Arc<dyn ToolInvoker>,
    events: Arc<dyn EventHandler>,
    max_parallel: usize,
}

impl ToolScheduler {
    pub fn new(invoker: Arc<dyn ToolInvoker>) -> Self {
        Self {
            invoker,
            events: Arc::new(NoopHandler),
            max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }

    /// Cap on concurrently running calls within a task batch. Clamped to
    /// at least 1.
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Handler receiving tool and task lifecycle events.
    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = events;
        self
    }

    /// Create the pending tasks for one batch of tool calls.
    ///
    /// Dispatch is idempotent per id: a duplicate id maps to the task
    /// created for its first occurrence rather than a second execution.
    /// Every task immediately receives a child of `cancel`, so a turn
    /// cancelled before collection still marks every task. Execution
    /// itself starts lazily inside
    /// [`collect_results`](ScheduledBatch::collect_results).
    pub fn schedule(&self, tool_calls: Vec<ToolCall>, cancel: &CancellationToken) -> ScheduledBatch {
        let mut tasks: Vec<Arc<PendingTask>> = Vec::with_capacity(tool_calls.len());
        let mut seen: HashSet<String> = HashSet::new();
        for call in tool_calls {
            if !seen.insert(call.id.clone()) {
                debug!("duplicate tool call id {}; reusing existing task", call.id);
                continue;
            }
            tasks.push(Arc::new(PendingTask::new(call, cancel)));
        }
        ScheduledBatch {
            tasks,
            invoker: self.invoker.clone(),
            events: self.events.clone(),
            max_parallel: self.max_parallel,
            cancel: cancel.clone(),
            tracker: TaskEventTracker::new(),
        }
    }
}

// ── Batch ──────────────────────────────────────────────────────────

/// The tool calls of one turn, scheduled but not yet (fully) executed.
pub struct ScheduledBatch {
    tasks: Vec<Arc<PendingTask>>,
    invoker: Arc<dyn ToolInvoker>,
    events: Arc<dyn EventHandler>,
    max_parallel: usize,
    cancel: CancellationToken,
    tracker: TaskEventTracker,
}

impl ScheduledBatch {
    /// The calls this batch will execute, in submission order.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.tasks
            .iter()
            .map(|task| task.tool_call().clone())
            .collect()
    }

    /// The pending tasks, in submission order. Callers clone this before
    /// collecting to observe settlement and cancellation afterwards.
    pub fn tasks(&self) -> Vec<Arc<PendingTask>> {
        self.tasks.clone()
    }

    /// Execute every group and return exactly one result per call, in
    /// submission order.
    ///
    /// Ordinary calls run strictly sequentially. Contiguous task-dispatch
    /// runs execute in chunks of at most `max_parallel`, each chunk
    /// settling fully before the next begins; one call's failure never
    /// short-circuits its chunk. If the turn token fires, every unsettled
    /// task is cancelled, drained, and the call returns
    /// [`EngineError::Aborted`] instead of partial results.
    pub async fn collect_results(self) -> Result<Vec<ToolResult>, EngineError> {
        let groups = partition(&self.tasks);
        let mut results: Vec<ToolResult> = Vec::with_capacity(self.tasks.len());

        for group in groups {
            if self.cancel.is_cancelled() {
                return self.abort_remaining().await;
            }
            match group {
                ExecutionGroup::Sequential(task) => {
                    self.start_task(&task);
                    let result = task.settle().await;
                    self.on_settled(&task, &result);
                    results.push(result);
                    if self.cancel.is_cancelled() {
                        return self.abort_remaining().await;
                    }
                }
                ExecutionGroup::TaskBatch(batch) => {
                    for chunk in batch.chunks(self.max_parallel) {
                        if self.cancel.is_cancelled() {
                            return self.abort_remaining().await;
                        }
                        for task in chunk {
                            self.start_task(task);
                        }
                        let settled = join_all(chunk.iter().map(|task| task.settle())).await;
                        for (task, result) in chunk.iter().zip(&settled) {
                            self.on_settled(task, result);
                        }
                        results.extend(settled);
                        if self.cancel.is_cancelled() {
                            return self.abort_remaining().await;
                        }
                    }
                }
            }
        }

        Ok(results)
    }

    fn start_task(&self, task: &Arc<PendingTask>) {
        let call = task.tool_call();
        dispatch(&*self.events, &EngineEvent::ToolStarted { call });
        if is_task_dispatch(call) {
            let description = task_description(call);
            self.tracker.record_start(&call.id);
            dispatch(
                &*self.events,
                &EngineEvent::TaskStarted {
                    call_id: &call.id,
                    description: &description,
                },
            );
        }
        task.start(&self.invoker);
    }

    fn on_settled(&self, task: &Arc<PendingTask>, result: &ToolResult) {
        let call = task.tool_call();
        dispatch(
            &*self.events,
            &EngineEvent::ToolSettled {
                call_id: &call.id,
                result,
            },
        );
        if let Some(elapsed) = self.tracker.finish(&call.id) {
            let description = task_description(call);
            dispatch(
                &*self.events,
                &EngineEvent::TaskFinished {
                    call_id: &call.id,
                    description: &description,
                    elapsed,
                },
            );
        }
    }

    /// Cancellation path: cancel everything, wait for running work to
    /// settle, then report. Partial results are discarded; callers get
    /// `Aborted`, never a short list.
    async fn abort_remaining(&self) -> Result<Vec<ToolResult>, EngineError> {
        warn!("cancellation during result collection; aborting batch");
        for task in &self.tasks {
            task.cancel();
        }
        for task in &self.tasks {
            task.drain().await;
        }
        // End events for task dispatches that started but never settled
        // through the normal path; the tracker deduplicates against ends
        // already delivered.
        for task in &self.tasks {
            let call = task.tool_call();
            if let Some(elapsed) = self.tracker.finish(&call.id) {
                let description = task_description(call);
                dispatch(
                    &*self.events,
                    &EngineEvent::TaskFinished {
                        call_id: &call.id,
                        description: &description,
                        elapsed,
                    },
                );
            }
        }
        Err(EngineError::Aborted)
    }
}

impl Drop for ScheduledBatch {
    fn drop(&mut self) {
        // A batch dropped mid-collection must not leave spawned work
        // behind; settled tasks have no handle left to abort.
        for task in &self.tasks {
            task.abort();
        }
    }
}

// ── Partitioning ───────────────────────────────────────────────────

enum ExecutionGroup {
    Sequential(Arc<PendingTask>),
    TaskBatch(Vec<Arc<PendingTask>>),
}

/// Split tasks, in submission order, into maximal contiguous runs of
/// task-dispatch calls (one batch each) and ordinary calls (one singleton
/// group each).
fn partition(tasks: &[Arc<PendingTask>]) -> Vec<ExecutionGroup> {
    let mut groups = Vec::new();
    let mut run: Vec<Arc<PendingTask>> = Vec::new();
    for task in tasks {
        if is_task_dispatch(task.tool_call()) {
            run.push(task.clone());
        } else {
            if !run.is_empty() {
                groups.push(ExecutionGroup::TaskBatch(std::mem::take(&mut run)));
            }
            groups.push(ExecutionGroup::Sequential(task.clone()));
        }
    }
    if !run.is_empty() {
        groups.push(ExecutionGroup::TaskBatch(run));
    }
    groups
}

// ── Task event bookkeeping ─────────────────────────────────────────

/// Start/end bookkeeping for task-dispatch events.
///
/// `finish` hands out a call's elapsed time at most once, so the end event
/// can be notified from both the settle path and the cancellation sweep
/// without firing twice. Calls without a recorded start never finish.
struct TaskEventTracker {
    started: Mutex<HashMap<String, Instant>>,
    ended: Mutex<HashSet<String>>,
}

impl TaskEventTracker {
    fn new() -> Self {
        Self {
            started: Mutex::new(HashMap::new()),
            ended: Mutex::new(HashSet::new()),
        }
    }

    fn record_start(&self, call_id: &str) {
        self.started
            .lock()
            .unwrap()
            .insert(call_id.to_string(), Instant::now());
    }

    fn finish(&self, call_id: &str) -> Option<Duration> {
        let started_at = self.started.lock().unwrap().get(call_id).copied()?;
        if !self.ended.lock().unwrap().insert(call_id.to_string()) {
            return None;
        }
        Some(started_at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::FnEventHandler;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    /// Invoker that scripts per-call delays, failures, and panics, while
    /// recording start order and peak concurrency.
    struct ScriptedInvoker {
        delays: HashMap<String, Duration>,
        default_delay: Duration,
        fail: HashSet<String>,
        panic_on: HashSet<String>,
        started_order: Arc<Mutex<Vec<String>>>,
        running: Arc<AtomicUsize>,
        peak_running: Arc<AtomicUsize>,
    }

    impl ScriptedInvoker {
        fn new() -> Self {
            Self {
                delays: HashMap::new(),
                default_delay: Duration::from_millis(10),
                fail: HashSet::new(),
                panic_on: HashSet::new(),
                started_order: Arc::new(Mutex::new(Vec::new())),
                running: Arc::new(AtomicUsize::new(0)),
                peak_running: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn with_delay(mut self, id: &str, delay: Duration) -> Self {
            self.delays.insert(id.to_string(), delay);
            self
        }

        fn failing(mut self, id: &str) -> Self {
            self.fail.insert(id.to_string());
            self
        }

        fn panicking(mut self, id: &str) -> Self {
            self.panic_on.insert(id.to_string());
            self
        }
    }

    impl ToolInvoker for ScriptedInvoker {
        fn invoke(&self, call: &ToolCall) -> crate::exec::InvokeFuture<'_> {
            let id = call.id.clone();
            let delay = self.delays.get(&id).copied().unwrap_or(self.default_delay);
            let fails = self.fail.contains(&id);
            let panics = self.panic_on.contains(&id);
            let started_order = self.started_order.clone();
            let running = self.running.clone();
            let peak_running = self.peak_running.clone();
            Box::pin(async move {
                started_order.lock().unwrap().push(id.clone());
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak_running.fetch_max(now, Ordering::SeqCst);
                sleep(delay).await;
                running.fetch_sub(1, Ordering::SeqCst);
                if panics {
                    panic!("scripted panic in {id}");
                }
                if fails {
                    return Err(format!("scripted failure in {id}"));
                }
                Ok(ToolResult::ok(id, "done"))
            })
        }
    }

    fn plain_call(id: &str) -> ToolCall {
        ToolCall::new(id, "read_file", r#"{"path":"src/lib.rs"}"#)
    }

    fn task_call(id: &str) -> ToolCall {
        ToolCall::new(
            id,
            "dispatch_task",
            r#"{"command":"task: index the repo"}"#,
        )
    }

    fn result_ids(results: &[ToolResult]) -> Vec<&str> {
        results.iter().map(|r| r.tool_call_id.as_str()).collect()
    }

    #[tokio::test]
    async fn one_result_per_call_in_submission_order() {
        // Make the first batch member the slowest so completion order
        // differs from submission order.
        let invoker = Arc::new(
            ScriptedInvoker::new().with_delay("b", Duration::from_millis(60)),
        );
        let scheduler = ToolScheduler::new(invoker).with_max_parallel(3);
        let calls = vec![
            plain_call("a"),
            task_call("b"),
            task_call("c"),
            task_call("d"),
            plain_call("e"),
        ];

        let batch = scheduler.schedule(calls, &CancellationToken::new());
        let results = batch.collect_results().await.unwrap();

        assert_eq!(result_ids(&results), vec!["a", "b", "c", "d", "e"]);
        assert!(results.iter().all(|r| !r.return_value.is_error));
    }

    #[tokio::test]
    async fn invoke_failure_is_isolated_to_its_result() {
        let invoker = Arc::new(ScriptedInvoker::new().failing("c2"));
        let scheduler = ToolScheduler::new(invoker);
        let calls = vec![task_call("c1"), task_call("c2"), task_call("c3")];

        let batch = scheduler.schedule(calls, &CancellationToken::new());
        let results = batch.collect_results().await.unwrap();

        assert!(!results[0].return_value.is_error);
        assert!(results[1].return_value.is_error);
        assert!(results[1].return_value.message.contains("scripted failure"));
        assert!(!results[2].return_value.is_error);
    }

    #[tokio::test]
    async fn invoke_panic_becomes_error_result() {
        let invoker = Arc::new(ScriptedInvoker::new().panicking("p1"));
        let scheduler = ToolScheduler::new(invoker);
        let calls = vec![plain_call("p1"), plain_call("p2")];

        let batch = scheduler.schedule(calls, &CancellationToken::new());
        let results = batch.collect_results().await.unwrap();

        assert!(results[0].return_value.is_error);
        assert!(results[0].return_value.message.contains("failed"));
        assert!(!results[1].return_value.is_error);
    }

    #[tokio::test]
    async fn task_batch_respects_max_parallel() {
        let invoker = Arc::new(ScriptedInvoker::new());
        let peak = invoker.peak_running.clone();
        let scheduler = ToolScheduler::new(invoker).with_max_parallel(2);
        let calls = (1..=6).map(|i| task_call(&format!("t{i}"))).collect();

        let batch = scheduler.schedule(calls, &CancellationToken::new());
        let results = batch.collect_results().await.unwrap();

        assert_eq!(results.len(), 6);
        assert!(
            peak.load(Ordering::SeqCst) <= 2,
            "no more than max_parallel calls may run at once"
        );
    }

    #[tokio::test]
    async fn groups_execute_strictly_in_order() {
        let invoker = Arc::new(ScriptedInvoker::new());
        let order = invoker.started_order.clone();
        let scheduler = ToolScheduler::new(invoker).with_max_parallel(4);
        let calls = vec![
            plain_call("first"),
            task_call("t1"),
            task_call("t2"),
            task_call("t3"),
            plain_call("last"),
        ];

        let batch = scheduler.schedule(calls, &CancellationToken::new());
        batch.collect_results().await.unwrap();

        let started = order.lock().unwrap().clone();
        assert_eq!(started[0], "first", "sequential group precedes the batch");
        assert_eq!(started[4], "last", "final group waits for the batch");
        let middle: HashSet<&str> = started[1..4].iter().map(String::as_str).collect();
        assert_eq!(middle, HashSet::from(["t1", "t2", "t3"]));
    }

    #[tokio::test]
    async fn duplicate_ids_collapse_into_one_task() {
        let invoker = Arc::new(ScriptedInvoker::new());
        let scheduler = ToolScheduler::new(invoker);
        let calls = vec![plain_call("dup"), plain_call("dup"), plain_call("other")];

        let batch = scheduler.schedule(calls, &CancellationToken::new());
        assert_eq!(batch.tool_calls().len(), 2);

        let results = batch.collect_results().await.unwrap();
        assert_eq!(result_ids(&results), vec!["dup", "other"]);
    }

    #[tokio::test]
    async fn empty_batch_collects_nothing() {
        let invoker = Arc::new(ScriptedInvoker::new());
        let scheduler = ToolScheduler::new(invoker);
        let batch = scheduler.schedule(Vec::new(), &CancellationToken::new());
        assert!(batch.collect_results().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_aborts_and_cancels_every_task() {
        let invoker = Arc::new(
            ScriptedInvoker::new()
                .with_delay("b1", Duration::from_secs(5))
                .with_delay("b2", Duration::from_secs(5))
                .with_delay("b3", Duration::from_secs(5))
                .with_delay("b4", Duration::from_secs(5)),
        );
        let scheduler = ToolScheduler::new(invoker).with_max_parallel(2);
        let calls = vec![
            task_call("b1"),
            task_call("b2"),
            task_call("b3"),
            task_call("b4"),
        ];

        let cancel = CancellationToken::new();
        let batch = scheduler.schedule(calls, &cancel);
        let tasks = batch.tasks();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = batch.collect_results().await.unwrap_err();
        assert_eq!(err, EngineError::Aborted);
        assert_eq!(tasks.len(), 4);
        for task in &tasks {
            assert!(task.was_cancelled(), "{} not cancelled", task.tool_call().id);
            assert!(task.is_settled(), "{} not settled", task.tool_call().id);
        }
    }

    #[tokio::test]
    async fn task_end_event_fires_at_most_once_per_call() {
        let finished: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));
        let sink = finished.clone();
        let handler = Arc::new(FnEventHandler::new(move |event| {
            if let EngineEvent::TaskFinished { call_id, .. } = event {
                *sink.lock().unwrap().entry(call_id.to_string()).or_insert(0) += 1;
            }
        }));

        let invoker = Arc::new(
            ScriptedInvoker::new()
                .with_delay("s1", Duration::from_secs(5))
                .with_delay("s2", Duration::from_secs(5)),
        );
        let scheduler = ToolScheduler::new(invoker)
            .with_max_parallel(1)
            .with_events(handler);
        let calls = vec![task_call("s1"), task_call("s2")];

        let cancel = CancellationToken::new();
        let batch = scheduler.schedule(calls, &cancel);
        let canceller = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        assert_eq!(
            batch.collect_results().await.unwrap_err(),
            EngineError::Aborted
        );
        for (call_id, count) in finished.lock().unwrap().iter() {
            assert_eq!(*count, 1, "task end fired {count} times for {call_id}");
        }
    }

    #[tokio::test]
    async fn panicking_event_handler_does_not_break_collection() {
        struct Panicky;
        impl EventHandler for Panicky {
            fn on_event(&self, _event: &EngineEvent<'_>) {
                panic!("handler bug");
            }
        }

        let invoker = Arc::new(ScriptedInvoker::new());
        let scheduler = ToolScheduler::new(invoker).with_events(Arc::new(Panicky));
        let calls = vec![plain_call("a"), task_call("b")];

        let batch = scheduler.schedule(calls, &CancellationToken::new());
        let results = batch.collect_results().await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| !r.return_value.is_error));
    }
}
