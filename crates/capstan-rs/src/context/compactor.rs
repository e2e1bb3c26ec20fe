//! History compaction: fold the old half of a conversation into a summary.
//!
//! When offloading alone cannot bring a history back under budget, the
//! compactor replaces everything except a recency window with a single
//! model-written summary message. Offloaded results referenced from the
//! summarized span are read back first so the summary covers real content,
//! and store files no longer referenced afterwards are deleted.
//!
//! Compaction is all-or-nothing: if every summarization attempt fails the
//! history comes back unchanged and no file is touched.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::budget::TokenEstimator;
use super::offload::{OffloadStore, parse_offload_reference};
use crate::api::{GenerationOptions, ModelClient};
use crate::events::{EngineEvent, EventHandler, NoopHandler, dispatch};
use crate::stream::StreamAssembler;
use crate::Message;

/// Prefix of the summary message produced by compaction.
///
/// Marks the message as machine-written so downstream passes (and humans
/// reading transcripts) can tell it apart from real user input.
pub const COMPACTION_SUMMARY_PREFIX: &str = "[Conversation compacted] ";

/// The prompt used for compaction. Instructs the model to produce a concise,
/// factual summary suitable for replacing the summarized span outright.
const COMPACTION_PROMPT: &str = "\
Summarize the following conversation messages concisely. Focus on:
- What was accomplished (completed subtasks, files modified)
- Key findings and decisions made
- Failed approaches (what was tried and why it failed)
- File paths, function names, and identifiers mentioned
- Current plan state and what remains to be done

Rules:
- Only include facts explicitly stated in the messages. Do not infer or extrapolate.
- Preserve file paths, function names, and error messages verbatim.
- Be concise — every token must earn its place.
- The summary replaces these messages entirely, so it must stand alone: \
  a reader with no other context must be able to continue the task from it.";

/// Outcome of one compaction pass.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    /// The history after compaction. On failure this is the input history,
    /// unchanged.
    pub messages: Vec<Message>,
    /// Estimated tokens before compaction.
    pub previous_tokens: u64,
    /// Estimated tokens after compaction.
    pub current_tokens: u64,
    /// Tokens recovered (zero on failure).
    pub freed_tokens: u64,
    /// How many trailing messages survived untouched.
    pub preserved_count: usize,
    /// Offloaded files deleted because nothing references them anymore.
    pub deleted_files: Vec<PathBuf>,
    /// Whether compaction took effect.
    pub success: bool,
}

/// Summarizes the old span of a history into one message.
///
/// # Example
///
/// ```ignore
/// let compactor = Compactor::new(client)
///     .with_preserve_count(8)
///     .with_summary_model("some/cheaper-model");
/// let result = compactor.compact(&store, &history).await;
/// if result.success {
///     history = result.messages;
/// }
/// ```
pub struct Compactor {
    client: Arc<dyn ModelClient>,
    estimator: TokenEstimator,
    events: Arc<dyn EventHandler>,
    preserve_count: usize,
    retry_count: u32,
    target_tokens: u64,
    summary_model: Option<String>,
}

impl Compactor {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self {
            client,
            estimator: TokenEstimator::new(),
            events: Arc::new(NoopHandler),
            preserve_count: 8,
            retry_count: 3,
            target_tokens: 2_000,
            summary_model: None,
        }
    }

    /// How many trailing messages to keep verbatim.
    pub fn with_preserve_count(mut self, count: usize) -> Self {
        self.preserve_count = count;
        self
    }

    /// How many summarization attempts before giving up. Clamped to at
    /// least 1.
    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = count.max(1);
        self
    }

    /// Rough token size the summary should aim for. The model's output is
    /// capped at 120% of this.
    pub fn with_target_tokens(mut self, tokens: u64) -> Self {
        self.target_tokens = tokens;
        self
    }

    /// Model to summarize with (typically cheaper than the main model).
    /// Only honored when it differs from the client's current model and
    /// the client supports switching.
    pub fn with_summary_model(mut self, model: impl Into<String>) -> Self {
        self.summary_model = Some(model.into());
        self
    }

    pub fn with_estimator(mut self, estimator: TokenEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = events;
        self
    }

    /// Compact `history` down to a summary plus its recency window.
    ///
    /// Histories no longer than the preserve count come back unchanged
    /// without a model call. Otherwise the head span is rendered to a
    /// transcript (offloaded results restored inline), summarized with
    /// retries, and replaced by one summary message; store files
    /// referenced by neither the summary window nor the preserved tail
    /// are then deleted.
    pub async fn compact(&self, store: &OffloadStore, history: &[Message]) -> CompactionResult {
        let previous_tokens = self.estimator.count(history);

        if history.len() <= self.preserve_count {
            debug!(
                len = history.len(),
                preserve_count = self.preserve_count,
                "history within preserve window; compaction not needed"
            );
            return CompactionResult {
                messages: history.to_vec(),
                previous_tokens,
                current_tokens: previous_tokens,
                freed_tokens: 0,
                preserved_count: history.len(),
                deleted_files: Vec::new(),
                success: true,
            };
        }

        let split = history.len() - self.preserve_count;
        let (head, tail) = history.split_at(split);
        let transcript = self.render_transcript(store, head).await;
        let system = format!(
            "{COMPACTION_PROMPT}\n\nKeep the summary under roughly {} tokens.",
            self.target_tokens
        );
        let client = self.summary_client();

        let mut summary_text: Option<String> = None;
        for attempt in 1..=self.retry_count {
            match self.request_summary(&client, &system, &transcript).await {
                Ok(text) => {
                    summary_text = Some(text);
                    break;
                }
                Err(error) => {
                    warn!(attempt, error = %error, "summarization attempt failed");
                    if attempt < self.retry_count {
                        tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                    }
                }
            }
        }

        let Some(summary_text) = summary_text else {
            let error = format!("summarization failed after {} attempts", self.retry_count);
            warn!("{error}; history left unchanged");
            dispatch(&*self.events, &EngineEvent::CompactionFailed { error: &error });
            return CompactionResult {
                messages: history.to_vec(),
                previous_tokens,
                current_tokens: previous_tokens,
                freed_tokens: 0,
                preserved_count: 0,
                deleted_files: Vec::new(),
                success: false,
            };
        };

        let summary = Message::user(format!("{COMPACTION_SUMMARY_PREFIX}{summary_text}"));
        let mut messages = Vec::with_capacity(1 + tail.len());
        messages.push(summary);
        messages.extend_from_slice(tail);

        let current_tokens = self.estimator.count(&messages);
        let freed_tokens = previous_tokens.saturating_sub(current_tokens);
        let deleted_files = self.delete_unreferenced(store, tail).await;

        info!(
            previous_tokens,
            current_tokens,
            freed_tokens,
            deleted = deleted_files.len(),
            "compacted history"
        );
        dispatch(
            &*self.events,
            &EngineEvent::Compacted {
                previous_tokens,
                current_tokens,
                freed_tokens,
                deleted_files: deleted_files.len(),
            },
        );

        CompactionResult {
            messages,
            previous_tokens,
            current_tokens,
            freed_tokens,
            preserved_count: tail.len(),
            deleted_files,
            success: true,
        }
    }

    /// Render the head span to a plain-text transcript, restoring
    /// offloaded results inline so the summary sees actual content.
    ///
    /// A reference whose file cannot be read is rendered as an
    /// "unavailable" placeholder; a reference pointing outside the store
    /// root is rendered as-is and the file is never touched.
    async fn render_transcript(&self, store: &OffloadStore, head: &[Message]) -> String {
        let mut transcript = String::new();
        for message in head {
            let mut text = message.text_content();
            if let Some(path) = parse_offload_reference(&text) {
                if !store.contains(&path) {
                    warn!(path = %path.display(), "offload reference escapes store root; leaving as-is");
                } else {
                    text = match store.restore(&path).await {
                        Ok(restored) => restored,
                        Err(error) => {
                            warn!(error = %error, "failed to restore offloaded result");
                            format!("[offloaded tool result unavailable: {}]", path.display())
                        }
                    };
                }
            }
            if text.is_empty() {
                continue;
            }
            transcript.push_str(&format!("[{}]: {text}\n\n", message.role));
        }
        transcript
    }

    /// Pick the client for the summarization call: the configured summary
    /// model when it differs and switching is supported, the main model
    /// otherwise. Output is capped at 120% of the target size either way.
    fn summary_client(&self) -> Arc<dyn ModelClient> {
        let mut client: Arc<dyn ModelClient> = self.client.clone();
        if let Some(model) = &self.summary_model {
            if model.as_str() != client.model_id() && client.supports_model_switching() {
                debug!(model = %model, "switching to summary model");
                client = client.with_model(model);
            }
        }
        let cap = (self.target_tokens as f64 * 1.2).ceil() as u32;
        client.with_generation_options(GenerationOptions::new().with_max_output_tokens(cap))
    }

    async fn request_summary(
        &self,
        client: &Arc<dyn ModelClient>,
        system: &str,
        transcript: &str,
    ) -> Result<String, String> {
        let cancel = CancellationToken::new();
        let request = vec![Message::user(transcript)];
        let stream = client.generate(system, &request, &[], &cancel).await?;
        let turn = StreamAssembler::new()
            .assemble(stream, &cancel)
            .await
            .map_err(|e| format!("summary assembly failed: {e}"))?;
        let text = turn.message.text_content();
        if text.trim().is_empty() {
            return Err("summary was empty".to_string());
        }
        Ok(text)
    }

    /// Delete store files referenced by no remaining message. The tail is
    /// the only place references can survive, so its reference set is the
    /// keep set. A file that fails to list or delete is skipped, not
    /// fatal.
    async fn delete_unreferenced(&self, store: &OffloadStore, tail: &[Message]) -> Vec<PathBuf> {
        let keep: HashSet<PathBuf> = tail
            .iter()
            .filter_map(|message| parse_offload_reference(&message.text_content()))
            .collect();

        let listed = match store.list().await {
            Ok(listed) => listed,
            Err(error) => {
                warn!(error = %error, "could not list offload store; skipping cleanup");
                return Vec::new();
            }
        };

        let mut deleted = Vec::new();
        for path in listed {
            if keep.contains(&path) {
                continue;
            }
            match store.remove(&path).await {
                Ok(()) => deleted.push(path),
                Err(error) => warn!(error = %error, "could not delete offloaded file"),
            }
        }
        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{FragmentStream, GenerateFuture};
    use crate::stream::StreamFragment;
    use crate::ToolDefinition;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::super::offload::{OFFLOAD_REFERENCE_PREFIX, offload_reference};

    /// Client that fails its first `fail_first` calls, then streams a
    /// fixed reply, recording every transcript and model switch.
    struct ScriptedClient {
        reply: String,
        fail_first: u32,
        calls: AtomicU32,
        transcripts: Mutex<Vec<String>>,
        model: String,
        supports_switching: bool,
        switched_to: Mutex<Vec<String>>,
        options: Mutex<Option<GenerationOptions>>,
    }

    impl ScriptedClient {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                fail_first: 0,
                calls: AtomicU32::new(0),
                transcripts: Mutex::new(Vec::new()),
                model: "main-model".to_string(),
                supports_switching: false,
                switched_to: Mutex::new(Vec::new()),
                options: Mutex::new(None),
            })
        }

        fn failing_first(reply: &str, fail_first: u32) -> Arc<Self> {
            let mut client = Self::new(reply);
            Arc::get_mut(&mut client).unwrap().fail_first = fail_first;
            client
        }

        fn switchable(reply: &str) -> Arc<Self> {
            let mut client = Self::new(reply);
            Arc::get_mut(&mut client).unwrap().supports_switching = true;
            client
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ModelClient for ScriptedClient {
        fn model_id(&self) -> &str {
            &self.model
        }

        fn supports_model_switching(&self) -> bool {
            self.supports_switching
        }

        fn with_model(self: Arc<Self>, model: &str) -> Arc<dyn ModelClient> {
            self.switched_to.lock().unwrap().push(model.to_string());
            self
        }

        fn with_generation_options(self: Arc<Self>, options: GenerationOptions) -> Arc<dyn ModelClient> {
            *self.options.lock().unwrap() = Some(options);
            self
        }

        fn generate(
            &self,
            _system_prompt: &str,
            history: &[Message],
            _tools: &[ToolDefinition],
            _cancel: &CancellationToken,
        ) -> GenerateFuture<'_> {
            let transcript = history
                .first()
                .map(|m| m.text_content())
                .unwrap_or_default();
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let reply = self.reply.clone();
            let fail = call <= self.fail_first;
            self.transcripts.lock().unwrap().push(transcript);
            Box::pin(async move {
                if fail {
                    return Err(format!("scripted failure on call {call}"));
                }
                let fragments = vec![StreamFragment::TextDelta(reply)];
                Ok(Box::pin(futures::stream::iter(fragments)) as FragmentStream)
            })
        }
    }

    async fn empty_store() -> (tempfile::TempDir, OffloadStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = OffloadStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    fn reference_message(call_id: &str, path: &std::path::Path) -> Message {
        Message::tool_result(call_id, offload_reference(path))
    }

    #[tokio::test]
    async fn short_history_skips_the_model_entirely() {
        let (_dir, store) = empty_store().await;
        let client = ScriptedClient::new("unused");
        let compactor = Compactor::new(client.clone()).with_preserve_count(5);

        let history = vec![
            Message::user("do the thing"),
            Message::assistant_text("on it"),
            Message::user("thanks"),
        ];
        let result = compactor.compact(&store, &history).await;

        assert!(result.success);
        assert_eq!(result.messages, history);
        assert_eq!(result.preserved_count, 3);
        assert_eq!(result.freed_tokens, 0);
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn fifteen_messages_collapse_to_summary_plus_tail() {
        let (_dir, store) = empty_store().await;

        // Five offloaded results referenced from the head, five bulky
        // in-line results, five recent messages to preserve.
        let mut history = Vec::new();
        for i in 0..5 {
            let path = store.offload(&format!("stored result {i}: {}", "x".repeat(2_000))).await.unwrap();
            history.push(reference_message(&format!("ref{i}"), &path));
        }
        for i in 0..5 {
            history.push(Message::tool_result(format!("bulk{i}"), "y".repeat(2_000)));
        }
        for i in 0..5 {
            history.push(Message::user(format!("recent message {i}")));
        }
        assert_eq!(history.len(), 15);

        let client = ScriptedClient::new("Work so far: indexed the repo and fixed the parser.");
        let compactor = Compactor::new(client.clone()).with_preserve_count(5);
        let result = compactor.compact(&store, &history).await;

        assert!(result.success);
        assert_eq!(result.messages.len(), 6);
        assert!(
            result.messages[0]
                .text_content()
                .starts_with(COMPACTION_SUMMARY_PREFIX)
        );
        assert_eq!(&result.messages[1..], &history[10..]);
        assert_eq!(result.preserved_count, 5);
        assert_eq!(result.deleted_files.len(), 5);
        assert!(store.list().await.unwrap().is_empty());
        assert!(result.previous_tokens > result.current_tokens);
        assert_eq!(
            result.freed_tokens,
            result.previous_tokens - result.current_tokens
        );
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (_dir, store) = empty_store().await;
        let client = ScriptedClient::failing_first("summary after retries", 2);
        let compactor = Compactor::new(client.clone())
            .with_preserve_count(1)
            .with_retry_count(3);

        let history = vec![
            Message::user("first"),
            Message::assistant_text("second"),
            Message::user("third"),
        ];
        let result = compactor.compact(&store, &history).await;

        assert!(result.success);
        assert_eq!(client.call_count(), 3);
        assert!(result.messages[0].text_content().contains("summary after retries"));
    }

    #[tokio::test]
    async fn exhausted_retries_leave_everything_untouched() {
        let (_dir, store) = empty_store().await;
        let path = store.offload("still needed").await.unwrap();

        let client = ScriptedClient::failing_first("never delivered", 99);
        let compactor = Compactor::new(client.clone())
            .with_preserve_count(1)
            .with_retry_count(2);

        let history = vec![
            reference_message("c1", &path),
            Message::assistant_text("working"),
            Message::user("latest"),
        ];
        let result = compactor.compact(&store, &history).await;

        assert!(!result.success);
        assert_eq!(result.messages, history);
        assert_eq!(result.freed_tokens, 0);
        assert!(result.deleted_files.is_empty());
        assert_eq!(client.call_count(), 2);
        assert_eq!(store.list().await.unwrap(), vec![path]);
    }

    #[tokio::test]
    async fn files_referenced_from_the_tail_survive() {
        let (_dir, store) = empty_store().await;
        let stale = store.offload("summarized away").await.unwrap();
        let live = store.offload("still referenced").await.unwrap();

        let history = vec![
            reference_message("old", &stale),
            Message::assistant_text("progress notes"),
            Message::user("keep going"),
            reference_message("new", &live),
        ];
        let client = ScriptedClient::new("short summary");
        let compactor = Compactor::new(client).with_preserve_count(2);
        let result = compactor.compact(&store, &history).await;

        assert!(result.success);
        assert_eq!(result.deleted_files, vec![stale]);
        assert_eq!(store.list().await.unwrap(), vec![live]);
    }

    #[tokio::test]
    async fn offloaded_content_is_restored_into_the_transcript() {
        let (_dir, store) = empty_store().await;
        let stored = "the parser rejects widgets without a name field";
        let path = store.offload(stored).await.unwrap();

        let history = vec![
            reference_message("c1", &path),
            Message::assistant_text("noted"),
            Message::user("continue"),
        ];
        let client = ScriptedClient::new("summary");
        let compactor = Compactor::new(client.clone()).with_preserve_count(1);
        compactor.compact(&store, &history).await;

        let transcripts = client.transcripts.lock().unwrap();
        assert!(transcripts[0].contains(stored));
        assert!(!transcripts[0].contains(OFFLOAD_REFERENCE_PREFIX));
    }

    #[tokio::test]
    async fn unreadable_reference_becomes_placeholder() {
        let (_dir, store) = empty_store().await;
        let missing = store.root().join("of-dead-0000.txt");

        let history = vec![
            reference_message("c1", &missing),
            Message::assistant_text("noted"),
            Message::user("continue"),
        ];
        let client = ScriptedClient::new("summary");
        let compactor = Compactor::new(client.clone()).with_preserve_count(1);
        compactor.compact(&store, &history).await;

        let transcripts = client.transcripts.lock().unwrap();
        assert!(transcripts[0].contains("offloaded tool result unavailable"));
    }

    #[tokio::test]
    async fn summary_model_used_only_when_switchable_and_different() {
        let (_dir, store) = empty_store().await;
        let history = vec![
            Message::user("a"),
            Message::assistant_text("b"),
            Message::user("c"),
        ];

        let switchable = ScriptedClient::switchable("s");
        let compactor = Compactor::new(switchable.clone())
            .with_preserve_count(1)
            .with_summary_model("cheap-model");
        compactor.compact(&store, &history).await;
        assert_eq!(
            switchable.switched_to.lock().unwrap().clone(),
            vec!["cheap-model".to_string()]
        );

        let fixed = ScriptedClient::new("s");
        let compactor = Compactor::new(fixed.clone())
            .with_preserve_count(1)
            .with_summary_model("cheap-model");
        compactor.compact(&store, &history).await;
        assert!(fixed.switched_to.lock().unwrap().is_empty());

        let same = ScriptedClient::switchable("s");
        let compactor = Compactor::new(same.clone())
            .with_preserve_count(1)
            .with_summary_model("main-model");
        compactor.compact(&store, &history).await;
        assert!(same.switched_to.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn output_is_capped_above_the_target() {
        let (_dir, store) = empty_store().await;
        let history = vec![
            Message::user("a"),
            Message::assistant_text("b"),
            Message::user("c"),
        ];

        let client = ScriptedClient::new("s");
        let compactor = Compactor::new(client.clone())
            .with_preserve_count(1)
            .with_target_tokens(2_000);
        compactor.compact(&store, &history).await;

        let options = client.options.lock().unwrap().clone().unwrap();
        assert_eq!(options.max_output_tokens, Some(2_400));
    }
}
