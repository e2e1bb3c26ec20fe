//! The per-turn budget state machine: inspect, offload, then maybe compact.
//!
//! [`ContextBudgetManager::remediate`] runs once per turn, between tool
//! settlement and the next model call. It is deliberately boring: a linear
//! pass whose only loop is the compactor's internal retry. Offloading is
//! always tried first because it is cheap and lossless; compaction costs a
//! model call and destroys detail, so it runs only when offloading left
//! the history over budget and a cooldown has elapsed since the last
//! attempt, successful or not.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::budget::TokenEstimator;
use super::compactor::{CompactionResult, Compactor};
use super::offload::{OFFLOAD_REFERENCE_PREFIX, OffloadStore, offload_reference};
use crate::api::ModelClient;
use crate::events::{EngineEvent, EventHandler, NoopHandler, dispatch};
use crate::{ContentPart, Message, MessageRole};

/// Tuning knobs for the budget manager.
///
/// The defaults suit a 200k-token context window with moderately chatty
/// tools; the outer loop usually overrides `offload_threshold` per model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextBudgetConfig {
    /// Token count above which remediation starts doing work.
    pub offload_threshold: u64,
    /// Fraction of tool messages scanned per pass, oldest first.
    pub scan_ratio: f64,
    /// Minimum text size (chars) for a tool result to be worth offloading.
    pub min_offload_chars: usize,
    /// If offloading freed at least this many tokens, compaction is
    /// skipped this turn.
    pub compact_trigger_threshold: u64,
    /// Trailing messages compaction leaves untouched.
    pub preserve_count: usize,
    /// Turns that must elapse between compaction attempts.
    pub compact_cooldown_steps: u64,
    /// Summarization attempts before compaction reports failure.
    pub retry_count: u32,
    /// Rough token size the summary should aim for.
    pub target_tokens: u64,
    /// Model used for summarization when the client supports switching.
    pub summary_model: Option<String>,
}

impl Default for ContextBudgetConfig {
    fn default() -> Self {
        Self {
            offload_threshold: 80_000,
            scan_ratio: 0.5,
            min_offload_chars: 2_000,
            compact_trigger_threshold: 8_000,
            preserve_count: 8,
            compact_cooldown_steps: 5,
            retry_count: 3,
            target_tokens: 2_000,
            summary_model: None,
        }
    }
}

impl ContextBudgetConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_offload_threshold(mut self, tokens: u64) -> Self {
        self.offload_threshold = tokens;
        self
    }

    /// Clamped to `0.0..=1.0`.
    pub fn with_scan_ratio(mut self, ratio: f64) -> Self {
        self.scan_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn with_min_offload_chars(mut self, chars: usize) -> Self {
        self.min_offload_chars = chars;
        self
    }

    pub fn with_compact_trigger_threshold(mut self, tokens: u64) -> Self {
        self.compact_trigger_threshold = tokens;
        self
    }

    pub fn with_preserve_count(mut self, count: usize) -> Self {
        self.preserve_count = count;
        self
    }

    pub fn with_compact_cooldown_steps(mut self, turns: u64) -> Self {
        self.compact_cooldown_steps = turns;
        self
    }

    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    pub fn with_target_tokens(mut self, tokens: u64) -> Self {
        self.target_tokens = tokens;
        self
    }

    pub fn with_summary_model(mut self, model: impl Into<String>) -> Self {
        self.summary_model = Some(model.into());
        self
    }
}

/// What one offload pass accomplished.
#[derive(Debug, Clone, Copy)]
pub struct OffloadSummary {
    /// Tool results moved to the store.
    pub offloaded: usize,
    /// Estimated tokens recovered.
    pub freed_tokens: u64,
}

/// The outcome of one remediation turn.
#[derive(Debug, Clone)]
pub struct RemediationOutcome {
    /// The history to continue with.
    pub messages: Vec<Message>,
    /// Present when at least one result was offloaded.
    pub offloaded: Option<OffloadSummary>,
    /// Present when compaction was attempted, successful or not.
    pub compacted: Option<CompactionResult>,
}

/// Keeps a growing history inside the model's context window.
///
/// # Example
///
/// ```ignore
/// let store = OffloadStore::open(session_dir.join("offload")).await?;
/// let mut manager = ContextBudgetManager::new(client, store, ContextBudgetConfig::new());
///
/// // once per turn, after tool results land:
/// let outcome = manager.remediate(history).await;
/// history = outcome.messages;
/// ```
pub struct ContextBudgetManager {
    config: ContextBudgetConfig,
    store: OffloadStore,
    estimator: TokenEstimator,
    events: Arc<dyn EventHandler>,
    compactor: Compactor,
    turn: u64,
    last_compaction_turn: Option<u64>,
}

impl ContextBudgetManager {
    pub fn new(
        client: Arc<dyn ModelClient>,
        store: OffloadStore,
        config: ContextBudgetConfig,
    ) -> Self {
        let mut compactor = Compactor::new(client)
            .with_preserve_count(config.preserve_count)
            .with_retry_count(config.retry_count)
            .with_target_tokens(config.target_tokens);
        if let Some(model) = &config.summary_model {
            compactor = compactor.with_summary_model(model.clone());
        }
        Self {
            config,
            store,
            estimator: TokenEstimator::new(),
            events: Arc::new(NoopHandler),
            compactor,
            turn: 0,
            last_compaction_turn: None,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.compactor = self.compactor.with_events(events.clone());
        self.events = events;
        self
    }

    pub fn with_estimator(mut self, estimator: TokenEstimator) -> Self {
        self.compactor = self.compactor.with_estimator(estimator.clone());
        self.estimator = estimator;
        self
    }

    /// The store offloaded results live in, for callers that want to
    /// follow references themselves.
    pub fn store(&self) -> &OffloadStore {
        &self.store
    }

    pub fn config(&self) -> &ContextBudgetConfig {
        &self.config
    }

    /// Run one remediation turn over `history`.
    ///
    /// Below the offload threshold this returns the history unchanged.
    /// Otherwise large tool results are offloaded first; if that left the
    /// history over threshold, freed less than the trigger amount, and
    /// the cooldown has elapsed, compaction is attempted. The attempt
    /// counts against the cooldown whether or not it succeeds.
    pub async fn remediate(&mut self, history: Vec<Message>) -> RemediationOutcome {
        self.turn += 1;
        let tokens = self.estimator.count(&history);
        if tokens < self.config.offload_threshold {
            debug!(
                tokens,
                threshold = self.config.offload_threshold,
                "history within budget"
            );
            return RemediationOutcome {
                messages: history,
                offloaded: None,
                compacted: None,
            };
        }

        let mut messages = history;
        let offloaded_count = self.offload_pass(&mut messages).await;
        let tokens_after = self.estimator.count(&messages);
        let freed_tokens = tokens.saturating_sub(tokens_after);

        let offloaded = (offloaded_count > 0).then(|| {
            info!(offloaded = offloaded_count, freed_tokens, "offloaded large tool results");
            dispatch(
                &*self.events,
                &EngineEvent::Offloaded {
                    count: offloaded_count,
                    freed_tokens,
                },
            );
            OffloadSummary {
                offloaded: offloaded_count,
                freed_tokens,
            }
        });

        let mut compacted = None;
        if tokens_after >= self.config.offload_threshold
            && freed_tokens < self.config.compact_trigger_threshold
            && self.cooldown_elapsed()
        {
            self.last_compaction_turn = Some(self.turn);
            let result = self.compactor.compact(&self.store, &messages).await;
            if result.success {
                messages = result.messages.clone();
            }
            compacted = Some(result);
        }

        RemediationOutcome {
            messages,
            offloaded,
            compacted,
        }
    }

    /// Replace qualifying tool results with store references. Scans the
    /// oldest `scan_ratio` fraction of tool messages; a result that fails
    /// to write stays in the history untouched.
    async fn offload_pass(&self, messages: &mut [Message]) -> usize {
        let tool_indices: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, message)| message.role == MessageRole::Tool)
            .map(|(index, _)| index)
            .collect();
        let scan_limit = (tool_indices.len() as f64 * self.config.scan_ratio).ceil() as usize;

        let mut offloaded = 0;
        for index in tool_indices.into_iter().take(scan_limit) {
            let text = messages[index].text_content();
            if text.chars().count() < self.config.min_offload_chars
                || text.starts_with(OFFLOAD_REFERENCE_PREFIX)
            {
                continue;
            }
            match self.store.offload(&text).await {
                Ok(path) => {
                    messages[index].content = vec![ContentPart::text(offload_reference(&path))];
                    offloaded += 1;
                }
                Err(error) => {
                    warn!(error = %error, "failed to offload tool result; leaving in place");
                }
            }
        }
        offloaded
    }

    fn cooldown_elapsed(&self) -> bool {
        match self.last_compaction_turn {
            Some(last) => self.turn - last >= self.config.compact_cooldown_steps,
            None => true,
        }
    }
}
