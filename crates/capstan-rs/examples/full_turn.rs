//! Full turn walkthrough: assemble a streamed response, execute its tool
//! calls, then remediate the context budget.
//!
//! Runs entirely offline: a scripted client replays a fragment sequence
//! (including a concurrent task batch) and a stub invoker synthesizes
//! bulky tool output so the offload pass has something to do.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example full_turn
//! ```

use std::sync::Arc;

use capstan_rs::prelude::*;
use futures::stream;

// ── Scripted model ──────────────────────────────────────────────────

/// Replays one fixed response: a little text, two task-dispatch calls,
/// and a usage report. Summarization requests get a canned summary.
struct ScriptedModel;

impl ModelClient for ScriptedModel {
    fn model_id(&self) -> &str {
        "scripted/demo-model"
    }

    fn with_model(self: Arc<Self>, _model: &str) -> Arc<dyn ModelClient> {
        self
    }

    fn with_generation_options(self: Arc<Self>, _options: GenerationOptions) -> Arc<dyn ModelClient> {
        self
    }

    fn generate(
        &self,
        system_prompt: &str,
        _history: &[Message],
        _tools: &[ToolDefinition],
        _cancel: &CancellationToken,
    ) -> GenerateFuture<'_> {
        let summarizing = system_prompt.contains("Summarize");
        Box::pin(async move {
            let fragments = if summarizing {
                vec![StreamFragment::TextDelta(
                    "Scanned the repository and measured src/ and docs/.".to_string(),
                )]
            } else {
                vec![
                    StreamFragment::TextDelta("Let me measure the repository".to_string()),
                    StreamFragment::TextDelta(" in two passes.".to_string()),
                    StreamFragment::ToolCallStart {
                        id: "call-1".to_string(),
                        name: "run_command".to_string(),
                    },
                    StreamFragment::ToolCallArgsDelta(r#"{"command":"#.to_string()),
                    StreamFragment::ToolCallArgsDelta(r#""task: measure src"}"#.to_string()),
                    StreamFragment::ToolCallStart {
                        id: "call-2".to_string(),
                        name: "run_command".to_string(),
                    },
                    StreamFragment::ToolCallArgsDelta(
                        r#"{"command":"task: measure docs"}"#.to_string(),
                    ),
                    StreamFragment::Usage(TokenUsage {
                        input_tokens: 120,
                        output_tokens: 46,
                    }),
                ]
            };
            Ok(Box::pin(stream::iter(fragments)) as FragmentStream)
        })
    }
}

// ── Stub tools ──────────────────────────────────────────────────────

/// Synthesizes a bulky file listing for any command it receives.
struct StubTools;

impl ToolInvoker for StubTools {
    fn invoke(&self, call: &ToolCall) -> InvokeFuture<'_> {
        let call = call.clone();
        Box::pin(async move {
            let listing: Vec<String> = (0..200)
                .map(|i| format!("src/module_{i:03}.rs: {} lines", 40 + i))
                .collect();
            Ok(ToolResult::ok(call.id, listing.join("\n")))
        })
    }
}

// ── Main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let client: Arc<dyn ModelClient> = Arc::new(ScriptedModel);
    let cancel = CancellationToken::new();

    let mut history = vec![
        Message::system("You are a repository analyst."),
        Message::user("How big is this repository?"),
    ];

    // 1. Stream the model response and assemble it into one message.
    let fragments = client
        .generate("You are a repository analyst.", &history, &[], &cancel)
        .await?;
    let turn = StreamAssembler::new()
        .on_tool_call(|call| println!("→ requested {} ({})", call.name, call.id))
        .assemble(fragments, &cancel)
        .await
        .map_err(|e| format!("stream assembly failed: {e}"))?;

    println!("assistant: {}", turn.message.text_content());
    if let Some(usage) = turn.usage {
        println!("usage: {} in / {} out", usage.input_tokens, usage.output_tokens);
    }
    history.push(turn.message.clone());

    // 2. Execute the tool calls; the two task dispatches run concurrently.
    let scheduler = ToolScheduler::new(Arc::new(StubTools))
        .with_max_parallel(2)
        .with_events(Arc::new(LoggingHandler));
    let batch = scheduler.schedule(turn.tool_calls.clone(), &cancel);
    let results = batch
        .collect_results()
        .await
        .map_err(|e| format!("tool execution failed: {e}"))?;

    for result in &results {
        println!(
            "← {} settled ({} chars)",
            result.tool_call_id,
            result.return_value.output.chars().count()
        );
        history.push(Message::tool_result(
            result.tool_call_id.clone(),
            result.return_value.output.clone(),
        ));
    }

    // 3. Remediate: with a tiny threshold the bulky results get offloaded.
    let store_dir = tempfile::tempdir().map_err(|e| format!("tempdir failed: {e}"))?;
    let store = OffloadStore::open(store_dir.path()).await?;
    let config = ContextBudgetConfig::new()
        .with_offload_threshold(500)
        .with_min_offload_chars(1_000)
        .with_scan_ratio(1.0);
    let mut manager = ContextBudgetManager::new(client, store, config)
        .with_events(Arc::new(LoggingHandler));

    let outcome = manager.remediate(history).await;
    if let Some(summary) = outcome.offloaded {
        println!(
            "offloaded {} results, freed ~{} tokens",
            summary.offloaded, summary.freed_tokens
        );
    }
    for message in &outcome.messages {
        println!("[{}] {}", message.role, message.text_content().chars().take(80).collect::<String>());
    }

    Ok(())
}
