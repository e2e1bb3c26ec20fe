//! Provider client seam.
//!
//! The engine never speaks a wire protocol. It consumes a [`ModelClient`]
//! that turns (system prompt, history, tool definitions) into a stream of
//! [`StreamFragment`]s plus an in-stream usage report. Provider adapters
//! (HTTP transport, SSE parsing, auth, request shaping) live outside this
//! crate and implement the trait.
//!
//! `ModelClient` is dyn-compatible: generation returns a boxed future, and
//! the derivation methods ([`with_model`](ModelClient::with_model),
//! [`with_generation_options`](ModelClient::with_generation_options)) take
//! `Arc<Self>` so a shared client can hand out cheap variants of itself.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::stream::StreamFragment;
use crate::{Message, ToolDefinition};

/// Boxed fragment stream produced by [`ModelClient::generate`].
pub type FragmentStream = Pin<Box<dyn Stream<Item = StreamFragment> + Send>>;

/// Boxed future returned by [`ModelClient::generate`].
///
/// Type alias to keep trait signatures and implementations readable.
pub type GenerateFuture<'a> =
    Pin<Box<dyn Future<Output = Result<FragmentStream, String>> + Send + 'a>>;

/// Per-request generation parameters.
///
/// Unset fields mean "use the client's defaults". The compactor uses this
/// to cap summary output without touching the shared client.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GenerationOptions {
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl GenerationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = Some(max);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// An LLM provider client the engine can drive.
///
/// Implementations clone whatever they need out of the borrowed arguments
/// before returning the future; the boxed future borrows only `self`.
pub trait ModelClient: Send + Sync {
    /// Identifier of the model this client currently targets.
    fn model_id(&self) -> &str;

    /// Whether [`with_model`](Self::with_model) can actually switch models.
    /// Clients pinned to one deployment return `false` (the default).
    fn supports_model_switching(&self) -> bool {
        false
    }

    /// A client targeting a different model. Clients that don't support
    /// switching return an equivalent of `self` unchanged.
    fn with_model(self: Arc<Self>, model: &str) -> Arc<dyn ModelClient>;

    /// A client with per-request generation parameters applied.
    fn with_generation_options(self: Arc<Self>, options: GenerationOptions) -> Arc<dyn ModelClient>;

    /// Start one generation. The returned stream yields fragments until the
    /// response is complete; dropping the stream abandons the request. The
    /// token cancels request setup and streaming from the provider side.
    fn generate(
        &self,
        system_prompt: &str,
        history: &[Message],
        tools: &[ToolDefinition],
        cancel: &CancellationToken,
    ) -> GenerateFuture<'_>;
}
