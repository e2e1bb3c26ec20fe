//! Token estimation from serialized history size.
//!
//! No tokenizer dependency: estimates divide the character count of the
//! JSON-serialized history by a chars-per-token ratio. The estimate is
//! deliberately recomputed from a full re-serialization every time rather
//! than tracked incrementally, so edits anywhere in the history (offload
//! replacements, compaction) are always reflected.

use crate::Message;

/// Default characters per token (conservative estimate for English text).
/// Most tokenizers average 3-4 chars per token; we use 3.5 as a middle ground.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Estimates token counts from character counts.
///
/// # Example
///
/// ```ignore
/// let estimator = TokenEstimator::new();
/// let tokens = estimator.count(&history);
/// if tokens > budget {
///     // remediate
/// }
/// ```
#[derive(Debug, Clone)]
pub struct TokenEstimator {
    chars_per_token: f64,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenEstimator {
    pub fn new() -> Self {
        Self {
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }

    /// Override the chars-per-token ratio, e.g. from calibration against
    /// real usage data reported by a provider.
    pub fn with_chars_per_token(mut self, chars_per_token: f64) -> Self {
        self.chars_per_token = chars_per_token;
        self
    }

    /// Estimated tokens for an entire history, measured over its full
    /// JSON serialization so structural overhead (roles, tool call ids,
    /// argument payloads) is counted too.
    pub fn count(&self, history: &[Message]) -> u64 {
        let serialized = serde_json::to_string(history).unwrap_or_default();
        self.count_text(&serialized)
    }

    /// Estimated tokens for a plain text fragment.
    pub fn count_text(&self, text: &str) -> u64 {
        (text.chars().count() as f64 / self.chars_per_token).ceil() as u64
    }
}
