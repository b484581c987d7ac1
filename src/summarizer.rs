use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::conversation::transcript;
use crate::error::SummaryError;
use crate::inference::InferenceProvider;
use crate::types::{InferenceRequest, Turn};

/// Compresses an ordered run of turns into a short digest.
/// Failures propagate; an empty summary would silently erase memory.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, turns: &[Turn]) -> Result<String, SummaryError>;
}

const SUMMARY_INSTRUCTION: &str = "\
Summarize this shopping conversation in 2-3 sentences. Focus on which products \
were discussed, the user's stated preferences, and anything added to or removed \
from the cart. Keep product names, [ID:X] tags and prices exact.";

/// Summarizer backed by a secondary, cheaper model call.
pub struct LlmSummarizer {
    provider: Arc<dyn InferenceProvider>,
    model: String,
    max_tokens: u32,
}

impl LlmSummarizer {
    pub fn new(provider: Arc<dyn InferenceProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            max_tokens: 300,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, turns: &[Turn]) -> Result<String, SummaryError> {
        let request = InferenceRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            system: Some(SUMMARY_INSTRUCTION.into()),
            tools: vec![],
            messages: vec![Turn::user(transcript(turns))],
        };

        let response = self.provider.infer(request).await?;
        let digest = response.text().trim().to_string();
        if digest.is_empty() {
            return Err(SummaryError::Empty);
        }

        debug!(
            turns = turns.len(),
            output_tokens = response.usage.output_tokens,
            "summarized older turns"
        );
        Ok(digest)
    }
}
