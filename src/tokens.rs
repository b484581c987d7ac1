use std::sync::Arc;

use tiktoken_rs::CoreBPE;

use crate::error::AgentError;
use crate::types::Turn;

/// Maps text to a token count. Pure and deterministic.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;

    /// Sum of `count` over the text of each turn.
    fn count_turns(&self, turns: &[Turn]) -> usize {
        turns.iter().map(|t| self.count(&t.content)).sum()
    }
}

/// BPE counter using the target model's vocabulary, so counts line up with
/// what the provider bills and enforces.
#[derive(Clone)]
pub struct TiktokenCounter {
    bpe: Arc<CoreBPE>,
}

impl TiktokenCounter {
    /// Resolve the vocabulary for a model name (`gpt-4o` -> `o200k_base`, ...).
    pub fn for_model(model: &str) -> Result<Self, AgentError> {
        let bpe = tiktoken_rs::get_bpe_from_model(model)
            .map_err(|e| AgentError::Config(format!("no tokenizer for {model}: {e}")))?;
        Ok(Self { bpe: Arc::new(bpe) })
    }

    /// The `gpt-4o` family vocabulary.
    pub fn o200k() -> Result<Self, AgentError> {
        let bpe = tiktoken_rs::o200k_base()
            .map_err(|e| AgentError::Config(format!("o200k_base init failed: {e}")))?;
        Ok(Self { bpe: Arc::new(bpe) })
    }
}

impl TokenCounter for TiktokenCounter {
    fn count(&self, text: &str) -> usize {
        // Special-token markers in user text are billed as plain text.
        self.bpe.encode_ordinary(text).len()
    }
}

/// chars/4 heuristic. Good enough for offline use and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharEstimateCounter;

impl TokenCounter for CharEstimateCounter {
    fn count(&self, text: &str) -> usize {
        text.len() / 4
    }
}
