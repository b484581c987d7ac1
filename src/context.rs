use std::sync::Arc;

use tracing::{debug, info};

use crate::error::SummaryError;
use crate::summarizer::Summarizer;
use crate::tokens::TokenCounter;
use crate::types::{Role, Turn};

/// Prefix of the synthesized system turn that replaces compressed history.
pub const SUMMARY_PREFIX: &str = "Summary of earlier conversation: ";

/// Tokens allowed for conversation history. System prompt, tool schemas and
/// the model's output have their own reserve outside this budget.
pub const DEFAULT_HISTORY_BUDGET: usize = 4_000;

/// Most recent turns always sent verbatim, even when they alone exceed the budget.
pub const DEFAULT_RECENT_TURNS: usize = 6;

/// The turns assembled for one request. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextWindow {
    pub turns: Vec<Turn>,
    /// Token count of the full history before any compression.
    pub total_tokens: usize,
    /// How many older turns were folded into the summary (0 when verbatim).
    pub summarized_turns: usize,
}

impl ContextWindow {
    pub fn is_summarized(&self) -> bool {
        self.summarized_turns > 0
    }
}

/// Decides, per request, whether history goes out verbatim or as
/// `[summary] + last R turns`.
///
/// Nothing is cached between calls: each request re-derives the window and
/// may re-summarize a growing prefix.
pub struct ContextBuilder {
    counter: Arc<dyn TokenCounter>,
    summarizer: Arc<dyn Summarizer>,
    history_budget: usize,
    recent_turns: usize,
}

impl ContextBuilder {
    pub fn new(counter: Arc<dyn TokenCounter>, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            counter,
            summarizer,
            history_budget: DEFAULT_HISTORY_BUDGET,
            recent_turns: DEFAULT_RECENT_TURNS,
        }
    }

    pub fn with_history_budget(mut self, tokens: usize) -> Self {
        self.history_budget = tokens;
        self
    }

    pub fn with_recent_turns(mut self, n: usize) -> Self {
        self.recent_turns = n;
        self
    }

    pub fn history_budget(&self) -> usize {
        self.history_budget
    }

    pub fn recent_turns(&self) -> usize {
        self.recent_turns
    }

    /// Build the window for the current request.
    ///
    /// `incoming` is appended as a user turn unless `history` already ends
    /// with that exact user turn (the caller persisted it first).
    pub async fn build(
        &self,
        mut history: Vec<Turn>,
        incoming: Option<&str>,
    ) -> Result<ContextWindow, SummaryError> {
        if let Some(message) = incoming {
            let already_logged = history
                .last()
                .is_some_and(|t| t.role == Role::User && t.content == message);
            if !already_logged {
                history.push(Turn::user(message));
            }
        }

        if history.is_empty() {
            return Ok(ContextWindow {
                turns: history,
                total_tokens: 0,
                summarized_turns: 0,
            });
        }

        let total_tokens = self.counter.count_turns(&history);

        if total_tokens <= self.history_budget {
            debug!(
                turns = history.len(),
                tokens = total_tokens,
                budget = self.history_budget,
                "history within budget, sending verbatim"
            );
            return Ok(ContextWindow {
                turns: history,
                total_tokens,
                summarized_turns: 0,
            });
        }

        let split = history.len().saturating_sub(self.recent_turns);
        let recent = history.split_off(split);
        let older = history;

        if older.is_empty() {
            debug!(
                turns = recent.len(),
                tokens = total_tokens,
                "over budget but nothing older than the recent window"
            );
            return Ok(ContextWindow {
                turns: recent,
                total_tokens,
                summarized_turns: 0,
            });
        }

        let digest = self.summarizer.summarize(&older).await?;

        info!(
            summarized = older.len(),
            kept = recent.len(),
            tokens = total_tokens,
            budget = self.history_budget,
            "compressed older history into summary"
        );

        let mut turns = Vec::with_capacity(recent.len() + 1);
        turns.push(Turn::system(format!("{SUMMARY_PREFIX}{digest}")));
        turns.extend(recent);

        Ok(ContextWindow {
            turns,
            total_tokens,
            summarized_turns: older.len(),
        })
    }
}
