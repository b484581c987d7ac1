//! Process settings read from the environment (and `.env`, when present).

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::catalog::embedders::openai::{DEFAULT_EMBEDDING_DIMENSIONS, DEFAULT_EMBEDDING_MODEL};
use crate::context::{DEFAULT_HISTORY_BUDGET, DEFAULT_RECENT_TURNS};
use crate::error::AgentError;
use crate::AgentConfig;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_QDRANT_COLLECTION: &str = "products";

#[derive(Debug, Clone)]
pub struct Settings {
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub database_path: PathBuf,
    pub model: String,
    pub summary_model: String,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub history_budget: usize,
    pub recent_turns: usize,
    pub max_tool_rounds: usize,
    pub max_message_chars: usize,
    pub tool_timeout: Duration,
    pub qdrant_url: Option<String>,
    pub qdrant_collection: String,
}

impl Settings {
    /// Load `.env` if there is one, then read the process environment.
    pub fn from_env() -> Result<Self, AgentError> {
        // A missing .env is normal; real env vars still apply.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key -> value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AgentError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = AgentConfig::default();

        let openai_api_key =
            get("OPENAI_API_KEY").ok_or_else(|| AgentError::Config("OPENAI_API_KEY is not set".into()))?;
        let model = get("SHOP_MODEL").unwrap_or(defaults.model);
        let summary_model = get("SHOP_SUMMARY_MODEL").unwrap_or_else(|| model.clone());

        Ok(Self {
            openai_api_key,
            openai_base_url: get("OPENAI_BASE_URL").unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.into()),
            database_path: get("SHOP_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("shop.db")),
            model,
            summary_model,
            embedding_model: get("SHOP_EMBEDDING_MODEL")
                .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.into()),
            embedding_dimensions: parse_or(&get, "SHOP_EMBEDDING_DIMENSIONS", DEFAULT_EMBEDDING_DIMENSIONS)?,
            history_budget: parse_or(&get, "SHOP_HISTORY_BUDGET", DEFAULT_HISTORY_BUDGET)?,
            recent_turns: parse_or(&get, "SHOP_RECENT_TURNS", DEFAULT_RECENT_TURNS)?,
            max_tool_rounds: parse_or(&get, "SHOP_MAX_TOOL_ROUNDS", defaults.max_tool_rounds)?,
            max_message_chars: parse_or(&get, "SHOP_MAX_MESSAGE_CHARS", defaults.max_message_chars)?,
            tool_timeout: Duration::from_secs(parse_or(
                &get,
                "SHOP_TOOL_TIMEOUT_SECS",
                defaults.tool_timeout.as_secs(),
            )?),
            qdrant_url: get("QDRANT_URL"),
            qdrant_collection: get("QDRANT_COLLECTION")
                .unwrap_or_else(|| DEFAULT_QDRANT_COLLECTION.into()),
        })
    }

    /// Dispatch-loop configuration derived from these settings.
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            model: self.model.clone(),
            max_tool_rounds: self.max_tool_rounds,
            max_message_chars: self.max_message_chars,
            tool_timeout: self.tool_timeout,
            ..AgentConfig::default()
        }
    }
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, AgentError> {
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AgentError::Config(format!("{key} must be a number, got {raw:?}"))),
    }
}
