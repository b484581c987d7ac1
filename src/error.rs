use crate::catalog::CatalogError;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("inference error: {0}")]
    Inference(#[from] InferenceError),
    #[error("summary error: {0}")]
    Summary(#[from] SummaryError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("configuration error: {0}")]
    Config(String),
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("API returned {status}: {body}")]
    ApiError { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
    #[error("no response within {0}s")]
    Timeout(u64),
}

/// Compression of older turns failed. Never converted into an empty summary.
#[derive(Debug, thiserror::Error)]
pub enum SummaryError {
    #[error("summarizer call failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("summarizer returned an empty digest")]
    Empty,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Failure at the tool boundary. Rendered into a short string for the model.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),
    #[error("search unavailable: {0}")]
    Catalog(#[from] CatalogError),
    #[error("tool crashed")]
    Panicked,
    #[error("tool timed out after {0}s")]
    Timeout(u64),
}
