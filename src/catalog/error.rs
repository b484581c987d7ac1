use crate::error::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("embedding error: {0}")]
    Embedding(String),
    #[error("vector index error: {0}")]
    Index(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
