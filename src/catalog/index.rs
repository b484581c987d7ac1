use async_trait::async_trait;

use super::error::CatalogError;

/// A catalog entry's vector, keyed by product id.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub product_id: i64,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub product_id: i64,
    pub score: f32,
}

/// Nearest-neighbour lookup over product vectors. Knows nothing about
/// prices or stock; hard filters happen in the relational store.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace by product id.
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<(), CatalogError>;

    /// Top `k` matches, best first.
    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<VectorMatch>, CatalogError>;

    async fn count(&self) -> Result<usize, CatalogError>;

    /// Vector width every record and query must have.
    fn dimensions(&self) -> usize;
}
