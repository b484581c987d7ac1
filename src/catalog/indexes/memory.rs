use std::cmp::Ordering;
use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::catalog::error::CatalogError;
use crate::catalog::index::{VectorIndex, VectorMatch, VectorRecord};

/// Exhaustive cosine-similarity index held in process memory.
pub struct InMemoryIndex {
    dimensions: usize,
    vectors: RwLock<BTreeMap<i64, Vec<f32>>>,
}

impl InMemoryIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            vectors: RwLock::new(BTreeMap::new()),
        }
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<(), CatalogError> {
        if vector.len() != self.dimensions {
            return Err(CatalogError::Index(format!(
                "vector has {} dimensions, index expects {}",
                vector.len(),
                self.dimensions
            )));
        }
        Ok(())
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<(), CatalogError> {
        for record in &records {
            self.check_dimensions(&record.vector)?;
        }
        let mut vectors = self.vectors.write().await;
        for record in records {
            vectors.insert(record.product_id, record.vector);
        }
        Ok(())
    }

    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<VectorMatch>, CatalogError> {
        self.check_dimensions(vector)?;
        let vectors = self.vectors.read().await;

        let mut matches: Vec<VectorMatch> = vectors
            .iter()
            .map(|(id, v)| VectorMatch {
                product_id: *id,
                score: cosine_similarity(vector, v),
            })
            .collect();

        // Stable sort keeps ascending id order among equal scores.
        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        matches.truncate(k);
        Ok(matches)
    }

    async fn count(&self) -> Result<usize, CatalogError> {
        Ok(self.vectors.read().await.len())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(product_id: i64, vector: [f32; 3]) -> VectorRecord {
        VectorRecord {
            product_id,
            vector: vector.to_vec(),
        }
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn search_returns_best_first() {
        let index = InMemoryIndex::new(3);
        index
            .upsert(vec![
                record(1, [0.0, 1.0, 0.0]),
                record(2, [1.0, 0.0, 0.0]),
                record(3, [0.7, 0.7, 0.0]),
            ])
            .await
            .unwrap();

        let hits = index.search(&[1.0, 0.1, 0.0], 2).await.unwrap();
        let ids: Vec<i64> = hits.iter().map(|m| m.product_id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn upsert_replaces_by_id() {
        let index = InMemoryIndex::new(3);
        index.upsert(vec![record(1, [1.0, 0.0, 0.0])]).await.unwrap();
        index.upsert(vec![record(1, [0.0, 0.0, 1.0])]).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 1);

        let hits = index.search(&[0.0, 0.0, 1.0], 1).await.unwrap();
        assert!(hits[0].score > 0.99);
    }

    #[tokio::test]
    async fn wrong_dimensions_rejected() {
        let index = InMemoryIndex::new(3);
        let err = index
            .upsert(vec![VectorRecord {
                product_id: 1,
                vector: vec![1.0],
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Index(_)));
        assert!(index.search(&[1.0, 0.0], 5).await.is_err());
    }
}
