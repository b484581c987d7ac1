use async_trait::async_trait;
use qdrant_client::qdrant::point_id::PointIdOptions;
use qdrant_client::qdrant::{
    CountPointsBuilder, CreateCollectionBuilder, Distance, PointId, PointStruct,
    SearchPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use serde_json::json;
use tracing::{debug, info};

use crate::catalog::error::CatalogError;
use crate::catalog::index::{VectorIndex, VectorMatch, VectorRecord};

/// Qdrant-backed product index. Point id is the product id.
pub struct QdrantIndex {
    client: Qdrant,
    collection: String,
    dimensions: usize,
}

impl QdrantIndex {
    /// Connect to a Qdrant instance and ensure the collection exists.
    pub async fn new(url: &str, collection: &str, dimensions: usize) -> Result<Self, CatalogError> {
        let client = Qdrant::from_url(url)
            .build()
            .map_err(|e| CatalogError::Index(format!("failed to connect to qdrant: {e}")))?;

        let index = Self {
            client,
            collection: collection.to_string(),
            dimensions,
        };

        index.ensure_collection().await?;
        Ok(index)
    }

    async fn ensure_collection(&self) -> Result<(), CatalogError> {
        let exists = self
            .client
            .collection_exists(&self.collection)
            .await
            .map_err(|e| CatalogError::Index(format!("failed to check collection: {e}")))?;

        if !exists {
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection).vectors_config(
                        VectorParamsBuilder::new(self.dimensions as u64, Distance::Cosine),
                    ),
                )
                .await
                .map_err(|e| CatalogError::Index(format!("failed to create collection: {e}")))?;
            info!(collection = %self.collection, "created qdrant collection");
        }

        Ok(())
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<(), CatalogError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut points = Vec::with_capacity(records.len());
        for record in records {
            let id = u64::try_from(record.product_id).map_err(|_| {
                CatalogError::Index(format!("product id {} cannot be a point id", record.product_id))
            })?;
            let payload: Payload = json!({ "product_id": record.product_id })
                .try_into()
                .map_err(|e| CatalogError::Index(format!("payload: {e}")))?;
            points.push(PointStruct::new(id, record.vector, payload));
        }

        let n = points.len();
        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, points).wait(true))
            .await
            .map_err(|e| CatalogError::Index(format!("upsert failed: {e}")))?;

        debug!(points = n, collection = %self.collection, "upserted product vectors");
        Ok(())
    }

    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<VectorMatch>, CatalogError> {
        let results = self
            .client
            .search_points(SearchPointsBuilder::new(
                &self.collection,
                vector.to_vec(),
                k as u64,
            ))
            .await
            .map_err(|e| CatalogError::Index(format!("search failed: {e}")))?;

        Ok(results
            .result
            .into_iter()
            .filter_map(|point| {
                Some(VectorMatch {
                    product_id: point_id_to_product(point.id.as_ref())?,
                    score: point.score,
                })
            })
            .collect())
    }

    async fn count(&self) -> Result<usize, CatalogError> {
        let result = self
            .client
            .count(CountPointsBuilder::new(&self.collection).exact(true))
            .await
            .map_err(|e| CatalogError::Index(format!("count failed: {e}")))?;

        Ok(result.result.map(|r| r.count as usize).unwrap_or(0))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

fn point_id_to_product(id: Option<&PointId>) -> Option<i64> {
    match id?.point_id_options.as_ref()? {
        PointIdOptions::Num(n) => i64::try_from(*n).ok(),
        PointIdOptions::Uuid(_) => None,
    }
}
