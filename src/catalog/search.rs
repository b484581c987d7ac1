use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::embedding::EmbeddingProvider;
use super::error::CatalogError;
use super::index::{VectorIndex, VectorRecord};
use crate::store::{Product, ProductFilter, ShopStore};

pub const DEFAULT_TOP_K: usize = 10;

/// A natural-language product query plus the hard constraints that
/// embeddings can't express.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub query: String,
    pub max_price_cents: Option<i64>,
    pub category: Option<String>,
    pub in_stock_only: bool,
    pub top_k: usize,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            max_price_cents: None,
            category: None,
            in_stock_only: true,
            top_k: DEFAULT_TOP_K,
        }
    }

    pub fn max_price_cents(mut self, cents: i64) -> Self {
        self.max_price_cents = Some(cents);
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn include_out_of_stock(mut self) -> Self {
        self.in_stock_only = false;
        self
    }

    pub fn top_k(mut self, k: usize) -> Self {
        self.top_k = k;
        self
    }
}

/// Text embedded for a product. Price and stock stay out: they are
/// numeric constraints and belong to the relational filter.
pub fn product_text(product: &Product) -> String {
    format!(
        "{}. {}. Category: {}. Brand: {}.",
        product.name, product.description, product.category, product.brand
    )
}

/// Semantic retrieval followed by relational filtering.
pub struct ProductSearch {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
}

impl ProductSearch {
    /// Fails when the embedder and the index disagree on vector width.
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
    ) -> Result<Self, CatalogError> {
        if embedder.dimensions() != index.dimensions() {
            return Err(CatalogError::Index(format!(
                "embedder produces {}-dimensional vectors but the index expects {}",
                embedder.dimensions(),
                index.dimensions()
            )));
        }
        Ok(Self { embedder, index })
    }

    /// Embed the query, over-fetch `2 * top_k` neighbours, drop the ones
    /// failing the hard filters and return the rest in similarity order.
    pub async fn search(
        &self,
        store: &dyn ShopStore,
        query: &SearchQuery,
    ) -> Result<Vec<Product>, CatalogError> {
        if query.top_k == 0 {
            return Ok(Vec::new());
        }

        let vector = self.embedder.embed(&query.query).await?;
        let matches = self.index.search(&vector, query.top_k * 2).await?;
        if matches.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = matches.iter().map(|m| m.product_id).collect();
        let filter = ProductFilter {
            max_price_cents: query.max_price_cents,
            category: query.category.clone(),
            in_stock_only: query.in_stock_only,
        };

        let mut by_id: HashMap<i64, Product> = store
            .products_by_ids(&ids, &filter)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        let products: Vec<Product> = ids
            .iter()
            .filter_map(|id| by_id.remove(id))
            .take(query.top_k)
            .collect();

        debug!(
            query = %query.query,
            candidates = ids.len(),
            returned = products.len(),
            "product search"
        );
        Ok(products)
    }

    /// Embed and index the given products in one batch. Returns how many
    /// were indexed.
    pub async fn index_products(&self, products: &[Product]) -> Result<usize, CatalogError> {
        if products.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = products.iter().map(product_text).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;
        if vectors.len() != products.len() {
            return Err(CatalogError::Embedding(format!(
                "expected {} embeddings, got {}",
                products.len(),
                vectors.len()
            )));
        }

        let records = products
            .iter()
            .zip(vectors)
            .map(|(p, vector)| VectorRecord {
                product_id: p.id,
                vector,
            })
            .collect();
        self.index.upsert(records).await?;
        Ok(products.len())
    }
}
