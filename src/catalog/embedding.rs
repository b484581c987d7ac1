use async_trait::async_trait;

use super::error::CatalogError;

/// Turns text into a fixed-length vector. Queries and catalog entries must
/// go through the same provider.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CatalogError>;

    /// Embed a batch of texts. Default implementation calls `embed` in sequence.
    /// Override for providers that support native batching.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CatalogError> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    fn dimensions(&self) -> usize;
}
