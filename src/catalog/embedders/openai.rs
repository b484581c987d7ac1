use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::embedding::EmbeddingProvider;
use crate::catalog::error::CatalogError;

pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 1536;

/// OpenAI-compatible `/v1/embeddings` client. One request per batch.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
}

impl OpenAiEmbedder {
    pub fn new(base_url: &str, model: &str, dimensions: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: None,
            model: model.to_string(),
            dimensions,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn request<'a>(&'a self, texts: &'a [String]) -> EmbedRequest<'a> {
        EmbedRequest {
            model: &self.model,
            input: texts,
            dimensions: self
                .model
                .starts_with("text-embedding-3")
                .then_some(self.dimensions),
        }
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
    /// Only the text-embedding-3 family accepts a requested width.
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedDatum>,
}

#[derive(Deserialize)]
struct EmbedDatum {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CatalogError> {
        let mut results = self.embed_batch(&[text.to_string()]).await?;
        results
            .pop()
            .ok_or_else(|| CatalogError::Embedding("empty response from embeddings API".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CatalogError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut req = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .json(&self.request(texts));
        if let Some(ref key) = self.api_key {
            req = req.header("authorization", format!("Bearer {key}"));
        }

        let response = req
            .send()
            .await
            .map_err(|e| CatalogError::Embedding(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CatalogError::Embedding(format!(
                "embeddings API returned {status}: {body}"
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| CatalogError::Embedding(format!("failed to parse response: {e}")))?;

        let vectors = order_by_index(parsed.data, texts.len())?;
        debug!(count = vectors.len(), model = %self.model, "embedded batch");
        Ok(vectors)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// The API tags each vector with its input position; don't rely on array order.
fn order_by_index(mut data: Vec<EmbedDatum>, expected: usize) -> Result<Vec<Vec<f32>>, CatalogError> {
    if data.len() != expected {
        return Err(CatalogError::Embedding(format!(
            "expected {expected} embeddings, got {}",
            data.len()
        )));
    }
    data.sort_by_key(|d| d.index);
    Ok(data.into_iter().map(|d| d.embedding).collect())
}
