pub mod openai;
pub mod sse;

use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;

use crate::error::InferenceError;
use crate::types::{InferenceRequest, InferenceResponse, StreamChunk};

/// Chunks of one model response, in arrival order.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, InferenceError>> + Send>>;

/// Pure LLM API call. No state, no history, no context management.
/// Request in, response out.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse, InferenceError>;

    /// Incremental variant. The default replays `infer` as chunks.
    async fn infer_stream(&self, request: InferenceRequest) -> Result<ChunkStream, InferenceError> {
        let response = self.infer(request).await?;
        let chunks = response.into_chunks().into_iter().map(Ok);
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }
}

pub use openai::OpenAiProvider;
