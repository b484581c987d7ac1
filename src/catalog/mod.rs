pub mod embedders;
pub mod embedding;
pub mod error;
pub mod index;
pub mod indexes;
pub mod search;

pub use embedders::openai::OpenAiEmbedder;
pub use embedding::EmbeddingProvider;
pub use error::CatalogError;
pub use index::{VectorIndex, VectorMatch, VectorRecord};
pub use indexes::memory::InMemoryIndex;
#[cfg(feature = "qdrant")]
pub use indexes::qdrant::QdrantIndex;
pub use search::{product_text, ProductSearch, SearchQuery};
