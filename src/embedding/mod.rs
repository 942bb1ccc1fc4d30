pub mod cache;
pub mod openai;
pub mod resilient;

pub use cache::EmbeddingCache;
pub use resilient::ResilientEmbedder;

use async_trait::async_trait;

/// Abstract embedding model interface.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Embed a batch of texts. Returns one vector per input, in order.
    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;

    /// Embed a single text.
    async fn embed_text(&self, text: &str) -> anyhow::Result<Vec<f32>>;

    /// Embedding dimension for this model.
    fn dimensions(&self) -> usize;

    /// Model identifier, used in cache keys.
    fn model_name(&self) -> &str;
}
