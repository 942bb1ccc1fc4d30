pub mod api;

use async_trait::async_trait;

/// Abstract cross-encoder reranker. Scores are real numbers, higher is
/// better; they are not guaranteed to lie in [0, 1].
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Score each (query, doc) pair in one batch. Returns one score per doc,
    /// in input order.
    async fn score(&self, query: &str, docs: &[String]) -> anyhow::Result<Vec<f64>>;

    /// Model identifier for logs and status.
    fn model_name(&self) -> &str;
}
