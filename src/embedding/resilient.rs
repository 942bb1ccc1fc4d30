use std::sync::Arc;
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::resilience::{CircuitBreaker, ResiliencePolicy};

use super::{EmbeddingCache, EmbeddingModel};

/// Embedding client wrapped with the resilience policy and the LRU cache.
/// All retrieval and ingestion paths embed through this type.
pub struct ResilientEmbedder {
    inner: Arc<dyn EmbeddingModel>,
    policy: ResiliencePolicy,
    cache: EmbeddingCache,
}

impl ResilientEmbedder {
    pub fn new(inner: Arc<dyn EmbeddingModel>, policy: ResiliencePolicy, cache_max: usize) -> Self {
        Self {
            inner,
            policy,
            cache: EmbeddingCache::new(cache_max),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    pub fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.policy.breaker()
    }

    /// Whether embedding calls would currently be rejected.
    pub fn circuit_open(&self) -> bool {
        self.policy.is_open()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Embed one query text.
    pub async fn embed_query(&self, text: &str) -> CoreResult<Vec<f32>> {
        let mut vectors = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        vectors
            .pop()
            .ok_or_else(|| CoreError::upstream("embedding", "no embedding returned"))
    }

    /// Embed a batch, serving cached entries and fetching the rest in one
    /// resilience-wrapped upstream call.
    pub async fn embed_batch(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let model = self.inner.model_name().to_string();
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut missing_texts = Vec::new();
        let mut missing_indices = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            let key = EmbeddingCache::key(&model, text);
            match self.cache.get(&key) {
                Some(vector) => results[i] = Some(vector),
                None => {
                    missing_texts.push(text.clone());
                    missing_indices.push(i);
                }
            }
        }

        if !missing_texts.is_empty() {
            debug!(
                "embedding batch: {} cached, {} fetched",
                texts.len() - missing_texts.len(),
                missing_texts.len()
            );
            let fetched = self
                .policy
                .call(|| async {
                    self.inner
                        .embed_batch(&missing_texts)
                        .await
                        .map_err(|e| crate::error::classify_backend("embedding", e))
                })
                .await?;

            if fetched.len() != missing_texts.len() {
                return Err(CoreError::upstream(
                    "embedding",
                    format!(
                        "expected {} vectors, got {}",
                        missing_texts.len(),
                        fetched.len()
                    ),
                ));
            }

            let expected = self.inner.dimensions();
            for (idx, vector) in missing_indices.into_iter().zip(fetched) {
                if vector.len() != expected {
                    return Err(CoreError::DimensionMismatch {
                        expected,
                        actual: vector.len(),
                    });
                }
                let key = EmbeddingCache::key(&model, &texts[idx]);
                self.cache.put(key, vector.clone());
                results[idx] = Some(vector);
            }
        }

        Ok(results.into_iter().map(|v| v.expect("all slots filled")).collect())
    }
}
