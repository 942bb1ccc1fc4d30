use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::embedding::ResilientEmbedder;
use crate::models::SearchHit;
use crate::text::{cosine_similarity, estimate_tokens, jaccard_similarity, split_sentences};

/// Sentences scoring below this against the query are dropped.
const SENTENCE_RELEVANCE_THRESHOLD: f64 = 0.35;

/// Excerpts at or above this Jaccard similarity to an earlier excerpt are
/// removed as redundant.
const REDUNDANCY_CUTOFF: f64 = 0.9;

/// One hit's compressed excerpt.
#[derive(Debug, Clone, Serialize)]
pub struct CompressedHit {
    pub chunk_id: String,
    pub doc_id: String,
    pub excerpt: String,
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    pub score: f64,
}

/// Result of compressing a hit list into a token budget.
#[derive(Debug, Clone, Serialize)]
pub struct CompressionResult {
    pub excerpts: Vec<CompressedHit>,
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    /// True when the embedding service was unavailable and compression fell
    /// back to plain truncation.
    pub degraded: bool,
}

/// Extractive context compression: keep the sentences of each hit that are
/// semantically close to the query, in original order, under a token budget.
pub struct ContextCompressor {
    embedder: Arc<ResilientEmbedder>,
}

impl ContextCompressor {
    pub fn new(embedder: Arc<ResilientEmbedder>) -> Self {
        Self { embedder }
    }

    /// Compress `hits` to fit `max_tokens`. Hits are consumed greedily in
    /// descending final-score order; each hit's excerpt is capped at
    /// `max_tokens / hits.len()` tokens. May exceed the budget by at most
    /// one sentence.
    pub async fn compress(
        &self,
        query: &str,
        hits: &[SearchHit],
        max_tokens: usize,
    ) -> CompressionResult {
        if hits.is_empty() || max_tokens == 0 {
            return CompressionResult {
                excerpts: vec![],
                original_tokens: 0,
                compressed_tokens: 0,
                degraded: false,
            };
        }

        let mut ordered: Vec<&SearchHit> = hits.iter().collect();
        ordered.sort_by(|a, b| {
            b.final_score()
                .partial_cmp(&a.final_score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let per_hit_cap = (max_tokens / ordered.len()).max(1);

        let query_embedding = match self.embedder.embed_query(query).await {
            Ok(embedding) => embedding,
            Err(err) => {
                warn!("compression degraded to truncation: {err}");
                return self.truncate(&ordered, max_tokens, per_hit_cap);
            }
        };

        let mut excerpts = Vec::new();
        let mut original_tokens = 0;
        let mut compressed_tokens = 0;

        for hit in ordered {
            let hit_original = estimate_tokens(&hit.content);
            original_tokens += hit_original;

            let excerpt = match self
                .extract_sentences(&query_embedding, &hit.content, per_hit_cap)
                .await
            {
                Ok(excerpt) => excerpt,
                Err(err) => {
                    warn!("compression degraded to truncation mid-request: {err}");
                    truncate_to_tokens(&hit.content, per_hit_cap)
                }
            };
            if excerpt.is_empty() {
                continue;
            }

            let excerpt_tokens = estimate_tokens(&excerpt);
            // Budget check before committing this hit.
            if compressed_tokens + excerpt_tokens > max_tokens && !excerpts.is_empty() {
                break;
            }
            compressed_tokens += excerpt_tokens;
            excerpts.push(CompressedHit {
                chunk_id: hit.chunk_id.clone(),
                doc_id: hit.doc_id.clone(),
                excerpt,
                original_tokens: hit_original,
                compressed_tokens: excerpt_tokens,
                score: hit.final_score(),
            });
        }

        let excerpts = remove_redundant(excerpts, &mut compressed_tokens);

        CompressionResult {
            excerpts,
            original_tokens,
            compressed_tokens,
            degraded: false,
        }
    }

    /// Keep query-relevant sentences in original order up to the token cap.
    async fn extract_sentences(
        &self,
        query_embedding: &[f32],
        content: &str,
        token_cap: usize,
    ) -> crate::error::CoreResult<String> {
        let sentences = split_sentences(content);
        if sentences.is_empty() {
            return Ok(String::new());
        }

        let embeddings = self.embedder.embed_batch(&sentences).await?;

        let mut kept = Vec::new();
        let mut used_tokens = 0;
        for (sentence, embedding) in sentences.iter().zip(&embeddings) {
            if cosine_similarity(query_embedding, embedding) <= SENTENCE_RELEVANCE_THRESHOLD {
                continue;
            }
            let tokens = estimate_tokens(sentence);
            if used_tokens + tokens > token_cap && !kept.is_empty() {
                break;
            }
            used_tokens += tokens;
            kept.push(sentence.clone());
        }
        Ok(kept.join(" "))
    }

    /// Truncation fallback when embeddings are unavailable.
    fn truncate(
        &self,
        ordered: &[&SearchHit],
        max_tokens: usize,
        per_hit_cap: usize,
    ) -> CompressionResult {
        let mut excerpts = Vec::new();
        let mut original_tokens = 0;
        let mut compressed_tokens = 0;

        for hit in ordered {
            let hit_original = estimate_tokens(&hit.content);
            original_tokens += hit_original;

            let excerpt = truncate_to_tokens(&hit.content, per_hit_cap);
            if excerpt.is_empty() {
                continue;
            }
            let excerpt_tokens = estimate_tokens(&excerpt);
            if compressed_tokens + excerpt_tokens > max_tokens && !excerpts.is_empty() {
                break;
            }
            compressed_tokens += excerpt_tokens;
            excerpts.push(CompressedHit {
                chunk_id: hit.chunk_id.clone(),
                doc_id: hit.doc_id.clone(),
                excerpt,
                original_tokens: hit_original,
                compressed_tokens: excerpt_tokens,
                score: hit.final_score(),
            });
        }

        CompressionResult {
            excerpts,
            original_tokens,
            compressed_tokens,
            degraded: true,
        }
    }
}

/// Cut text to approximately `token_cap` tokens on a character boundary.
fn truncate_to_tokens(text: &str, token_cap: usize) -> String {
    if estimate_tokens(text) <= token_cap {
        return text.to_string();
    }
    let mut out = String::new();
    for c in text.chars() {
        out.push(c);
        if estimate_tokens(&out) >= token_cap {
            break;
        }
    }
    out
}

/// Drop excerpts nearly identical to an earlier (higher-scored) one.
fn remove_redundant(
    excerpts: Vec<CompressedHit>,
    compressed_tokens: &mut usize,
) -> Vec<CompressedHit> {
    let mut kept: Vec<CompressedHit> = Vec::with_capacity(excerpts.len());
    for excerpt in excerpts {
        let duplicate = kept
            .iter()
            .any(|k| jaccard_similarity(&k.excerpt, &excerpt.excerpt) >= REDUNDANCY_CUTOFF);
        if duplicate {
            *compressed_tokens = compressed_tokens.saturating_sub(excerpt.compressed_tokens);
        } else {
            kept.push(excerpt);
        }
    }
    kept
}
