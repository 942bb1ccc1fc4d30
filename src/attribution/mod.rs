use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::embedding::ResilientEmbedder;
use crate::models::SearchHit;
use crate::text::{cosine_similarity, overlap_ratio, split_sentences};

/// Hits with relevance at or above this threshold count toward the overall
/// confidence.
const CONFIDENCE_THRESHOLD: f64 = 0.4;

/// One supporting source for a generated answer.
#[derive(Debug, Clone, Serialize)]
pub struct SourceReference {
    pub chunk_id: String,
    pub doc_id: String,
    pub kb_id: String,
    pub content: String,
    /// Alignment between the answer and this source, in [0, 1].
    pub relevance: f64,
    /// The source sentence that best overlaps the answer, quoted verbatim.
    pub citation: String,
    pub page: Option<i32>,
    pub section_title: Option<String>,
}

impl SourceReference {
    /// Short human-readable citation label, e.g. `doc-3 — p.4 «Results»`.
    pub fn label(&self) -> String {
        let mut parts = vec![self.doc_id.clone()];
        if let Some(page) = self.page {
            parts.push(format!("p.{page}"));
        }
        if let Some(section) = &self.section_title {
            parts.push(format!("«{section}»"));
        }
        parts.join(" — ")
    }
}

/// Answer-to-source alignment for a set of retrieval hits.
#[derive(Debug, Clone, Serialize)]
pub struct AttributionResult {
    pub sources: Vec<SourceReference>,
    /// Mean relevance of sources above the confidence threshold; 0 when
    /// none qualify or when attribution ran degraded.
    pub confidence: f64,
    /// True when the embedding service was unavailable and relevance fell
    /// back to retrieval scores.
    pub degraded: bool,
}

/// Aligns generated answers with the retrieval hits that support them.
pub struct SourceAttribution {
    embedder: Arc<ResilientEmbedder>,
}

impl SourceAttribution {
    pub fn new(embedder: Arc<ResilientEmbedder>) -> Self {
        Self { embedder }
    }

    /// Score each hit's support for `answer` and produce citations.
    ///
    /// When the embedding circuit is open the result degrades gracefully:
    /// relevance falls back to each hit's retrieval score and confidence is 0.
    pub async fn attribute(&self, answer: &str, hits: &[SearchHit]) -> AttributionResult {
        if hits.is_empty() {
            return AttributionResult {
                sources: vec![],
                confidence: 0.0,
                degraded: false,
            };
        }

        let sentences = split_sentences(answer);
        if sentences.is_empty() {
            return self.degraded_result(hits);
        }

        // One batch: answer sentences first, then hit contents.
        let mut texts: Vec<String> = sentences.clone();
        texts.extend(hits.iter().map(|h| h.content.clone()));

        let embeddings = match self.embedder.embed_batch(&texts).await {
            Ok(embeddings) => embeddings,
            Err(err) => {
                warn!("attribution degraded, embedding unavailable: {err}");
                return self.degraded_result(hits);
            }
        };
        let (sentence_embs, hit_embs) = embeddings.split_at(sentences.len());

        let mut sources: Vec<SourceReference> = hits
            .iter()
            .zip(hit_embs)
            .map(|(hit, hit_emb)| {
                let relevance = sentence_embs
                    .iter()
                    .map(|s| cosine_similarity(s, hit_emb))
                    .fold(0.0f64, f64::max)
                    .clamp(0.0, 1.0);
                SourceReference {
                    chunk_id: hit.chunk_id.clone(),
                    doc_id: hit.doc_id.clone(),
                    kb_id: hit.kb_id.clone(),
                    content: hit.content.clone(),
                    relevance,
                    citation: best_citation(answer, &hit.content),
                    page: hit.page,
                    section_title: hit.section_title.clone(),
                }
            })
            .collect();
        sources.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let qualifying: Vec<f64> = sources
            .iter()
            .map(|s| s.relevance)
            .filter(|r| *r >= CONFIDENCE_THRESHOLD)
            .collect();
        let confidence = if qualifying.is_empty() {
            0.0
        } else {
            qualifying.iter().sum::<f64>() / qualifying.len() as f64
        };

        AttributionResult {
            sources,
            confidence,
            degraded: false,
        }
    }

    fn degraded_result(&self, hits: &[SearchHit]) -> AttributionResult {
        let sources = hits
            .iter()
            .map(|hit| SourceReference {
                chunk_id: hit.chunk_id.clone(),
                doc_id: hit.doc_id.clone(),
                kb_id: hit.kb_id.clone(),
                content: hit.content.clone(),
                relevance: hit.final_score(),
                citation: String::new(),
                page: hit.page,
                section_title: hit.section_title.clone(),
            })
            .collect();
        AttributionResult {
            sources,
            confidence: 0.0,
            degraded: true,
        }
    }
}

/// The source sentence with the highest word overlap against the answer.
fn best_citation(answer: &str, source_content: &str) -> String {
    split_sentences(source_content)
        .into_iter()
        .map(|sentence| {
            let score = overlap_ratio(&sentence, answer);
            (sentence, score)
        })
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .filter(|(_, score)| *score > 0.0)
        .map(|(sentence, _)| sentence)
        .unwrap_or_default()
}

/// Numbered bibliography over deduplicated documents.
pub fn format_bibliography(sources: &[SourceReference]) -> String {
    let mut seen = std::collections::HashSet::new();
    let mut lines = Vec::new();
    for source in sources {
        if seen.insert(source.doc_id.clone()) {
            lines.push(format!("[{}] {}", seen.len(), source.label()));
        }
    }
    lines.join("\n")
}

/// Append `[n]` markers to answer sentences that a source supports.
pub fn annotate_answer(answer: &str, sources: &[SourceReference]) -> String {
    let mut doc_order: Vec<&str> = Vec::new();
    for source in sources {
        if !doc_order.contains(&source.doc_id.as_str()) {
            doc_order.push(&source.doc_id);
        }
    }

    split_sentences(answer)
        .into_iter()
        .map(|sentence| {
            let marker = sources
                .iter()
                .find(|s| !s.citation.is_empty() && overlap_ratio(&sentence, &s.content) >= 0.5)
                .and_then(|s| doc_order.iter().position(|d| *d == s.doc_id))
                .map(|i| format!("[{}]", i + 1))
                .unwrap_or_default();
            format!("{sentence}{marker}")
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResilienceConfig;
    use crate::embedding::EmbeddingModel;
    use crate::resilience::ResiliencePolicy;
    use async_trait::async_trait;

    /// Deterministic embedding: a 8-dim histogram of word-set hashes, so
    /// overlapping texts get high cosine similarity.
    struct HashEmbedder;

    #[async_trait]
    impl EmbeddingModel for HashEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| embed(t)).collect())
        }

        async fn embed_text(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            Ok(embed(text))
        }

        fn dimensions(&self) -> usize {
            8
        }

        fn model_name(&self) -> &str {
            "hash"
        }
    }

    fn embed(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; 8];
        for word in crate::text::word_set(text) {
            let mut h = 0usize;
            for b in word.bytes() {
                h = h.wrapping_mul(31).wrapping_add(b as usize);
            }
            v[h % 8] += 1.0;
        }
        v
    }

    fn embedder() -> Arc<ResilientEmbedder> {
        Arc::new(ResilientEmbedder::new(
            Arc::new(HashEmbedder),
            ResiliencePolicy::new("embedding", &ResilienceConfig::default()),
            100,
        ))
    }

    fn hit(chunk_id: &str, content: &str, score: f64) -> SearchHit {
        SearchHit {
            chunk_id: chunk_id.to_string(),
            doc_id: format!("doc-{chunk_id}"),
            kb_id: "kb1".to_string(),
            chunk_index: 0,
            content: content.to_string(),
            raw_score: score,
            fused_score: score,
            rerank_score: None,
            page: Some(1),
            section_title: None,
        }
    }

    #[tokio::test]
    async fn test_relevant_source_ranks_first() {
        let attribution = SourceAttribution::new(embedder());
        let hits = vec![
            hit("c1", "The cat sat on the mat near the door.", 0.9),
            hit("c2", "Quarterly revenue grew by seven percent.", 0.8),
        ];
        let result = attribution
            .attribute("The cat sat on the mat.", &hits)
            .await;

        assert!(!result.degraded);
        assert_eq!(result.sources[0].chunk_id, "c1");
        assert!(result.sources[0].relevance > result.sources[1].relevance);
        assert!(result.sources[0].citation.contains("cat"));
    }

    #[tokio::test]
    async fn test_confidence_mean_of_qualifying() {
        let attribution = SourceAttribution::new(embedder());
        let hits = vec![hit("c1", "The cat sat on the mat.", 0.9)];
        let result = attribution.attribute("The cat sat on the mat.", &hits).await;
        assert!(result.confidence > CONFIDENCE_THRESHOLD);
    }

    #[tokio::test]
    async fn test_degraded_when_circuit_open() {
        let embedder = embedder();
        embedder.breaker().force_open();
        let attribution = SourceAttribution::new(embedder);
        let hits = vec![hit("c1", "content", 0.7)];
        let result = attribution.attribute("answer", &hits).await;

        assert!(result.degraded);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.sources[0].relevance, 0.7);
    }

    #[tokio::test]
    async fn test_empty_hits() {
        let attribution = SourceAttribution::new(embedder());
        let result = attribution.attribute("answer", &[]).await;
        assert!(result.sources.is_empty());
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_bibliography_dedupes_documents() {
        let source = |chunk_id: &str, doc_id: &str| SourceReference {
            chunk_id: chunk_id.into(),
            doc_id: doc_id.into(),
            kb_id: "kb1".into(),
            content: String::new(),
            relevance: 0.5,
            citation: String::new(),
            page: None,
            section_title: None,
        };
        let bib = format_bibliography(&[source("c1", "d1"), source("c2", "d1"), source("c3", "d2")]);
        assert_eq!(bib.lines().count(), 2);
        assert!(bib.starts_with("[1] d1"));
    }

    #[test]
    fn test_label_includes_page_and_section() {
        let source = SourceReference {
            chunk_id: "c".into(),
            doc_id: "handbook".into(),
            kb_id: "kb".into(),
            content: String::new(),
            relevance: 1.0,
            citation: String::new(),
            page: Some(4),
            section_title: Some("Results".into()),
        };
        assert_eq!(source.label(), "handbook — p.4 — «Results»");
    }
}
