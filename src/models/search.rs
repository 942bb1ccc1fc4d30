use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ──────────────────────────── Search ────────────────────────────

/// Which retrieval modalities to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Dense,
    Sparse,
    #[default]
    Hybrid,
}

/// How dense and sparse rankings are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FusionStrategy {
    /// Min-max normalize each modality, then `α·dense + (1−α)·sparse`.
    #[default]
    Weighted,
    /// Reciprocal rank fusion with smoothing constant 60.
    ReciprocalRank,
}

/// Per-request retrieval options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOptions {
    #[serde(default)]
    pub mode: SearchMode,
    /// Dense weight in hybrid fusion, clamped to [0, 1].
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_true")]
    pub use_rerank: bool,
    #[serde(default)]
    pub use_query_rewrite: bool,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub filters: Option<HashMap<String, serde_json::Value>>,
    /// Hits scoring below this after fusion/rerank are dropped.
    #[serde(default)]
    pub min_score: f64,
    #[serde(default)]
    pub fusion: FusionStrategy,
}

fn default_alpha() -> f64 {
    0.5
}
fn default_true() -> bool {
    true
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            mode: SearchMode::Hybrid,
            alpha: default_alpha(),
            use_rerank: true,
            use_query_rewrite: false,
            conversation_id: None,
            filters: None,
            min_score: 0.0,
            fusion: FusionStrategy::Weighted,
        }
    }
}

/// A single retrieved chunk with its scores through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub doc_id: String,
    pub kb_id: String,
    pub chunk_index: i32,
    pub content: String,
    /// Best pre-fusion modality score (cosine similarity or raw BM25).
    pub raw_score: f64,
    /// Fused score in [0, 1] after per-request normalization.
    pub fused_score: f64,
    /// Cross-encoder score when reranking ran; replaces the fused score in
    /// the final ordering.
    #[serde(default)]
    pub rerank_score: Option<f64>,
    #[serde(default)]
    pub page: Option<i32>,
    #[serde(default)]
    pub section_title: Option<String>,
}

impl SearchHit {
    /// The score the final ordering uses.
    pub fn final_score(&self) -> f64 {
        self.rerank_score.unwrap_or(self.fused_score)
    }
}

/// Result of a retrieval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    /// Set when the request was served with a reduced pipeline (e.g. sparse
    /// only because the embedding circuit is open).
    #[serde(default)]
    pub degraded: bool,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub rewrite: Option<RewriteResult>,
}

// ──────────────────────────── Query rewriting ────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationRole {
    User,
    Assistant,
}

/// One turn of conversation history, kept in a bounded per-conversation ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: ConversationRole,
    pub content: String,
    pub ts: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ConversationRole::User,
            content: content.into(),
            ts: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ConversationRole::Assistant,
            content: content.into(),
            ts: Utc::now(),
        }
    }
}

/// Outcome of the query rewriter. Not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteResult {
    pub original: String,
    pub rewritten: String,
    pub variants: Vec<String>,
    /// Rewriter confidence in [0, 1]. 1.0 for the identity rewrite, 0.0 when
    /// the LLM call or parse failed and the original query was passed through.
    pub confidence: f64,
}

impl RewriteResult {
    /// Identity rewrite used when there is no history or the LLM is down.
    pub fn identity(query: &str, confidence: f64) -> Self {
        Self {
            original: query.to_string(),
            rewritten: query.to_string(),
            variants: vec![],
            confidence,
        }
    }
}
