//! Score fusion across the dense and sparse modalities.

use crate::models::{FusionStrategy, SearchHit};

/// RRF smoothing constant.
const RRF_K: f64 = 60.0;

/// A chunk observed by one or both modalities before fusion.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub chunk_id: String,
    pub doc_id: String,
    pub kb_id: String,
    pub chunk_index: i32,
    pub content: String,
    pub page: Option<i32>,
    pub section_title: Option<String>,
    /// Raw cosine similarity, when the dense pass saw this chunk.
    pub dense: Option<f64>,
    /// Raw BM25 score, when the sparse pass saw this chunk.
    pub sparse: Option<f64>,
}

/// Fuse candidates into scored hits, sorted by descending fused score with
/// `(doc_id, chunk_index)` as the stable tie-break. Fused scores lie in
/// [0, 1].
pub fn fuse(candidates: Vec<Candidate>, alpha: f64, strategy: FusionStrategy) -> Vec<SearchHit> {
    if candidates.is_empty() {
        return vec![];
    }
    let fused = match strategy {
        FusionStrategy::Weighted => weighted(&candidates, alpha),
        FusionStrategy::ReciprocalRank => reciprocal_rank(&candidates, alpha),
    };

    let mut hits: Vec<SearchHit> = candidates
        .into_iter()
        .zip(fused)
        .map(|(c, fused_score)| {
            let raw_score = match (c.dense, c.sparse) {
                (Some(d), Some(s)) => d.max(s),
                (Some(d), None) => d,
                (None, Some(s)) => s,
                (None, None) => 0.0,
            };
            SearchHit {
                chunk_id: c.chunk_id,
                doc_id: c.doc_id,
                kb_id: c.kb_id,
                chunk_index: c.chunk_index,
                content: c.content,
                raw_score: raw_score.max(0.0),
                fused_score,
                rerank_score: None,
                page: c.page,
                section_title: c.section_title,
            }
        })
        .collect();

    sort_hits(&mut hits);
    hits
}

/// Descending final score; ties break on ascending `(doc_id, chunk_index)`
/// so rankings are stable across runs.
pub fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.final_score()
            .partial_cmp(&a.final_score())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.doc_id.cmp(&b.doc_id))
            .then_with(|| a.chunk_index.cmp(&b.chunk_index))
    });
}

/// Min-max normalize each modality over the candidate union, then
/// `α·dense + (1−α)·sparse`. A missing modality contributes 0.
fn weighted(candidates: &[Candidate], alpha: f64) -> Vec<f64> {
    let dense_norm = min_max(candidates.iter().map(|c| c.dense));
    let sparse_norm = min_max(candidates.iter().map(|c| c.sparse));
    candidates
        .iter()
        .enumerate()
        .map(|(i, _)| alpha * dense_norm[i] + (1.0 - alpha) * sparse_norm[i])
        .collect()
}

/// Normalize present scores to [0, 1]; absent scores become 0. When all
/// present scores are equal they normalize to 1.
fn min_max(scores: impl Iterator<Item = Option<f64>>) -> Vec<f64> {
    let scores: Vec<Option<f64>> = scores.collect();
    let present: Vec<f64> = scores.iter().filter_map(|s| *s).collect();
    if present.is_empty() {
        return vec![0.0; scores.len()];
    }
    let min = present.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = present.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    scores
        .iter()
        .map(|s| match s {
            None => 0.0,
            Some(_) if max == min => 1.0,
            Some(v) => (v - min) / (max - min),
        })
        .collect()
}

/// Reciprocal rank fusion: `α/(60 + rank_dense + 1) + (1−α)/(60 + rank_sparse + 1)`,
/// min-max normalized into [0, 1] afterwards.
fn reciprocal_rank(candidates: &[Candidate], alpha: f64) -> Vec<f64> {
    let dense_ranks = ranks(candidates.iter().map(|c| c.dense));
    let sparse_ranks = ranks(candidates.iter().map(|c| c.sparse));

    let raw: Vec<f64> = candidates
        .iter()
        .enumerate()
        .map(|(i, _)| {
            let mut score = 0.0;
            if let Some(rank) = dense_ranks[i] {
                score += alpha / (RRF_K + rank as f64 + 1.0);
            }
            if let Some(rank) = sparse_ranks[i] {
                score += (1.0 - alpha) / (RRF_K + rank as f64 + 1.0);
            }
            score
        })
        .collect();

    min_max(raw.into_iter().map(Some))
}

/// Rank (0 = best) of each present score within its modality.
fn ranks(scores: impl Iterator<Item = Option<f64>>) -> Vec<Option<usize>> {
    let scores: Vec<Option<f64>> = scores.collect();
    let mut order: Vec<usize> = (0..scores.len()).filter(|i| scores[*i].is_some()).collect();
    order.sort_by(|a, b| {
        scores[*b]
            .partial_cmp(&scores[*a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut out = vec![None; scores.len()];
    for (rank, idx) in order.into_iter().enumerate() {
        out[idx] = Some(rank);
    }
    out
}
