pub mod fusion;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::bm25::Bm25IndexManager;
use crate::config::{ResilienceSection, Settings};
use crate::embedding::ResilientEmbedder;
use crate::error::{classify_backend, CoreError, CoreResult};
use crate::models::{
    KnowledgeBase, RewriteResult, SearchHit, SearchMode, SearchOptions, SearchResponse,
};
use crate::repository::Repository;
use crate::rerank::Reranker;
use crate::resilience::{CircuitState, DegradationManager, ResiliencePolicy};
use crate::rewrite::QueryRewriter;
use crate::telemetry::Telemetry;
use crate::vector_store::{meta, VectorStoreBackend};
use fusion::Candidate;

/// Engine-level limits and defaults resolved from settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_alpha: f64,
    pub default_top_k: usize,
    pub rerank_batch_cap: usize,
    pub min_score: f64,
    pub max_concurrent_requests: usize,
    pub max_upstream_calls_per_request: usize,
    pub request_timeout: Duration,
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            default_alpha: settings.retrieval.default_alpha,
            default_top_k: settings.retrieval.default_top_k,
            rerank_batch_cap: settings.retrieval.rerank_batch_cap,
            min_score: settings.retrieval.min_score,
            max_concurrent_requests: settings.service.max_concurrent_requests,
            max_upstream_calls_per_request: settings.service.max_upstream_calls_per_request,
            request_timeout: settings.request_timeout(),
        }
    }
}

/// At most this many query variants (beyond the primary rewrite) feed
/// retrieval.
const MAX_RETRIEVAL_VARIANTS: usize = 2;

/// Missing-sparse-index warnings are rate limited to once per KB per minute.
const MISSING_INDEX_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Hybrid dense + sparse retrieval over one or more knowledge bases:
/// rewrite → parallel modality passes → normalize → fuse → rerank → dedup.
pub struct RetrievalEngine {
    repository: Arc<dyn Repository>,
    vector_store: Arc<dyn VectorStoreBackend>,
    vector_policy: Arc<ResiliencePolicy>,
    embedder: Arc<ResilientEmbedder>,
    bm25: Arc<Bm25IndexManager>,
    reranker: Option<Arc<dyn Reranker>>,
    rerank_policy: ResiliencePolicy,
    rewriter: Option<Arc<QueryRewriter>>,
    degradation: Arc<DegradationManager>,
    telemetry: Arc<Telemetry>,
    config: EngineConfig,
    request_gate: Arc<Semaphore>,
    missing_index_logged: Mutex<HashMap<String, Instant>>,
}

impl RetrievalEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository: Arc<dyn Repository>,
        vector_store: Arc<dyn VectorStoreBackend>,
        vector_policy: Arc<ResiliencePolicy>,
        embedder: Arc<ResilientEmbedder>,
        bm25: Arc<Bm25IndexManager>,
        reranker: Option<Arc<dyn Reranker>>,
        rewriter: Option<Arc<QueryRewriter>>,
        resilience: &ResilienceSection,
        degradation: Arc<DegradationManager>,
        telemetry: Arc<Telemetry>,
        config: EngineConfig,
    ) -> Self {
        let request_gate = Arc::new(Semaphore::new(config.max_concurrent_requests.max(1)));
        Self {
            repository,
            vector_store,
            vector_policy,
            embedder,
            bm25,
            reranker,
            rerank_policy: ResiliencePolicy::new("rerank", &resilience.for_service("rerank")),
            rewriter,
            degradation,
            telemetry,
            config,
            request_gate,
            missing_index_logged: Mutex::new(HashMap::new()),
        }
    }

    pub fn vector_breaker(&self) -> &Arc<crate::resilience::CircuitBreaker> {
        self.vector_policy.breaker()
    }

    pub fn rerank_breaker(&self) -> &Arc<crate::resilience::CircuitBreaker> {
        self.rerank_policy.breaker()
    }

    /// Run a retrieval request. See `SearchOptions` for the knobs.
    pub async fn search(
        &self,
        kb_ids: &[String],
        query: &str,
        top_k: usize,
        options: &SearchOptions,
    ) -> CoreResult<SearchResponse> {
        let _permit = self
            .request_gate
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CoreError::ServiceUnavailable("engine shutting down".into()))?;

        self.telemetry.record_request();
        let started = Instant::now();

        let result = tokio::time::timeout(
            self.config.request_timeout,
            self.search_inner(kb_ids, query, top_k, options),
        )
        .await
        .unwrap_or(Err(CoreError::DeadlineExceeded));

        self.telemetry.record_latency("retrieval", started.elapsed());
        match &result {
            Ok(response) if response.degraded => self.telemetry.record_degraded(),
            Err(_) => self.telemetry.record_failure(),
            _ => {}
        }
        result
    }

    async fn search_inner(
        &self,
        kb_ids: &[String],
        query: &str,
        top_k: usize,
        options: &SearchOptions,
    ) -> CoreResult<SearchResponse> {
        let kbs = self.validate(kb_ids, query, top_k).await?;
        let alpha = match options.mode {
            SearchMode::Dense => 1.0,
            SearchMode::Sparse => 0.0,
            SearchMode::Hybrid => options.alpha.clamp(0.0, 1.0),
        };

        // 1. Rewrite before any retrieval fan-out.
        let rewrite = self.maybe_rewrite(query, options).await;
        let queries = retrieval_queries(query, rewrite.as_ref());
        let q_main = queries[0].clone();

        // 2. + 3. Modality passes; sparse is local CPU work, dense suspends
        // on the embedding and vector-store calls.
        let fetch_k = (top_k * 2).max(top_k);
        let sparse_results = if options.mode == SearchMode::Dense {
            SparseOutcome::default()
        } else {
            self.sparse_pass(&kbs, &queries, fetch_k).await
        };

        let mut degraded_reason: Option<String> = None;
        let mut effective_alpha = alpha;
        let dense_results = if options.mode == SearchMode::Sparse {
            HashMap::new()
        } else {
            match self.dense_pass(&kbs, &queries, fetch_k, options).await {
                Ok(results) => results,
                Err(err) => {
                    // Dense unavailable: fall back to sparse-only when
                    // anything sparse exists, else the request fails.
                    if options.mode == SearchMode::Dense || !sparse_results.any_index_present {
                        return Err(match err {
                            CoreError::CircuitOpen(_)
                            | CoreError::Upstream { .. }
                            | CoreError::DeadlineExceeded => CoreError::ServiceUnavailable(
                                format!("all retrieval modalities unavailable: {err}"),
                            ),
                            other => other,
                        });
                    }
                    warn!("dense retrieval unavailable, serving sparse only: {err}");
                    degraded_reason = Some(
                        self.degradation
                            .degraded_search("dense retrieval unavailable"),
                    );
                    effective_alpha = 0.0;
                    HashMap::new()
                }
            }
        };

        // 4. + 5. Normalize within the request and fuse.
        let candidates = build_candidates(dense_results, sparse_results.hits);
        let mut hits = fusion::fuse(candidates, effective_alpha, options.fusion);

        // 6. Rerank the fused shortlist.
        if options.use_rerank {
            self.maybe_rerank(&q_main, &mut hits, top_k).await;
        }

        // 7. Cross-KB dedup on (doc_id, chunk_index).
        dedup_cross_kb(&mut hits);

        // 8. Final ordering and cut.
        fusion::sort_hits(&mut hits);
        hits.retain(|h| h.final_score() >= options.min_score.max(self.config.min_score));
        hits.truncate(top_k);

        if hits.is_empty() && degraded_reason.is_none() {
            debug!("query matched nothing: {q_main:?} over {} KBs", kbs.len());
        }

        Ok(SearchResponse {
            hits,
            degraded: degraded_reason.is_some(),
            status: degraded_reason,
            rewrite,
        })
    }

    async fn validate(&self, kb_ids: &[String], query: &str, top_k: usize) -> CoreResult<Vec<KnowledgeBase>> {
        let query_chars = query.chars().count();
        if query_chars == 0 || query_chars > 1000 {
            return Err(CoreError::InvalidQuery(format!(
                "query length {query_chars} outside [1, 1000]"
            )));
        }
        if !(1..=200).contains(&top_k) {
            return Err(CoreError::InvalidQuery(format!(
                "top_k {top_k} outside [1, 200]"
            )));
        }
        if kb_ids.is_empty() {
            return Err(CoreError::InvalidQuery("no knowledge bases given".into()));
        }

        let mut kbs = Vec::with_capacity(kb_ids.len());
        for kb_id in kb_ids {
            let kb = self
                .repository
                .get_kb(kb_id)
                .await
                .map_err(|e| CoreError::upstream("repository", e))?
                .ok_or_else(|| CoreError::KbNotFound(kb_id.clone()))?;
            if !kb.active {
                return Err(CoreError::KbInactive(kb_id.clone()));
            }
            kbs.push(kb);
        }
        Ok(kbs)
    }

    async fn maybe_rewrite(&self, query: &str, options: &SearchOptions) -> Option<RewriteResult> {
        if !options.use_query_rewrite {
            return None;
        }
        let conversation_id = options.conversation_id.as_deref()?;
        let rewriter = self.rewriter.as_ref()?;
        let result = rewriter.rewrite_for_conversation(query, conversation_id).await;
        Some(result)
    }

    /// BM25 over every (kb, query) pair, deduplicated by chunk keeping the
    /// best score. KBs without a resident index contribute nothing.
    async fn sparse_pass(
        &self,
        kbs: &[KnowledgeBase],
        queries: &[String],
        fetch_k: usize,
    ) -> SparseOutcome {
        let mut outcome = SparseOutcome::default();
        for kb in kbs {
            let mut kb_seen = false;
            for query in queries {
                match self.bm25.search(&kb.id, query, fetch_k).await {
                    Some(hits) => {
                        kb_seen = true;
                        for hit in hits {
                            let entry = outcome
                                .hits
                                .entry(hit.chunk_id.clone())
                                .or_insert_with(|| (kb.id.clone(), hit.clone()));
                            if hit.score > entry.1.score {
                                *entry = (kb.id.clone(), hit);
                            }
                        }
                    }
                    None => {
                        self.log_missing_index(&kb.id).await;
                    }
                }
            }
            outcome.any_index_present |= kb_seen;
        }
        outcome
    }

    async fn log_missing_index(&self, kb_id: &str) {
        let mut logged = self.missing_index_logged.lock().await;
        let due = logged
            .get(kb_id)
            .map_or(true, |at| at.elapsed() >= MISSING_INDEX_LOG_INTERVAL);
        if due {
            warn!("sparse index missing for KB {kb_id}; sparse scores are 0");
            logged.insert(kb_id.to_string(), Instant::now());
        }
    }

    /// Batch-embed all queries once, then search every (embedding, kb) pair
    /// with bounded concurrency. Returns per-chunk best matches.
    async fn dense_pass(
        &self,
        kbs: &[KnowledgeBase],
        queries: &[String],
        fetch_k: usize,
        options: &SearchOptions,
    ) -> CoreResult<HashMap<String, DenseMatch>> {
        let embed_started = Instant::now();
        // Variants express different semantic content, so each is embedded
        // in its own right; one upstream call covers them all.
        let embeddings = self.embedder.embed_batch(queries).await?;
        self.telemetry.record_latency("embedding", embed_started.elapsed());

        let upstream_gate = Arc::new(Semaphore::new(
            self.config.max_upstream_calls_per_request.max(1),
        ));
        let mut tasks: JoinSet<CoreResult<Vec<(String, crate::vector_store::VectorMatch)>>> =
            JoinSet::new();

        for kb in kbs {
            let collection = kb.collection_name();
            for embedding in &embeddings {
                let store = Arc::clone(&self.vector_store);
                let gate = Arc::clone(&upstream_gate);
                let policy = Arc::clone(&self.vector_policy);
                let kb_id = kb.id.clone();
                let collection = collection.clone();
                let embedding = embedding.clone();
                let filter = options.filters.clone();

                tasks.spawn(async move {
                    let _slot = gate
                        .acquire_owned()
                        .await
                        .map_err(|_| CoreError::ServiceUnavailable("request cancelled".into()))?;
                    let matches = policy
                        .call(|| async {
                            store
                                .search(&collection, &embedding, fetch_k, filter.as_ref())
                                .await
                                .map_err(|e| classify_backend("vector_store", e))
                        })
                        .await?;
                    Ok(matches.into_iter().map(|m| (kb_id.clone(), m)).collect())
                });
            }
        }

        let search_started = Instant::now();
        let mut best: HashMap<String, DenseMatch> = HashMap::new();
        let mut successes = 0usize;
        let mut last_error: Option<CoreError> = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;
            match result {
                Ok(matches) => {
                    successes += 1;
                    for (kb_id, m) in matches {
                        merge_dense_match(&mut best, kb_id, m);
                    }
                }
                Err(err) => {
                    debug!("dense subtask failed: {err}");
                    last_error = Some(err);
                }
            }
        }
        self.telemetry.record_latency("vector_store", search_started.elapsed());

        if successes == 0 {
            if let Some(err) = last_error {
                return Err(err);
            }
        }
        Ok(best)
    }

    /// Cross-encode the fused shortlist when reranking is on and the rerank
    /// circuit is not open; scores replace fused scores. Failures leave the
    /// fused ranking untouched.
    async fn maybe_rerank(&self, query: &str, hits: &mut Vec<SearchHit>, top_k: usize) {
        let reranker = match &self.reranker {
            Some(r) => Arc::clone(r),
            None => return,
        };
        if hits.is_empty() {
            return;
        }
        if self.rerank_policy.breaker().state() == CircuitState::Open {
            debug!("rerank circuit open, keeping fused ranking");
            return;
        }

        let shortlist = self.config.rerank_batch_cap.min(4 * top_k).min(hits.len());
        let docs: Vec<String> = hits[..shortlist].iter().map(|h| h.content.clone()).collect();

        let started = Instant::now();
        let outcome = self
            .rerank_policy
            .call(|| async {
                reranker
                    .score(query, &docs)
                    .await
                    .map_err(|e| classify_backend("rerank", e))
            })
            .await;
        self.telemetry.record_latency("rerank", started.elapsed());

        match outcome {
            Ok(scores) => {
                // Only the shortlist gets cross-encoder scores; hits past it
                // keep their fused score and still compete in the final sort,
                // so a top_k larger than the shortlist is served in full.
                for (hit, score) in hits[..shortlist].iter_mut().zip(scores) {
                    hit.rerank_score = Some(score);
                }
            }
            Err(err) => {
                info!("rerank unavailable, keeping fused ranking: {err}");
            }
        }
    }
}

#[derive(Default)]
struct SparseOutcome {
    /// chunk_id → (kb_id, best sparse hit).
    hits: HashMap<String, (String, crate::bm25::SparseHit)>,
    /// Whether at least one requested KB had a resident sparse index.
    any_index_present: bool,
}

struct DenseMatch {
    kb_id: String,
    score: f64,
    metadata: HashMap<String, serde_json::Value>,
}

fn merge_dense_match(
    best: &mut HashMap<String, DenseMatch>,
    kb_id: String,
    m: crate::vector_store::VectorMatch,
) {
    let chunk_id = m
        .metadata
        .get(meta::CHUNK_ID)
        .and_then(|v| v.as_str())
        .unwrap_or(&m.id)
        .to_string();
    let candidate = DenseMatch {
        kb_id,
        score: m.score,
        metadata: m.metadata,
    };
    match best.get_mut(&chunk_id) {
        Some(existing) if existing.score >= candidate.score => {}
        _ => {
            best.insert(chunk_id, candidate);
        }
    }
}

/// The primary query plus at most two variants.
fn retrieval_queries(query: &str, rewrite: Option<&RewriteResult>) -> Vec<String> {
    match rewrite {
        Some(r) => {
            let mut queries = vec![r.rewritten.clone()];
            queries.extend(r.variants.iter().take(MAX_RETRIEVAL_VARIANTS).cloned());
            queries
        }
        None => vec![query.to_string()],
    }
}

/// Join the modality maps into fusion candidates.
fn build_candidates(
    dense: HashMap<String, DenseMatch>,
    sparse: HashMap<String, (String, crate::bm25::SparseHit)>,
) -> Vec<Candidate> {
    let mut candidates: HashMap<String, Candidate> = HashMap::new();

    for (chunk_id, m) in dense {
        // Nearest-neighbor backends return top-k regardless of similarity;
        // a non-positive score is no evidence at all.
        if m.score <= 0.0 {
            continue;
        }
        let get_str = |key: &str| {
            m.metadata
                .get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_default()
        };
        candidates.insert(
            chunk_id.clone(),
            Candidate {
                chunk_id,
                doc_id: get_str(meta::DOC_ID),
                kb_id: if m.metadata.contains_key(meta::KB_ID) {
                    get_str(meta::KB_ID)
                } else {
                    m.kb_id.clone()
                },
                chunk_index: m
                    .metadata
                    .get(meta::CHUNK_INDEX)
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0) as i32,
                content: get_str(meta::CONTENT),
                page: m
                    .metadata
                    .get(meta::PAGE)
                    .and_then(|v| v.as_i64())
                    .map(|p| p as i32),
                section_title: m
                    .metadata
                    .get(meta::SECTION_TITLE)
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                dense: Some(m.score.max(0.0)),
                sparse: None,
            },
        );
    }

    for (chunk_id, (kb_id, hit)) in sparse {
        match candidates.get_mut(&chunk_id) {
            Some(candidate) => {
                candidate.sparse = Some(hit.score);
                // Sparse hits carry authoritative chunk metadata.
                if candidate.content.is_empty() {
                    candidate.content = hit.content;
                }
                if candidate.doc_id.is_empty() {
                    candidate.doc_id = hit.doc_id;
                }
            }
            None => {
                candidates.insert(
                    chunk_id.clone(),
                    Candidate {
                        chunk_id,
                        doc_id: hit.doc_id,
                        kb_id,
                        chunk_index: hit.chunk_index,
                        content: hit.content,
                        page: hit.page,
                        section_title: hit.section_title,
                        dense: None,
                        sparse: Some(hit.score),
                    },
                );
            }
        }
    }

    candidates.into_values().collect()
}

/// Shared content can surface the same `(doc_id, chunk_index)` from several
/// KB shards; keep the best-scoring one.
fn dedup_cross_kb(hits: &mut Vec<SearchHit>) {
    let mut best: HashMap<(String, i32), SearchHit> = HashMap::new();
    for hit in hits.drain(..) {
        let key = (hit.doc_id.clone(), hit.chunk_index);
        match best.get(&key) {
            Some(existing) if existing.final_score() >= hit.final_score() => {}
            _ => {
                best.insert(key, hit);
            }
        }
    }
    hits.extend(best.into_values());
}
