use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::attribution::SourceAttribution;
use crate::bm25::Bm25IndexManager;
use crate::compression::ContextCompressor;
use crate::config::Settings;
use crate::embedding::openai::OpenAiEmbeddingModel;
use crate::embedding::{EmbeddingModel, ResilientEmbedder};
use crate::error::{CoreError, CoreResult};
use crate::ingestion::IngestionPipeline;
use crate::llm::openai::OpenAiCompletionModel;
use crate::llm::{CompletionModel, LlmProviderManager};
use crate::repository::memory::MemoryRepository;
use crate::repository::postgres::PostgresRepository;
use crate::repository::Repository;
use crate::rerank::api::ApiReranker;
use crate::rerank::Reranker;
use crate::resilience::{BreakerSnapshot, DegradationManager, ResiliencePolicy};
use crate::retrieval::{EngineConfig, RetrievalEngine};
use crate::rewrite::QueryRewriter;
use crate::telemetry::{Telemetry, TelemetrySnapshot};
use crate::vector_store::memory::MemoryVectorStore;
use crate::vector_store::pgvector::PgVectorStore;
use crate::vector_store::VectorStoreBackend;

/// Everything the retrieval core shares across requests. Requests borrow
/// these through `Arc`s; the registry owns their lifecycle.
pub struct Services {
    pub repository: Arc<dyn Repository>,
    pub vector_store: Arc<dyn VectorStoreBackend>,
    pub embedder: Arc<ResilientEmbedder>,
    pub reranker: Option<Arc<dyn Reranker>>,
    pub llm: Arc<LlmProviderManager>,
    pub bm25: Arc<Bm25IndexManager>,
    pub rewriter: Arc<QueryRewriter>,
    pub engine: Arc<RetrievalEngine>,
    pub pipeline: Arc<IngestionPipeline>,
    pub attribution: Arc<SourceAttribution>,
    pub compressor: Arc<ContextCompressor>,
    pub degradation: Arc<DegradationManager>,
    pub telemetry: Arc<Telemetry>,
    vector_policy: Arc<ResiliencePolicy>,
}

/// Optional backend injections, used by tests and by collaborators that
/// construct their own clients.
#[derive(Default)]
pub struct BackendOverrides {
    pub repository: Option<Arc<dyn Repository>>,
    pub vector_store: Option<Arc<dyn VectorStoreBackend>>,
    pub embedding_model: Option<Arc<dyn EmbeddingModel>>,
    pub reranker: Option<Arc<dyn Reranker>>,
    pub llm_providers: Option<Vec<(String, Arc<dyn CompletionModel>)>>,
}

/// Status payload for the collaborator's operator endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatus {
    pub initialized: bool,
    pub breakers: Vec<BreakerSnapshot>,
    pub bm25_loaded_kbs: Vec<String>,
    pub embedding_cache_entries: usize,
    pub degraded_searches: u64,
    pub degraded_completions: u64,
    pub telemetry: TelemetrySnapshot,
}

/// Owns the long-lived shared services. Initialization is idempotent and
/// concurrency-safe (double-checked under a mutex); shutdown tears down in
/// reverse dependency order.
pub struct ServiceRegistry {
    settings: Settings,
    services: std::sync::RwLock<Option<Arc<Services>>>,
    init_lock: Mutex<()>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceRegistry {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            services: std::sync::RwLock::new(None),
            init_lock: Mutex::new(()),
            flush_task: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The initialized services, if `initialize` has completed.
    pub fn services(&self) -> Option<Arc<Services>> {
        self.services.read().expect("registry lock poisoned").clone()
    }

    /// Initialize with backends built from settings.
    pub async fn initialize(&self) -> CoreResult<Arc<Services>> {
        self.initialize_with(BackendOverrides::default()).await
    }

    /// Initialize, preferring the given backends over settings-derived ones.
    /// Safe to call from multiple tasks; only the first builds.
    pub async fn initialize_with(&self, overrides: BackendOverrides) -> CoreResult<Arc<Services>> {
        if let Some(services) = self.services() {
            return Ok(services);
        }
        let _guard = self.init_lock.lock().await;
        // Double-check after winning the lock.
        if let Some(services) = self.services() {
            return Ok(services);
        }

        let services = Arc::new(self.build(overrides).await?);

        // Startup passes: load/rebuild indexes, then reconcile derived state.
        services
            .bm25
            .rebuild_all(services.repository.as_ref())
            .await?;
        match services.pipeline.reconcile_all().await {
            Ok(reports) => {
                let dirty = reports.iter().filter(|r| !r.is_clean()).count();
                if dirty > 0 {
                    info!("startup reconciliation repaired {dirty} knowledge bases");
                }
            }
            Err(e) => warn!("startup reconciliation incomplete: {e}"),
        }

        let flush_handle =
            Arc::clone(&services.bm25).spawn_flush_task(self.settings.bm25_flush_interval());
        *self.flush_task.lock().await = Some(flush_handle);

        *self.services.write().expect("registry lock poisoned") = Some(Arc::clone(&services));
        info!("service registry initialized");
        Ok(services)
    }

    async fn build(&self, overrides: BackendOverrides) -> CoreResult<Services> {
        let settings = &self.settings;

        // Dependency order: repository → vector store → models → composites.
        let repository: Arc<dyn Repository> = match overrides.repository {
            Some(repo) => repo,
            None => match settings.repository.provider.as_str() {
                "memory" => Arc::new(MemoryRepository::new()),
                _ => {
                    let repo = PostgresRepository::new(
                        &settings.postgres_uri,
                        settings.repository.pool_size,
                    )
                    .await
                    .map_err(CoreError::Internal)?;
                    repo.initialize().await.map_err(CoreError::Internal)?;
                    Arc::new(repo)
                }
            },
        };

        let vector_store: Arc<dyn VectorStoreBackend> = match overrides.vector_store {
            Some(store) => store,
            None => match settings.vector_store.provider.as_str() {
                "memory" => Arc::new(MemoryVectorStore::new()),
                _ => Arc::new(
                    PgVectorStore::new(
                        &settings.postgres_uri,
                        settings.repository.pool_size,
                        settings.vector_store.ivfflat_probes,
                    )
                    .await
                    .map_err(CoreError::Internal)?,
                ),
            },
        };

        let embedding_model: Arc<dyn EmbeddingModel> = match overrides.embedding_model {
            Some(model) => model,
            None => {
                let api_key = std::env::var(&settings.embedding.api_key_env).unwrap_or_default();
                Arc::new(OpenAiEmbeddingModel::new(
                    &settings.embedding.model,
                    &api_key,
                    settings.embedding.base_url.as_deref(),
                    settings.embedding.dimensions,
                    settings.embedding.batch_size,
                ))
            }
        };
        let embedder = Arc::new(ResilientEmbedder::new(
            embedding_model,
            ResiliencePolicy::new("embedding", &settings.resilience.for_service("embedding")),
            settings.embedding.cache_max,
        ));

        let reranker: Option<Arc<dyn Reranker>> = match overrides.reranker {
            Some(r) => Some(r),
            None => match (settings.rerank.enabled, settings.rerank.endpoint.as_deref()) {
                (true, Some(endpoint)) => {
                    Some(Arc::new(ApiReranker::new(&settings.rerank.model, endpoint)))
                }
                (true, None) => {
                    warn!("rerank enabled but no endpoint configured; reranking disabled");
                    None
                }
                _ => None,
            },
        };

        let degradation = Arc::new(DegradationManager::new());
        let telemetry = Arc::new(Telemetry::new());

        let llm_providers: Vec<(String, Arc<dyn CompletionModel>)> = match overrides.llm_providers {
            Some(providers) => providers,
            None => settings
                .llm
                .provider_priority
                .iter()
                .filter_map(|key| {
                    let provider = settings.llm.providers.get(key)?;
                    let api_key = std::env::var(&provider.api_key_env).unwrap_or_default();
                    let model: Arc<dyn CompletionModel> = Arc::new(OpenAiCompletionModel::new(
                        &provider.model,
                        &api_key,
                        provider.base_url.as_deref(),
                        settings.llm.default_max_tokens,
                        settings.llm.default_temperature,
                    ));
                    Some((key.clone(), model))
                })
                .collect(),
        };
        let llm = Arc::new(LlmProviderManager::new(
            llm_providers,
            &settings.resilience,
            Arc::clone(&degradation),
        ));

        let bm25 = Arc::new(Bm25IndexManager::new(settings.bm25_dir(), &settings.bm25));
        let rewriter = Arc::new(QueryRewriter::new(
            Arc::clone(&llm),
            settings.rewrite.clone(),
        ));

        let vector_policy = Arc::new(ResiliencePolicy::new(
            "vector_store",
            &settings.resilience.for_service("vector_store"),
        ));

        let engine = Arc::new(RetrievalEngine::new(
            Arc::clone(&repository),
            Arc::clone(&vector_store),
            Arc::clone(&vector_policy),
            Arc::clone(&embedder),
            Arc::clone(&bm25),
            reranker.clone(),
            Some(Arc::clone(&rewriter)),
            &settings.resilience,
            Arc::clone(&degradation),
            Arc::clone(&telemetry),
            EngineConfig::from_settings(settings),
        ));

        let pipeline = Arc::new(IngestionPipeline::new(
            Arc::clone(&repository),
            Arc::clone(&vector_store),
            Arc::clone(&vector_policy),
            Arc::clone(&embedder),
            Arc::clone(&bm25),
        ));

        let attribution = Arc::new(SourceAttribution::new(Arc::clone(&embedder)));
        let compressor = Arc::new(ContextCompressor::new(Arc::clone(&embedder)));

        Ok(Services {
            repository,
            vector_store,
            embedder,
            reranker,
            llm,
            bm25,
            rewriter,
            engine,
            pipeline,
            attribution,
            compressor,
            degradation,
            telemetry,
            vector_policy,
        })
    }

    /// Tear down in reverse dependency order: stop the flush loop, persist
    /// dirty indexes, then release the service graph.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.flush_task.lock().await.take() {
            handle.abort();
        }
        let services = {
            self.services
                .write()
                .expect("registry lock poisoned")
                .take()
        };
        if let Some(services) = services {
            let flushed = services.bm25.flush_dirty().await;
            info!("shutdown: flushed {flushed} BM25 indexes");
        }
        info!("service registry shut down");
    }

    /// Operator status: breaker states, index residency, cache occupancy.
    pub async fn status(&self) -> RegistryStatus {
        match self.services() {
            Some(services) => {
                let mut breakers = vec![
                    services.embedder.breaker().snapshot(),
                    services.vector_policy.breaker().snapshot(),
                    services.engine.rerank_breaker().snapshot(),
                ];
                breakers.extend(services.llm.breaker_snapshots());
                RegistryStatus {
                    initialized: true,
                    breakers,
                    bm25_loaded_kbs: services.bm25.loaded_kbs().await,
                    embedding_cache_entries: services.embedder.cache_len(),
                    degraded_searches: services.degradation.degraded_search_count(),
                    degraded_completions: services.degradation.degraded_completion_count(),
                    telemetry: services.telemetry.snapshot(),
                }
            }
            None => RegistryStatus {
                initialized: false,
                breakers: vec![],
                bm25_loaded_kbs: vec![],
                embedding_cache_entries: 0,
                degraded_searches: 0,
                degraded_completions: 0,
                telemetry: Telemetry::new().snapshot(),
            },
        }
    }

    /// Operator override: close the breaker for a service key
    /// (`embedding`, `vector_store`, `rerank`, or `llm.<provider>`).
    pub fn reset_circuit(&self, service_key: &str) -> bool {
        let services = match self.services() {
            Some(services) => services,
            None => return false,
        };
        match service_key {
            "embedding" => {
                services.embedder.breaker().reset();
                true
            }
            "vector_store" => {
                services.vector_policy.breaker().reset();
                true
            }
            "rerank" => {
                services.engine.rerank_breaker().reset();
                true
            }
            key => match key.strip_prefix("llm.") {
                Some(provider) => services.llm.reset_circuit(provider),
                None => false,
            },
        }
    }

    /// Operator override: force a breaker open.
    pub fn force_open(&self, service_key: &str) -> bool {
        let services = match self.services() {
            Some(services) => services,
            None => return false,
        };
        match service_key {
            "embedding" => {
                services.embedder.breaker().force_open();
                true
            }
            "vector_store" => {
                services.vector_policy.breaker().force_open();
                true
            }
            "rerank" => {
                services.engine.rerank_breaker().force_open();
                true
            }
            _ => false,
        }
    }
}
