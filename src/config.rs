use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ──────────────────────────── TOML structure ────────────────────────────

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub bm25: Bm25Config,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub rewrite: RewriteConfig,
    #[serde(default)]
    pub resilience: ResilienceSection,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_max_upstream_calls")]
    pub max_upstream_calls_per_request: usize,
    #[serde(default = "default_request_timeout_s")]
    pub request_timeout_s: u64,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

fn default_max_concurrent_requests() -> usize {
    64
}
fn default_max_upstream_calls() -> usize {
    8
}
fn default_request_timeout_s() -> u64 {
    30
}
fn default_state_dir() -> String {
    "./state".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: default_max_concurrent_requests(),
            max_upstream_calls_per_request: default_max_upstream_calls(),
            request_timeout_s: default_request_timeout_s(),
            state_dir: default_state_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RepositoryConfig {
    #[serde(default = "default_provider_postgres")]
    pub provider: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_provider_postgres() -> String {
    "postgres".to_string()
}
fn default_pool_size() -> u32 {
    10
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            provider: default_provider_postgres(),
            pool_size: default_pool_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorStoreConfig {
    #[serde(default = "default_vector_provider")]
    pub provider: String,
    #[serde(default = "default_ivfflat_probes")]
    pub ivfflat_probes: u32,
}

fn default_vector_provider() -> String {
    "pgvector".to_string()
}
fn default_ivfflat_probes() -> u32 {
    100
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            provider: default_vector_provider(),
            ivfflat_probes: default_ivfflat_probes(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_cache_max")]
    pub cache_max: usize,
    #[serde(default = "default_embed_batch_size")]
    pub batch_size: usize,
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_dimensions() -> usize {
    1536
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_cache_max() -> usize {
    10_000
}
fn default_embed_batch_size() -> usize {
    100
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            dimensions: default_dimensions(),
            base_url: None,
            api_key_env: default_api_key_env(),
            cache_max: default_cache_max(),
            batch_size: default_embed_batch_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_rerank_model")]
    pub model: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_rerank_model() -> String {
    "BAAI/bge-reranker-base".to_string()
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: default_rerank_model(),
            endpoint: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LlmConfig {
    /// Failover order. Providers not listed here are never tried.
    #[serde(default)]
    pub provider_priority: Vec<String>,
    #[serde(default)]
    pub providers: HashMap<String, LlmProviderConfig>,
    #[serde(default = "default_llm_max_tokens")]
    pub default_max_tokens: u32,
    #[serde(default = "default_llm_temperature")]
    pub default_temperature: f64,
}

fn default_llm_max_tokens() -> u32 {
    1000
}
fn default_llm_temperature() -> f64 {
    0.3
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmProviderConfig {
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Bm25Config {
    #[serde(default)]
    pub persist_dir: Option<String>,
    #[serde(default = "default_flush_interval_s")]
    pub flush_interval_s: u64,
    #[serde(default = "default_write_batch_size")]
    pub write_batch_size: usize,
    #[serde(default = "default_k1")]
    pub k1: f64,
    #[serde(default = "default_b")]
    pub b: f64,
}

fn default_flush_interval_s() -> u64 {
    60
}
fn default_write_batch_size() -> usize {
    256
}
fn default_k1() -> f64 {
    1.5
}
fn default_b() -> f64 {
    0.75
}

impl Default for Bm25Config {
    fn default() -> Self {
        Self {
            persist_dir: None,
            flush_interval_s: default_flush_interval_s(),
            write_batch_size: default_write_batch_size(),
            k1: default_k1(),
            b: default_b(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_alpha")]
    pub default_alpha: f64,
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    #[serde(default = "default_rerank_batch_cap")]
    pub rerank_batch_cap: usize,
    #[serde(default)]
    pub min_score: f64,
}

fn default_alpha() -> f64 {
    0.5
}
fn default_top_k() -> usize {
    10
}
fn default_rerank_batch_cap() -> usize {
    50
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_alpha: default_alpha(),
            default_top_k: default_top_k(),
            rerank_batch_cap: default_rerank_batch_cap(),
            min_score: 0.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RewriteConfig {
    #[serde(default = "default_max_history_turns")]
    pub max_history_turns: usize,
    #[serde(default = "default_max_variations")]
    pub max_variations: usize,
    #[serde(default = "default_true")]
    pub enable_expansion: bool,
}

fn default_max_history_turns() -> usize {
    5
}
fn default_max_variations() -> usize {
    3
}
fn default_true() -> bool {
    true
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            max_history_turns: default_max_history_turns(),
            max_variations: default_max_variations(),
            enable_expansion: default_true(),
        }
    }
}

/// `[resilience.default]` plus per-service overrides keyed by service name
/// (`embedding`, `vector_store`, `rerank`, `llm.<provider>`).
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ResilienceSection {
    #[serde(default)]
    pub default: ResilienceConfig,
    #[serde(flatten)]
    pub services: HashMap<String, ResilienceConfig>,
}

impl ResilienceSection {
    /// Resolve the effective config for a service key, falling back to the
    /// section default for any unset field.
    pub fn for_service(&self, key: &str) -> ResilienceConfig {
        match self.services.get(key) {
            Some(overrides) => overrides.merged_over(&self.default),
            None => self.default.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub failure_threshold: Option<u32>,
    #[serde(default)]
    pub success_threshold: Option<u32>,
    #[serde(default)]
    pub recovery_timeout_s: Option<f64>,
    #[serde(default)]
    pub half_open_max_concurrent: Option<usize>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub base_delay_s: Option<f64>,
    #[serde(default)]
    pub max_delay_s: Option<f64>,
    #[serde(default)]
    pub backoff_base: Option<f64>,
    #[serde(default)]
    pub jitter: Option<f64>,
    #[serde(default)]
    pub timeout_s: Option<f64>,
}

impl ResilienceConfig {
    fn merged_over(&self, base: &ResilienceConfig) -> ResilienceConfig {
        ResilienceConfig {
            failure_threshold: self.failure_threshold.or(base.failure_threshold),
            success_threshold: self.success_threshold.or(base.success_threshold),
            recovery_timeout_s: self.recovery_timeout_s.or(base.recovery_timeout_s),
            half_open_max_concurrent: self.half_open_max_concurrent.or(base.half_open_max_concurrent),
            max_retries: self.max_retries.or(base.max_retries),
            base_delay_s: self.base_delay_s.or(base.base_delay_s),
            max_delay_s: self.max_delay_s.or(base.max_delay_s),
            backoff_base: self.backoff_base.or(base.backoff_base),
            jitter: self.jitter.or(base.jitter),
            timeout_s: self.timeout_s.or(base.timeout_s),
        }
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold.unwrap_or(5)
    }
    pub fn success_threshold(&self) -> u32 {
        self.success_threshold.unwrap_or(3)
    }
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.recovery_timeout_s.unwrap_or(60.0))
    }
    pub fn half_open_max_concurrent(&self) -> usize {
        self.half_open_max_concurrent.unwrap_or(3)
    }
    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(3)
    }
    pub fn base_delay(&self) -> Duration {
        Duration::from_secs_f64(self.base_delay_s.unwrap_or(1.0))
    }
    pub fn max_delay(&self) -> Duration {
        Duration::from_secs_f64(self.max_delay_s.unwrap_or(30.0))
    }
    pub fn backoff_base(&self) -> f64 {
        self.backoff_base.unwrap_or(2.0)
    }
    pub fn jitter(&self) -> f64 {
        self.jitter.unwrap_or(0.5).clamp(0.0, 1.0)
    }
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_s.unwrap_or(30.0))
    }
}

// ──────────────────────────── Resolved Settings ────────────────────────────

/// Settings resolved from TOML + environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub service: ServiceConfig,
    pub repository: RepositoryConfig,
    pub vector_store: VectorStoreConfig,
    pub embedding: EmbeddingConfig,
    pub rerank: RerankConfig,
    pub llm: LlmConfig,
    pub bm25: Bm25Config,
    pub retrieval: RetrievalConfig,
    pub rewrite: RewriteConfig,
    pub resilience: ResilienceSection,
    /// From `POSTGRES_URI`; empty when the in-memory repository is selected.
    pub postgres_uri: String,
}

impl Settings {
    /// Directory holding `<kb_id>.idx` BM25 files.
    pub fn bm25_dir(&self) -> PathBuf {
        match &self.bm25.persist_dir {
            Some(dir) => PathBuf::from(dir),
            None => Path::new(&self.service.state_dir).join("bm25"),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.service.request_timeout_s)
    }

    pub fn bm25_flush_interval(&self) -> Duration {
        Duration::from_secs(self.bm25.flush_interval_s)
    }
}

/// Load settings from a TOML file plus environment.
pub fn load_settings_from_path(path: impl AsRef<Path>) -> anyhow::Result<Settings> {
    // Load .env if present (ignore errors).
    let _ = dotenvy::dotenv();

    let content = std::fs::read_to_string(path.as_ref())?;
    let config: TomlConfig = toml::from_str(&content)?;
    resolve(config)
}

/// Build settings from an already-parsed config. Useful for tests and for
/// collaborators that assemble configuration themselves.
pub fn resolve(config: TomlConfig) -> anyhow::Result<Settings> {
    let needs_postgres =
        config.repository.provider == "postgres" || config.vector_store.provider == "pgvector";

    let postgres_uri = match std::env::var("POSTGRES_URI") {
        Ok(uri) => uri,
        Err(_) if needs_postgres => {
            anyhow::bail!("POSTGRES_URI environment variable is required for postgres/pgvector providers")
        }
        Err(_) => String::new(),
    };

    for key in &config.llm.provider_priority {
        if !config.llm.providers.contains_key(key) {
            anyhow::bail!("llm.provider_priority references unknown provider '{key}'");
        }
    }

    Ok(Settings {
        service: config.service,
        repository: config.repository,
        vector_store: config.vector_store,
        embedding: config.embedding,
        rerank: config.rerank,
        llm: config.llm,
        bm25: config.bm25,
        retrieval: config.retrieval,
        rewrite: config.rewrite,
        resilience: config.resilience,
        postgres_uri,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn memory_toml() -> &'static str {
        r#"
[repository]
provider = "memory"

[vector_store]
provider = "memory"

[embedding]
model = "text-embedding-3-small"
dimensions = 1536

[retrieval]
default_alpha = 0.7
default_top_k = 20

[bm25]
persist_dir = "/tmp/kb-idx"
flush_interval_s = 30

[resilience.default]
failure_threshold = 5
max_retries = 3

[resilience.embedding]
failure_threshold = 2
"#
    }

    #[test]
    fn test_parse_memory_config() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(memory_toml().as_bytes()).unwrap();
        let settings = load_settings_from_path(tmp.path()).unwrap();

        assert_eq!(settings.repository.provider, "memory");
        assert_eq!(settings.retrieval.default_alpha, 0.7);
        assert_eq!(settings.retrieval.default_top_k, 20);
        assert_eq!(settings.bm25.flush_interval_s, 30);
        assert_eq!(settings.bm25_dir(), PathBuf::from("/tmp/kb-idx"));
    }

    #[test]
    fn test_resilience_override_merging() {
        let config: TomlConfig = toml::from_str(memory_toml()).unwrap();
        let settings = resolve(config).unwrap();

        let embedding = settings.resilience.for_service("embedding");
        // Overridden per-service.
        assert_eq!(embedding.failure_threshold(), 2);
        // Inherited from [resilience.default].
        assert_eq!(embedding.max_retries(), 3);

        let rerank = settings.resilience.for_service("rerank");
        assert_eq!(rerank.failure_threshold(), 5);
    }

    #[test]
    fn test_defaults_without_file_sections() {
        let config: TomlConfig = toml::from_str(
            r#"
[repository]
provider = "memory"

[vector_store]
provider = "memory"
"#,
        )
        .unwrap();
        let settings = resolve(config).unwrap();

        assert_eq!(settings.service.max_concurrent_requests, 64);
        assert_eq!(settings.embedding.cache_max, 10_000);
        assert_eq!(settings.retrieval.rerank_batch_cap, 50);
        assert_eq!(settings.rewrite.max_history_turns, 5);
        assert_eq!(settings.bm25_dir(), Path::new("./state").join("bm25"));
    }

    #[test]
    fn test_priority_must_reference_known_provider() {
        let config: TomlConfig = toml::from_str(
            r#"
[repository]
provider = "memory"

[vector_store]
provider = "memory"

[llm]
provider_priority = ["missing"]
"#,
        )
        .unwrap();
        assert!(resolve(config).is_err());
    }
}
