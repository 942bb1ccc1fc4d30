//! Shared fixtures: deterministic mock backends and a registry builder over
//! the in-memory repository and vector store.
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use kb_core::config::{self, TomlConfig};
use kb_core::embedding::EmbeddingModel;
use kb_core::llm::{CompletionModel, CompletionResult, Message};
use kb_core::models::{Document, DocumentStatus, KnowledgeBase, NewChunk};
use kb_core::registry::{BackendOverrides, ServiceRegistry, Services};
use kb_core::repository::memory::MemoryRepository;
use kb_core::rerank::Reranker;
use kb_core::text::word_set;
use kb_core::vector_store::memory::MemoryVectorStore;
use kb_core::Settings;

pub const EMBED_DIMS: usize = 64;
pub const EMBED_MODEL: &str = "mock-embed";

/// Deterministic "semantic" embedding: a hashed bag of lightly-stemmed
/// words, so texts sharing words get high cosine similarity.
pub struct HashEmbedder;

pub fn hash_embed(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBED_DIMS];
    for word in word_set(text) {
        let stemmed = word.strip_suffix('s').unwrap_or(&word);
        let mut h = 0usize;
        for b in stemmed.bytes() {
            h = h.wrapping_mul(131).wrapping_add(b as usize);
        }
        v[h % EMBED_DIMS] += 1.0;
    }
    v
}

#[async_trait]
impl EmbeddingModel for HashEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| hash_embed(t)).collect())
    }

    async fn embed_text(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(hash_embed(text))
    }

    fn dimensions(&self) -> usize {
        EMBED_DIMS
    }

    fn model_name(&self) -> &str {
        EMBED_MODEL
    }
}

/// LLM stub answering with a fixed reply, or failing when `reply` is None.
pub struct ScriptedLlm {
    pub reply: Option<String>,
    pub calls: AtomicU32,
}

impl ScriptedLlm {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Some(reply.to_string()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl CompletionModel for ScriptedLlm {
    async fn complete(
        &self,
        _messages: &[Message],
        _max_tokens: Option<u32>,
        _temperature: Option<f64>,
    ) -> anyhow::Result<CompletionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.reply {
            Some(reply) => Ok(CompletionResult {
                content: reply.clone(),
                usage: None,
                provider: String::new(),
            }),
            None => anyhow::bail!("scripted failure"),
        }
    }

    async fn complete_stream(
        &self,
        _messages: &[Message],
        _max_tokens: Option<u32>,
        _temperature: Option<f64>,
    ) -> anyhow::Result<tokio::sync::mpsc::Receiver<String>> {
        anyhow::bail!("streaming not scripted")
    }
}

/// Reranker scoring by lexical overlap with the query, deterministic.
pub struct OverlapReranker;

#[async_trait]
impl Reranker for OverlapReranker {
    async fn score(&self, query: &str, docs: &[String]) -> anyhow::Result<Vec<f64>> {
        Ok(docs
            .iter()
            .map(|doc| kb_core::text::overlap_ratio(query, doc) * 10.0)
            .collect())
    }

    fn model_name(&self) -> &str {
        "overlap-reranker"
    }
}

pub fn test_settings(bm25_dir: &std::path::Path) -> Settings {
    let toml = format!(
        r#"
[repository]
provider = "memory"

[vector_store]
provider = "memory"

[embedding]
model = "{EMBED_MODEL}"
dimensions = {EMBED_DIMS}

[bm25]
persist_dir = "{}"

[resilience.default]
max_retries = 0
base_delay_s = 0.001
jitter = 0.0
timeout_s = 5.0
"#,
        bm25_dir.display()
    );
    let config: TomlConfig = toml::from_str(&toml).unwrap();
    config::resolve(config).unwrap()
}

pub struct TestHarness {
    pub registry: ServiceRegistry,
    pub services: Arc<Services>,
    pub repo: Arc<MemoryRepository>,
    pub store: Arc<MemoryVectorStore>,
    #[allow(dead_code)]
    pub state_dir: tempfile::TempDir,
}

/// Build an initialized registry over in-memory backends, a hash embedder,
/// an overlap reranker, and the given LLM script.
pub async fn harness_with_llm(llm: Option<Arc<ScriptedLlm>>) -> TestHarness {
    let state_dir = tempfile::TempDir::new().unwrap();
    let settings = test_settings(state_dir.path());

    let repo = Arc::new(MemoryRepository::new());
    let store = Arc::new(MemoryVectorStore::new());

    let overrides = BackendOverrides {
        repository: Some(repo.clone()),
        vector_store: Some(store.clone()),
        embedding_model: Some(Arc::new(HashEmbedder)),
        reranker: Some(Arc::new(OverlapReranker)),
        llm_providers: llm.map(|l| {
            let model: Arc<dyn CompletionModel> = l;
            vec![("mock".to_string(), model)]
        }),
    };

    let registry = ServiceRegistry::new(settings);
    let services = registry.initialize_with(overrides).await.unwrap();

    TestHarness {
        registry,
        services,
        repo,
        store,
        state_dir,
    }
}

pub async fn harness() -> TestHarness {
    harness_with_llm(Some(Arc::new(ScriptedLlm::failing()))).await
}

pub fn make_kb(id: &str) -> KnowledgeBase {
    KnowledgeBase {
        id: id.to_string(),
        name: format!("KB {id}"),
        description: String::new(),
        embedding_model: EMBED_MODEL.to_string(),
        chunk_size: 512,
        chunk_overlap: 64,
        active: true,
    }
}

pub fn make_doc(id: &str, kb_id: &str) -> Document {
    Document {
        id: id.to_string(),
        kb_id: kb_id.to_string(),
        folder_id: None,
        filename: format!("{id}.txt"),
        status: DocumentStatus::Pending,
        chunk_count: 0,
        token_count: 0,
        version: 1,
    }
}

pub fn new_chunk(doc_id: &str, kb_id: &str, index: i32, content: &str) -> NewChunk {
    NewChunk {
        doc_id: doc_id.to_string(),
        kb_id: kb_id.to_string(),
        index,
        content: content.to_string(),
        token_count: kb_core::text::estimate_tokens(content) as i32,
        page: None,
        section_title: None,
    }
}

/// Insert a KB + document and run the ingestion pipeline over the contents.
pub async fn ingest(harness: &TestHarness, kb_id: &str, doc_id: &str, contents: &[&str]) {
    let kb = make_kb(kb_id);
    harness.repo.insert_kb(kb.clone());
    harness.repo.insert_document(make_doc(doc_id, kb_id));

    let chunks: Vec<NewChunk> = contents
        .iter()
        .enumerate()
        .map(|(i, content)| new_chunk(doc_id, kb_id, i as i32, content))
        .collect();

    harness
        .services
        .pipeline
        .ingest_document(&kb, doc_id, chunks)
        .await
        .unwrap();
}
