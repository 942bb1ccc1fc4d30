//! Retrieval core for a multi-tenant knowledge-base service.
//!
//! Given a natural-language query and a set of knowledge-base ids, the core
//! returns a ranked list of text fragments by fusing dense vector similarity
//! with a per-KB BM25 index, optionally reranking with a cross-encoder,
//! rewriting follow-up queries from conversation history, and attributing /
//! compressing results for answer generation. Every external dependency
//! (embedding, vector store, rerank, LLM providers) is called through a
//! circuit-breaker + retry + failover policy with graceful degradation.
//!
//! The HTTP surface, auth, and document parsing live in collaborator
//! services; they construct a [`registry::ServiceRegistry`] and drive the
//! engine and pipeline through it.

pub mod attribution;
pub mod bm25;
pub mod compression;
pub mod config;
pub mod embedding;
pub mod error;
pub mod ingestion;
pub mod llm;
pub mod models;
pub mod registry;
pub mod repository;
pub mod rerank;
pub mod resilience;
pub mod retrieval;
pub mod rewrite;
pub mod telemetry;
pub mod text;
pub mod vector_store;

pub use config::{load_settings_from_path, Settings};
pub use error::{CoreError, CoreResult};
pub use models::{
    ChunkRecord, ConversationTurn, Document, DocumentStatus, KnowledgeBase, NewChunk,
    RewriteResult, SearchHit, SearchMode, SearchOptions, SearchResponse,
};
pub use registry::{BackendOverrides, ServiceRegistry, Services};
