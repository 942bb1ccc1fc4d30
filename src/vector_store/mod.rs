pub mod memory;
pub mod pgvector;

use async_trait::async_trait;
use std::collections::HashMap;

/// One match from a similarity search. `score` is a cosine-style similarity,
/// higher is better.
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub id: String,
    pub score: f64,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Abstract vector-store backend. Collections are addressed by name
/// (`kb_<kb_id>` per KB); ids are the repository's canonical `vector_id`s.
#[async_trait]
pub trait VectorStoreBackend: Send + Sync {
    /// Create a collection for vectors of the given dimension. Idempotent.
    async fn create_collection(&self, name: &str, dim: usize) -> anyhow::Result<()>;

    /// Drop a collection and everything in it.
    async fn delete_collection(&self, name: &str) -> anyhow::Result<()>;

    /// Insert or replace vectors. `ids`, `vectors` and `metadatas` are
    /// parallel slices.
    async fn upsert(
        &self,
        collection: &str,
        ids: &[String],
        vectors: &[Vec<f32>],
        metadatas: &[HashMap<String, serde_json::Value>],
    ) -> anyhow::Result<()>;

    /// Top-k nearest vectors. `filter` matches on metadata equality.
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        top_k: usize,
        filter: Option<&HashMap<String, serde_json::Value>>,
    ) -> anyhow::Result<Vec<VectorMatch>>;

    /// Delete vectors by id.
    async fn delete_by_ids(&self, collection: &str, ids: &[String]) -> anyhow::Result<()>;

    /// All ids stored in a collection. Used by reconciliation to diff the
    /// store against the repository.
    async fn list_ids(&self, collection: &str) -> anyhow::Result<Vec<String>>;
}

/// Metadata keys the retrieval pipeline writes alongside each vector.
pub mod meta {
    pub const CHUNK_ID: &str = "chunk_id";
    pub const DOC_ID: &str = "doc_id";
    pub const KB_ID: &str = "kb_id";
    pub const CHUNK_INDEX: &str = "chunk_index";
    pub const CONTENT: &str = "content";
    pub const PAGE: &str = "page";
    pub const SECTION_TITLE: &str = "section_title";
}

/// Build the metadata map stored with a chunk's vector.
pub fn chunk_metadata(chunk: &crate::models::ChunkRecord) -> HashMap<String, serde_json::Value> {
    let mut map = HashMap::new();
    map.insert(meta::CHUNK_ID.to_string(), serde_json::json!(chunk.id));
    map.insert(meta::DOC_ID.to_string(), serde_json::json!(chunk.doc_id));
    map.insert(meta::KB_ID.to_string(), serde_json::json!(chunk.kb_id));
    map.insert(meta::CHUNK_INDEX.to_string(), serde_json::json!(chunk.index));
    map.insert(meta::CONTENT.to_string(), serde_json::json!(chunk.content));
    if let Some(page) = chunk.page {
        map.insert(meta::PAGE.to_string(), serde_json::json!(page));
    }
    if let Some(section) = &chunk.section_title {
        map.insert(meta::SECTION_TITLE.to_string(), serde_json::json!(section));
    }
    map
}
