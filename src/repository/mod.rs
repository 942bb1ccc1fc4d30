pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::models::{ChunkRecord, Document, DocumentStatus, KnowledgeBase, NewChunk};

/// Abstract repository interface for knowledge-base metadata and chunks.
///
/// The repository is the source of truth: the vector store and BM25 indexes
/// are derived state reconciled against it.
#[async_trait]
pub trait Repository: Send + Sync {
    /// All active knowledge bases.
    async fn list_active_kbs(&self) -> anyhow::Result<Vec<KnowledgeBase>>;

    /// Fetch a knowledge base by id.
    async fn get_kb(&self, id: &str) -> anyhow::Result<Option<KnowledgeBase>>;

    /// Chunks belonging to `completed` documents of a KB, paginated by
    /// `(offset, limit)` in insertion order.
    async fn list_chunks(&self, kb_id: &str, offset: i64, limit: i64)
        -> anyhow::Result<Vec<ChunkRecord>>;

    /// Fetch a document by id.
    async fn get_document(&self, id: &str) -> anyhow::Result<Option<Document>>;

    /// Advance a document's status, optionally recording counts.
    async fn update_document_status(
        &self,
        id: &str,
        status: DocumentStatus,
        chunk_count: Option<i32>,
        token_count: Option<i64>,
    ) -> anyhow::Result<()>;

    /// Insert chunks in one transaction. The repository mints each chunk's
    /// `id` and its canonical `vector_id`; the returned records carry both.
    async fn insert_chunks(&self, chunks: &[NewChunk]) -> anyhow::Result<Vec<ChunkRecord>>;

    /// Delete all chunks of a document in one transaction. Returns the
    /// removed records so callers can purge the vector store (by
    /// `vector_id`) and the BM25 index (by chunk `id`).
    async fn delete_chunks_by_doc(&self, doc_id: &str) -> anyhow::Result<Vec<ChunkRecord>>;
}

/// Page size used when streaming a KB's chunks (index rebuilds,
/// reconciliation).
pub const CHUNK_PAGE_SIZE: i64 = 512;

/// Collect every chunk of a KB by walking pages.
pub async fn collect_all_chunks(
    repo: &dyn Repository,
    kb_id: &str,
) -> anyhow::Result<Vec<ChunkRecord>> {
    let mut all = Vec::new();
    let mut offset = 0i64;
    loop {
        let page = repo.list_chunks(kb_id, offset, CHUNK_PAGE_SIZE).await?;
        let fetched = page.len() as i64;
        all.extend(page);
        if fetched < CHUNK_PAGE_SIZE {
            return Ok(all);
        }
        offset += fetched;
    }
}
