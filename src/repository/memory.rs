use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use crate::models::{ChunkRecord, Document, DocumentStatus, KnowledgeBase, NewChunk};

use super::Repository;

/// In-memory repository for tests and development.
pub struct MemoryRepository {
    kbs: RwLock<HashMap<String, KnowledgeBase>>,
    documents: RwLock<HashMap<String, Document>>,
    chunks: RwLock<Vec<ChunkRecord>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self {
            kbs: RwLock::new(HashMap::new()),
            documents: RwLock::new(HashMap::new()),
            chunks: RwLock::new(Vec::new()),
        }
    }

    pub fn insert_kb(&self, kb: KnowledgeBase) {
        self.kbs.write().unwrap().insert(kb.id.clone(), kb);
    }

    pub fn insert_document(&self, doc: Document) {
        self.documents.write().unwrap().insert(doc.id.clone(), doc);
    }

    pub fn remove_kb(&self, kb_id: &str) {
        self.kbs.write().unwrap().remove(kb_id);
        self.documents.write().unwrap().retain(|_, d| d.kb_id != kb_id);
        self.chunks.write().unwrap().retain(|c| c.kb_id != kb_id);
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn list_active_kbs(&self) -> anyhow::Result<Vec<KnowledgeBase>> {
        let kbs = self.kbs.read().unwrap();
        let mut active: Vec<KnowledgeBase> = kbs.values().filter(|kb| kb.active).cloned().collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(active)
    }

    async fn get_kb(&self, id: &str) -> anyhow::Result<Option<KnowledgeBase>> {
        Ok(self.kbs.read().unwrap().get(id).cloned())
    }

    async fn list_chunks(
        &self,
        kb_id: &str,
        offset: i64,
        limit: i64,
    ) -> anyhow::Result<Vec<ChunkRecord>> {
        let documents = self.documents.read().unwrap();
        let chunks = self.chunks.read().unwrap();
        Ok(chunks
            .iter()
            .filter(|c| {
                c.kb_id == kb_id
                    && documents
                        .get(&c.doc_id)
                        .is_some_and(|d| d.status == DocumentStatus::Completed)
            })
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn get_document(&self, id: &str) -> anyhow::Result<Option<Document>> {
        Ok(self.documents.read().unwrap().get(id).cloned())
    }

    async fn update_document_status(
        &self,
        id: &str,
        status: DocumentStatus,
        chunk_count: Option<i32>,
        token_count: Option<i64>,
    ) -> anyhow::Result<()> {
        let mut documents = self.documents.write().unwrap();
        let doc = documents
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("document {id} not found"))?;
        doc.status = status;
        if let Some(n) = chunk_count {
            doc.chunk_count = n;
        }
        if let Some(n) = token_count {
            doc.token_count = n;
        }
        Ok(())
    }

    async fn insert_chunks(&self, new_chunks: &[NewChunk]) -> anyhow::Result<Vec<ChunkRecord>> {
        let mut chunks = self.chunks.write().unwrap();
        let mut inserted = Vec::with_capacity(new_chunks.len());
        for chunk in new_chunks {
            let record = ChunkRecord {
                id: Uuid::new_v4().to_string(),
                doc_id: chunk.doc_id.clone(),
                kb_id: chunk.kb_id.clone(),
                index: chunk.index,
                content: chunk.content.clone(),
                token_count: chunk.token_count,
                page: chunk.page,
                section_title: chunk.section_title.clone(),
                vector_id: Uuid::new_v4().to_string(),
            };
            chunks.push(record.clone());
            inserted.push(record);
        }
        Ok(inserted)
    }

    async fn delete_chunks_by_doc(&self, doc_id: &str) -> anyhow::Result<Vec<ChunkRecord>> {
        let mut chunks = self.chunks.write().unwrap();
        let removed: Vec<ChunkRecord> = chunks
            .iter()
            .filter(|c| c.doc_id == doc_id)
            .cloned()
            .collect();
        chunks.retain(|c| c.doc_id != doc_id);
        Ok(removed)
    }
}
