use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

use crate::bm25::{Bm25Doc, Bm25IndexManager};
use crate::embedding::ResilientEmbedder;
use crate::error::{classify_backend, CoreError, CoreResult};
use crate::models::{ChunkRecord, DocumentStatus, KnowledgeBase, NewChunk};
use crate::repository::{collect_all_chunks, Repository};
use crate::resilience::ResiliencePolicy;
use crate::vector_store::{chunk_metadata, VectorStoreBackend};

/// Outcome of ingesting one document's chunk set.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub doc_id: String,
    pub chunk_count: usize,
    pub token_count: i64,
}

/// Outcome of a reconciliation pass over one knowledge base.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub kb_id: String,
    pub vectors_readded: usize,
    pub vectors_purged: usize,
    pub bm25_readded: usize,
    pub bm25_purged: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.vectors_readded == 0
            && self.vectors_purged == 0
            && self.bm25_readded == 0
            && self.bm25_purged == 0
    }
}

/// Commits a document's chunks to the repository, the vector store, and the
/// BM25 index, in that order. Failures between steps leave the repository
/// authoritative; `reconcile` re-derives the other two from it.
pub struct IngestionPipeline {
    repository: Arc<dyn Repository>,
    vector_store: Arc<dyn VectorStoreBackend>,
    vector_policy: Arc<ResiliencePolicy>,
    embedder: Arc<ResilientEmbedder>,
    bm25: Arc<Bm25IndexManager>,
}

impl IngestionPipeline {
    pub fn new(
        repository: Arc<dyn Repository>,
        vector_store: Arc<dyn VectorStoreBackend>,
        vector_policy: Arc<ResiliencePolicy>,
        embedder: Arc<ResilientEmbedder>,
        bm25: Arc<Bm25IndexManager>,
    ) -> Self {
        Self {
            repository,
            vector_store,
            vector_policy,
            embedder,
            bm25,
        }
    }

    /// Ingest one document's chunks. The document must already exist with
    /// status `pending`; on success it is `completed` with counts recorded,
    /// on failure `failed`.
    pub async fn ingest_document(
        &self,
        kb: &KnowledgeBase,
        doc_id: &str,
        chunks: Vec<NewChunk>,
    ) -> CoreResult<IngestReport> {
        if kb.embedding_model != self.embedder.model_name() {
            return Err(CoreError::Internal(anyhow::anyhow!(
                "knowledge base {} is bound to embedding model {}, process runs {}",
                kb.id,
                kb.embedding_model,
                self.embedder.model_name()
            )));
        }

        self.repository
            .update_document_status(doc_id, DocumentStatus::Processing, None, None)
            .await
            .map_err(|e| CoreError::upstream("repository", e))?;

        match self.commit_chunks(kb, &chunks).await {
            Ok(inserted) => {
                let token_count: i64 = inserted.iter().map(|c| c.token_count as i64).sum();
                self.repository
                    .update_document_status(
                        doc_id,
                        DocumentStatus::Completed,
                        Some(inserted.len() as i32),
                        Some(token_count),
                    )
                    .await
                    .map_err(|e| CoreError::upstream("repository", e))?;
                info!("ingested {doc_id}: {} chunks", inserted.len());
                Ok(IngestReport {
                    doc_id: doc_id.to_string(),
                    chunk_count: inserted.len(),
                    token_count,
                })
            }
            Err(err) => {
                warn!("ingestion of {doc_id} failed: {err}");
                if let Err(status_err) = self
                    .repository
                    .update_document_status(doc_id, DocumentStatus::Failed, None, None)
                    .await
                {
                    warn!("could not mark {doc_id} failed: {status_err}");
                }
                Err(err)
            }
        }
    }

    /// Repository commit happens-before vector upsert happens-before BM25
    /// upsert.
    async fn commit_chunks(
        &self,
        kb: &KnowledgeBase,
        chunks: &[NewChunk],
    ) -> CoreResult<Vec<ChunkRecord>> {
        let inserted = self
            .repository
            .insert_chunks(chunks)
            .await
            .map_err(|e| CoreError::upstream("repository", e))?;

        self.push_downstream(kb, &inserted).await?;
        Ok(inserted)
    }

    /// Embed and push chunks into the vector store, then BM25.
    async fn push_downstream(
        &self,
        kb: &KnowledgeBase,
        records: &[ChunkRecord],
    ) -> CoreResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = records.iter().map(|c| c.content.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;

        let collection = kb.collection_name();
        let dim = self.embedder.dimensions();
        self.vector_policy
            .call(|| async {
                self.vector_store
                    .create_collection(&collection, dim)
                    .await
                    .map_err(|e| classify_backend("vector_store", e))
            })
            .await?;

        let ids: Vec<String> = records.iter().map(|c| c.vector_id.clone()).collect();
        let metadatas: Vec<_> = records.iter().map(chunk_metadata).collect();
        self.vector_policy
            .call(|| async {
                self.vector_store
                    .upsert(&collection, &ids, &vectors, &metadatas)
                    .await
                    .map_err(|e| classify_backend("vector_store", e))
            })
            .await?;

        let docs: Vec<Bm25Doc> = records.iter().map(Bm25Doc::from_chunk).collect();
        self.bm25.upsert(&kb.id, &docs).await;
        Ok(())
    }

    /// Remove a document everywhere: repository first, then vectors, then
    /// BM25 postings.
    pub async fn delete_document(&self, kb: &KnowledgeBase, doc_id: &str) -> CoreResult<usize> {
        let removed = self
            .repository
            .delete_chunks_by_doc(doc_id)
            .await
            .map_err(|e| CoreError::upstream("repository", e))?;
        if removed.is_empty() {
            return Ok(0);
        }

        let collection = kb.collection_name();
        let vector_ids: Vec<String> = removed.iter().map(|c| c.vector_id.clone()).collect();
        self.vector_policy
            .call(|| async {
                self.vector_store
                    .delete_by_ids(&collection, &vector_ids)
                    .await
                    .map_err(|e| classify_backend("vector_store", e))
            })
            .await?;

        let chunk_ids: Vec<String> = removed.iter().map(|c| c.id.clone()).collect();
        self.bm25.delete(&kb.id, &chunk_ids).await;
        info!("deleted document {doc_id}: {} chunks", removed.len());
        Ok(removed.len())
    }

    /// KB deletion cascade for derived state: drops the vector collection
    /// and the BM25 index (memory + disk). Repository rows are the owning
    /// service's transaction.
    pub async fn purge_kb(&self, kb: &KnowledgeBase) -> CoreResult<()> {
        let collection = kb.collection_name();
        self.vector_policy
            .call(|| async {
                self.vector_store
                    .delete_collection(&collection)
                    .await
                    .map_err(|e| classify_backend("vector_store", e))
            })
            .await?;
        self.bm25
            .remove_kb(&kb.id)
            .await
            .map_err(CoreError::Internal)?;
        info!("purged derived state for KB {}", kb.id);
        Ok(())
    }

    /// Align the vector store and BM25 index of one KB with the repository:
    /// chunks present in the repository but missing downstream are re-added
    /// (re-embedding as needed); downstream entries with no repository chunk
    /// are purged.
    pub async fn reconcile(&self, kb: &KnowledgeBase) -> CoreResult<ReconcileReport> {
        let mut report = ReconcileReport {
            kb_id: kb.id.clone(),
            ..Default::default()
        };

        let chunks = collect_all_chunks(self.repository.as_ref(), &kb.id)
            .await
            .map_err(|e| CoreError::upstream("repository", e))?;
        let by_vector_id: HashMap<&str, &ChunkRecord> =
            chunks.iter().map(|c| (c.vector_id.as_str(), c)).collect();
        let chunk_ids: HashSet<&str> = chunks.iter().map(|c| c.id.as_str()).collect();

        // Vector store diff.
        let collection = kb.collection_name();
        let dim = self.embedder.dimensions();
        self.vector_policy
            .call(|| async {
                self.vector_store
                    .create_collection(&collection, dim)
                    .await
                    .map_err(|e| classify_backend("vector_store", e))
            })
            .await?;
        let stored: HashSet<String> = self
            .vector_policy
            .call(|| async {
                self.vector_store
                    .list_ids(&collection)
                    .await
                    .map_err(|e| classify_backend("vector_store", e))
            })
            .await?
            .into_iter()
            .collect();

        let missing: Vec<&ChunkRecord> = chunks
            .iter()
            .filter(|c| !stored.contains(&c.vector_id))
            .collect();
        if !missing.is_empty() {
            let records: Vec<ChunkRecord> = missing.into_iter().cloned().collect();
            self.push_vectors_only(kb, &records).await?;
            report.vectors_readded = records.len();
        }

        let orphans: Vec<String> = stored
            .iter()
            .filter(|id| !by_vector_id.contains_key(id.as_str()))
            .cloned()
            .collect();
        if !orphans.is_empty() {
            self.vector_policy
                .call(|| async {
                    self.vector_store
                        .delete_by_ids(&collection, &orphans)
                        .await
                        .map_err(|e| classify_backend("vector_store", e))
                })
                .await?;
            report.vectors_purged = orphans.len();
        }

        // BM25 diff.
        self.bm25
            .get_or_build(&kb.id, self.repository.as_ref())
            .await?;
        let indexed: HashSet<String> = self
            .bm25
            .chunk_ids(&kb.id)
            .await
            .unwrap_or_default()
            .into_iter()
            .collect();

        let missing_bm25: Vec<Bm25Doc> = chunks
            .iter()
            .filter(|c| !indexed.contains(&c.id))
            .map(Bm25Doc::from_chunk)
            .collect();
        if !missing_bm25.is_empty() {
            report.bm25_readded = missing_bm25.len();
            self.bm25.upsert(&kb.id, &missing_bm25).await;
        }

        let orphaned_bm25: Vec<String> = indexed
            .into_iter()
            .filter(|id| !chunk_ids.contains(id.as_str()))
            .collect();
        if !orphaned_bm25.is_empty() {
            report.bm25_purged = orphaned_bm25.len();
            self.bm25.delete(&kb.id, &orphaned_bm25).await;
        }

        if !report.is_clean() {
            info!(
                "reconciled KB {}: vectors +{}/-{}, bm25 +{}/-{}",
                kb.id,
                report.vectors_readded,
                report.vectors_purged,
                report.bm25_readded,
                report.bm25_purged
            );
        }
        Ok(report)
    }

    /// Reconcile every active KB. Runs at startup and on demand.
    pub async fn reconcile_all(&self) -> CoreResult<Vec<ReconcileReport>> {
        let kbs = self
            .repository
            .list_active_kbs()
            .await
            .map_err(|e| CoreError::upstream("repository", e))?;
        let mut reports = Vec::with_capacity(kbs.len());
        for kb in kbs {
            reports.push(self.reconcile(&kb).await?);
        }
        Ok(reports)
    }

    /// Vector-store half of `push_downstream`, used by reconciliation so a
    /// BM25-complete chunk is not re-upserted there.
    async fn push_vectors_only(
        &self,
        kb: &KnowledgeBase,
        records: &[ChunkRecord],
    ) -> CoreResult<()> {
        let texts: Vec<String> = records.iter().map(|c| c.content.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;
        let collection = kb.collection_name();
        let ids: Vec<String> = records.iter().map(|c| c.vector_id.clone()).collect();
        let metadatas: Vec<_> = records.iter().map(chunk_metadata).collect();
        self.vector_policy
            .call(|| async {
                self.vector_store
                    .upsert(&collection, &ids, &vectors, &metadatas)
                    .await
                    .map_err(|e| classify_backend("vector_store", e))
            })
            .await?;
        Ok(())
    }
}
