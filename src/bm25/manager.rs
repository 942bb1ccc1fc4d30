use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Bm25Config;
use crate::error::{CoreError, CoreResult};
use crate::repository::{collect_all_chunks, Repository};

use super::store::{self, LoadError};
use super::{Bm25Doc, Bm25Index, Bm25Params};

/// A hit from the sparse index, self-contained for downstream fusion.
#[derive(Debug, Clone)]
pub struct SparseHit {
    pub chunk_id: String,
    pub doc_id: String,
    pub chunk_index: i32,
    pub content: String,
    pub page: Option<i32>,
    pub section_title: Option<String>,
    pub score: f64,
}

type SharedIndex = Arc<RwLock<Bm25Index>>;

/// Owns one BM25 index per knowledge base: builds them from the repository,
/// loads and persists `<persist_dir>/<kb_id>.idx` files, and serializes
/// concurrent access through a per-KB read-write lock.
pub struct Bm25IndexManager {
    persist_dir: PathBuf,
    params: Bm25Params,
    write_batch_size: usize,
    indexes: RwLock<HashMap<String, SharedIndex>>,
}

impl Bm25IndexManager {
    pub fn new(persist_dir: PathBuf, config: &Bm25Config) -> Self {
        Self {
            persist_dir,
            params: Bm25Params {
                k1: config.k1,
                b: config.b,
            },
            write_batch_size: config.write_batch_size.max(1),
            indexes: RwLock::new(HashMap::new()),
        }
    }

    fn index_path(&self, kb_id: &str) -> PathBuf {
        self.persist_dir.join(format!("{kb_id}.idx"))
    }

    async fn get(&self, kb_id: &str) -> Option<SharedIndex> {
        self.indexes.read().await.get(kb_id).cloned()
    }

    /// Whether an index for this KB is resident in memory.
    pub async fn has_index(&self, kb_id: &str) -> bool {
        self.indexes.read().await.contains_key(kb_id)
    }

    pub async fn loaded_kbs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.indexes.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Return the KB's index, loading from disk or rebuilding from the
    /// repository when it is not resident. Corrupt or version-mismatched
    /// files force a rebuild.
    pub async fn get_or_build(
        &self,
        kb_id: &str,
        repo: &dyn Repository,
    ) -> CoreResult<SharedIndex> {
        if let Some(index) = self.get(kb_id).await {
            return Ok(index);
        }

        let path = self.index_path(kb_id);
        let loaded = match store::read_from_path(&path).await {
            Ok(index) => {
                info!("loaded BM25 index for {kb_id}: {} chunks", index.len());
                Some(index)
            }
            Err(LoadError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(LoadError::VersionMismatch {
                found_format,
                found_tokenizer,
            }) => {
                info!(
                    "BM25 index for {kb_id} has stale versions (format {found_format}, \
                     tokenizer {found_tokenizer}); rebuilding"
                );
                None
            }
            Err(e) => {
                warn!("BM25 index for {kb_id} unreadable ({e}); rebuilding");
                None
            }
        };

        let index = match loaded {
            Some(index) => index,
            None => self.build_from_repository(kb_id, repo).await?,
        };

        let mut indexes = self.indexes.write().await;
        // Another task may have raced us here; keep the first one in.
        let entry = indexes
            .entry(kb_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(index)));
        Ok(entry.clone())
    }

    async fn build_from_repository(
        &self,
        kb_id: &str,
        repo: &dyn Repository,
    ) -> CoreResult<Bm25Index> {
        let chunks = collect_all_chunks(repo, kb_id)
            .await
            .map_err(|e| CoreError::upstream("repository", e))?;

        let mut index = Bm25Index::new(self.params);
        let docs: Vec<Bm25Doc> = chunks.iter().map(Bm25Doc::from_chunk).collect();
        for batch in docs.chunks(self.write_batch_size) {
            index.upsert(batch);
        }
        info!("built BM25 index for {kb_id} from repository: {} chunks", index.len());
        Ok(index)
    }

    /// Add or replace postings for the given chunks, creating the in-memory
    /// index if absent. Writes take the per-KB write lock in batches so
    /// searches interleave.
    pub async fn upsert(&self, kb_id: &str, docs: &[Bm25Doc]) {
        let index = {
            let mut indexes = self.indexes.write().await;
            indexes
                .entry(kb_id.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(Bm25Index::new(self.params))))
                .clone()
        };

        for batch in docs.chunks(self.write_batch_size) {
            let mut guard = index.write().await;
            guard.upsert(batch);
        }
    }

    /// Remove chunks from a KB's index. No-op when the index is not resident.
    pub async fn delete(&self, kb_id: &str, chunk_ids: &[String]) {
        if let Some(index) = self.get(kb_id).await {
            for batch in chunk_ids.chunks(self.write_batch_size) {
                let mut guard = index.write().await;
                guard.remove(batch);
            }
        }
    }

    /// Search a KB's index. Returns `None` when no index is resident for the
    /// KB, letting the caller apply its missing-sparse policy.
    pub async fn search(&self, kb_id: &str, query: &str, k: usize) -> Option<Vec<SparseHit>> {
        let index = self.get(kb_id).await?;
        let guard = index.read().await;
        let hits = guard
            .search(query, k)
            .into_iter()
            .filter_map(|(chunk_id, score)| {
                guard.doc(&chunk_id).map(|record| SparseHit {
                    chunk_id: chunk_id.clone(),
                    doc_id: record.doc_id.clone(),
                    chunk_index: record.chunk_index,
                    content: record.content.clone(),
                    page: record.page,
                    section_title: record.section_title.clone(),
                    score,
                })
            })
            .collect();
        Some(hits)
    }

    /// Chunk ids currently indexed for a KB.
    pub async fn chunk_ids(&self, kb_id: &str) -> Option<Vec<String>> {
        let index = self.get(kb_id).await?;
        let guard = index.read().await;
        Some(guard.chunk_ids())
    }

    /// Persist one KB's index regardless of its dirty state.
    pub async fn flush(&self, kb_id: &str) -> anyhow::Result<()> {
        let index = match self.get(kb_id).await {
            Some(index) => index,
            None => return Ok(()),
        };
        let path = self.index_path(kb_id);
        let mut guard = index.write().await;
        store::write_to_path(&path, &guard).await?;
        guard.mark_clean();
        Ok(())
    }

    /// Persist every dirty index. Returns the number flushed.
    pub async fn flush_dirty(&self) -> usize {
        let entries: Vec<(String, SharedIndex)> = {
            let indexes = self.indexes.read().await;
            indexes.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut flushed = 0;
        for (kb_id, index) in entries {
            let dirty = index.read().await.is_dirty();
            if !dirty {
                continue;
            }
            let path = self.index_path(&kb_id);
            let mut guard = index.write().await;
            match store::write_to_path(&path, &guard).await {
                Ok(()) => {
                    guard.mark_clean();
                    flushed += 1;
                }
                Err(e) => error!("failed to flush BM25 index for {kb_id}: {e}"),
            }
        }
        flushed
    }

    /// Load or rebuild the index of every active KB. Run at startup.
    pub async fn rebuild_all(&self, repo: &dyn Repository) -> CoreResult<usize> {
        let kbs = repo
            .list_active_kbs()
            .await
            .map_err(|e| CoreError::upstream("repository", e))?;
        let mut count = 0;
        for kb in kbs {
            self.get_or_build(&kb.id, repo).await?;
            count += 1;
        }
        info!("BM25 startup pass complete: {count} knowledge bases");
        Ok(count)
    }

    /// Drop a KB's index from memory and disk (KB deletion cascade).
    pub async fn remove_kb(&self, kb_id: &str) -> anyhow::Result<()> {
        self.indexes.write().await.remove(kb_id);
        let path = self.index_path(kb_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Spawn the periodic flush loop. The handle is aborted at shutdown
    /// after a final `flush_dirty`.
    pub fn spawn_flush_task(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let flushed = manager.flush_dirty().await;
                if flushed > 0 {
                    info!("periodic BM25 flush: {flushed} indexes");
                }
            }
        })
    }
}
