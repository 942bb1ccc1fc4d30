pub mod manager;
pub mod store;
pub mod tokenizer;

pub use manager::{Bm25IndexManager, SparseHit};
pub use tokenizer::TOKENIZER_VERSION;

use std::collections::HashMap;

use crate::models::ChunkRecord;

/// Okapi BM25 parameters.
#[derive(Debug, Clone, Copy)]
pub struct Bm25Params {
    pub k1: f64,
    pub b: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

/// A chunk as indexed by BM25: content plus the source metadata needed to
/// hydrate a sparse hit without a repository round trip.
#[derive(Debug, Clone)]
pub struct Bm25Doc {
    pub chunk_id: String,
    pub doc_id: String,
    pub chunk_index: i32,
    pub content: String,
    pub page: Option<i32>,
    pub section_title: Option<String>,
}

impl Bm25Doc {
    pub fn from_chunk(chunk: &ChunkRecord) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            doc_id: chunk.doc_id.clone(),
            chunk_index: chunk.index,
            content: chunk.content.clone(),
            page: chunk.page,
            section_title: chunk.section_title.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct DocRecord {
    pub doc_id: String,
    pub chunk_index: i32,
    pub content: String,
    pub page: Option<i32>,
    pub section_title: Option<String>,
    pub len: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct Posting {
    pub chunk_id: String,
    pub tf: u32,
}

/// In-memory Okapi BM25 index over one knowledge base's chunks.
pub struct Bm25Index {
    pub(crate) params: Bm25Params,
    pub(crate) docs: HashMap<String, DocRecord>,
    pub(crate) postings: HashMap<String, Vec<Posting>>,
    pub(crate) total_len: u64,
    dirty: bool,
}

impl Bm25Index {
    pub fn new(params: Bm25Params) -> Self {
        Self {
            params,
            docs: HashMap::new(),
            postings: HashMap::new(),
            total_len: 0,
            dirty: false,
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn avgdl(&self) -> f64 {
        if self.docs.is_empty() {
            0.0
        } else {
            self.total_len as f64 / self.docs.len() as f64
        }
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.docs.contains_key(chunk_id)
    }

    pub fn chunk_ids(&self) -> Vec<String> {
        self.docs.keys().cloned().collect()
    }

    /// Document frequency of a term.
    pub fn df(&self, term: &str) -> usize {
        self.postings.get(term).map_or(0, |p| p.len())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Add or replace postings for the given chunks.
    pub fn upsert(&mut self, docs: &[Bm25Doc]) {
        for doc in docs {
            if self.docs.contains_key(&doc.chunk_id) {
                self.remove_one(&doc.chunk_id);
            }

            let tokens = tokenizer::tokenize(&doc.content);
            let len = tokens.len() as u32;

            let mut tf: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *tf.entry(token).or_default() += 1;
            }
            for (term, count) in tf {
                self.postings.entry(term).or_default().push(Posting {
                    chunk_id: doc.chunk_id.clone(),
                    tf: count,
                });
            }

            self.total_len += len as u64;
            self.docs.insert(
                doc.chunk_id.clone(),
                DocRecord {
                    doc_id: doc.doc_id.clone(),
                    chunk_index: doc.chunk_index,
                    content: doc.content.clone(),
                    page: doc.page,
                    section_title: doc.section_title.clone(),
                    len,
                },
            );
            self.dirty = true;
        }
    }

    /// Remove chunks from the index. Unknown ids are ignored.
    pub fn remove(&mut self, chunk_ids: &[String]) {
        for chunk_id in chunk_ids {
            if self.remove_one(chunk_id) {
                self.dirty = true;
            }
        }
    }

    fn remove_one(&mut self, chunk_id: &str) -> bool {
        let record = match self.docs.remove(chunk_id) {
            Some(r) => r,
            None => return false,
        };
        self.total_len = self.total_len.saturating_sub(record.len as u64);

        // The posting lists touched by this chunk are exactly its terms.
        let mut terms: Vec<String> = tokenizer::tokenize(&record.content);
        terms.sort();
        terms.dedup();
        for term in terms {
            if let Some(list) = self.postings.get_mut(&term) {
                list.retain(|p| p.chunk_id != chunk_id);
                if list.is_empty() {
                    self.postings.remove(&term);
                }
            }
        }
        true
    }

    /// Score the query against the index, returning up to `k`
    /// (chunk_id, score) pairs sorted by descending score. Only positive
    /// scores are returned.
    pub fn search(&self, query: &str, k: usize) -> Vec<(String, f64)> {
        if self.docs.is_empty() || k == 0 {
            return vec![];
        }
        let query_tokens = tokenizer::tokenize(query);
        if query_tokens.is_empty() {
            return vec![];
        }

        let n = self.docs.len() as f64;
        let avgdl = self.avgdl();
        let mut scores: HashMap<&str, f64> = HashMap::new();

        for term in &query_tokens {
            let list = match self.postings.get(term) {
                Some(list) => list,
                None => continue,
            };
            let df = list.len() as f64;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();

            for posting in list {
                let doc = &self.docs[&posting.chunk_id];
                let tf = posting.tf as f64;
                let numerator = tf * (self.params.k1 + 1.0);
                let denominator = tf
                    + self.params.k1
                        * (1.0 - self.params.b + self.params.b * doc.len as f64 / avgdl);
                *scores.entry(posting.chunk_id.as_str()).or_default() +=
                    idf * numerator / denominator;
            }
        }

        let mut ranked: Vec<(String, f64)> = scores
            .into_iter()
            .filter(|(_, score)| *score > 0.0)
            .map(|(id, score)| (id.to_string(), score))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(k);
        ranked
    }

    pub(crate) fn doc(&self, chunk_id: &str) -> Option<&DocRecord> {
        self.docs.get(chunk_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(chunk_id: &str, content: &str) -> Bm25Doc {
        Bm25Doc {
            chunk_id: chunk_id.to_string(),
            doc_id: format!("doc-{chunk_id}"),
            chunk_index: 0,
            content: content.to_string(),
            page: None,
            section_title: None,
        }
    }

    fn sample_index() -> Bm25Index {
        let mut index = Bm25Index::new(Bm25Params::default());
        index.upsert(&[
            doc("c1", "The cat sat on the mat."),
            doc("c2", "Dogs chase cats."),
            doc("c3", "Sailing to Byzantium."),
        ]);
        index
    }

    #[test]
    fn test_search_ranks_best_match_first() {
        let index = sample_index();
        let results = index.search("cat on mat", 3);
        assert!(!results.is_empty());
        assert_eq!(results[0].0, "c1");
        assert!(results[0].1 > 0.0);
    }

    #[test]
    fn test_search_no_match_is_empty() {
        let index = sample_index();
        assert!(index.search("quantum entanglement", 5).is_empty());
    }

    #[test]
    fn test_upsert_replaces_existing_chunk() {
        let mut index = sample_index();
        index.upsert(&[doc("c3", "Cats everywhere, cats all around.")]);
        assert_eq!(index.len(), 3);
        let results = index.search("cats", 3);
        assert!(results.iter().any(|(id, _)| id == "c3"));
        // The old content no longer matches.
        assert!(index.search("byzantium", 3).is_empty());
    }

    #[test]
    fn test_remove_updates_df_and_avgdl() {
        let mut index = sample_index();
        let df_before = index.df("cats");
        index.remove(&["c2".to_string()]);
        assert_eq!(index.len(), 2);
        assert!(index.df("cats") < df_before);
        assert!(index.search("dogs", 3).is_empty());
        assert!(index.avgdl() > 0.0);
    }

    #[test]
    fn test_remove_unknown_id_is_noop() {
        let mut index = sample_index();
        index.mark_clean();
        index.remove(&["nope".to_string()]);
        assert_eq!(index.len(), 3);
        assert!(!index.is_dirty());
    }

    #[test]
    fn test_dirty_flag_lifecycle() {
        let mut index = Bm25Index::new(Bm25Params::default());
        assert!(!index.is_dirty());
        index.upsert(&[doc("c1", "hello world")]);
        assert!(index.is_dirty());
        index.mark_clean();
        index.remove(&["c1".to_string()]);
        assert!(index.is_dirty());
    }

    #[test]
    fn test_chinese_content_searchable() {
        let mut index = Bm25Index::new(Bm25Params::default());
        index.upsert(&[
            doc("z1", "知识库检索系统支持混合检索"),
            doc("z2", "今天天气很好"),
        ]);
        let results = index.search("检索", 2);
        assert_eq!(results[0].0, "z1");
    }

    #[test]
    fn test_rarer_term_scores_higher() {
        let mut index = Bm25Index::new(Bm25Params::default());
        index.upsert(&[
            doc("c1", "alpha beta"),
            doc("c2", "alpha gamma"),
            doc("c3", "alpha delta"),
        ]);
        // "beta" appears once in the corpus, "alpha" in every doc.
        let beta = index.search("beta", 3);
        let alpha = index.search("alpha", 3);
        assert!(beta[0].1 > alpha[0].1);
    }
}
