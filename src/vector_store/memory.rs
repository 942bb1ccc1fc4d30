use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use super::{VectorMatch, VectorStoreBackend};

struct StoredVector {
    id: String,
    vector: Vec<f32>,
    metadata: HashMap<String, serde_json::Value>,
}

struct Collection {
    dim: usize,
    vectors: Vec<StoredVector>,
}

/// In-memory vector store for tests and development. Search is brute-force
/// cosine similarity over all stored vectors.
pub struct MemoryVectorStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

fn cosine_sim(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        (dot / (mag_a * mag_b)) as f64
    }
}

fn matches_filter(
    metadata: &HashMap<String, serde_json::Value>,
    filter: Option<&HashMap<String, serde_json::Value>>,
) -> bool {
    match filter {
        None => true,
        Some(conditions) => conditions.iter().all(|(k, v)| metadata.get(k) == Some(v)),
    }
}

#[async_trait]
impl VectorStoreBackend for MemoryVectorStore {
    async fn create_collection(&self, name: &str, dim: usize) -> anyhow::Result<()> {
        let mut collections = self.collections.write().unwrap();
        collections.entry(name.to_string()).or_insert(Collection {
            dim,
            vectors: Vec::new(),
        });
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> anyhow::Result<()> {
        self.collections.write().unwrap().remove(name);
        Ok(())
    }

    async fn upsert(
        &self,
        collection: &str,
        ids: &[String],
        vectors: &[Vec<f32>],
        metadatas: &[HashMap<String, serde_json::Value>],
    ) -> anyhow::Result<()> {
        let mut collections = self.collections.write().unwrap();
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| anyhow::anyhow!("collection {collection} does not exist"))?;

        for ((id, vector), metadata) in ids.iter().zip(vectors).zip(metadatas) {
            if vector.len() != coll.dim {
                anyhow::bail!(
                    "vector dimension {} does not match collection dimension {}",
                    vector.len(),
                    coll.dim
                );
            }
            coll.vectors.retain(|v| v.id != *id);
            coll.vectors.push(StoredVector {
                id: id.clone(),
                vector: vector.clone(),
                metadata: metadata.clone(),
            });
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        top_k: usize,
        filter: Option<&HashMap<String, serde_json::Value>>,
    ) -> anyhow::Result<Vec<VectorMatch>> {
        let collections = self.collections.read().unwrap();
        let coll = match collections.get(collection) {
            Some(c) => c,
            None => return Ok(vec![]),
        };

        let mut matches: Vec<VectorMatch> = coll
            .vectors
            .iter()
            .filter(|v| matches_filter(&v.metadata, filter))
            .map(|v| VectorMatch {
                id: v.id.clone(),
                score: cosine_sim(&v.vector, vector),
                metadata: v.metadata.clone(),
            })
            .collect();

        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn delete_by_ids(&self, collection: &str, ids: &[String]) -> anyhow::Result<()> {
        let mut collections = self.collections.write().unwrap();
        if let Some(coll) = collections.get_mut(collection) {
            coll.vectors.retain(|v| !ids.contains(&v.id));
        }
        Ok(())
    }

    async fn list_ids(&self, collection: &str) -> anyhow::Result<Vec<String>> {
        let collections = self.collections.read().unwrap();
        Ok(collections
            .get(collection)
            .map(|c| c.vectors.iter().map(|v| v.id.clone()).collect())
            .unwrap_or_default())
    }
}
