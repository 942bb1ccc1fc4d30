use serde::{Deserialize, Serialize};

/// A tenant-scoped knowledge base. The embedding model is fixed after the
/// first successful ingestion; changing it would make stored vectors
/// incomparable with query vectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub embedding_model: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub active: bool,
}

impl KnowledgeBase {
    /// Vector-store collection name for this KB.
    pub fn collection_name(&self) -> String {
        collection_name(&self.id)
    }
}

/// `kb_<kb_id>` with `-` replaced by `_` so the name is valid for backends
/// that reject hyphens.
pub fn collection_name(kb_id: &str) -> String {
    format!("kb_{}", kb_id.replace('-', "_"))
}

/// Document ingestion status. Transitions are strictly
/// pending → processing → {completed, failed}; reprocessing resets to pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DocumentStatus::Pending),
            "processing" => Some(DocumentStatus::Processing),
            "completed" => Some(DocumentStatus::Completed),
            "failed" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }
}

/// An ingested document's metadata record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub kb_id: String,
    #[serde(default)]
    pub folder_id: Option<String>,
    pub filename: String,
    pub status: DocumentStatus,
    pub chunk_count: i32,
    pub token_count: i64,
    pub version: i32,
}

/// A chunk as stored in the repository. `vector_id` is the identifier the
/// vector store indexed, minted by the repository on insert; it is kept
/// separate from `id` so vector deletion always uses the backend-canonical
/// key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    pub doc_id: String,
    pub kb_id: String,
    pub index: i32,
    pub content: String,
    pub token_count: i32,
    #[serde(default)]
    pub page: Option<i32>,
    #[serde(default)]
    pub section_title: Option<String>,
    pub vector_id: String,
}

/// A chunk before insertion; the repository assigns `id` and `vector_id`.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub doc_id: String,
    pub kb_id: String,
    pub index: i32,
    pub content: String,
    pub token_count: i32,
    pub page: Option<i32>,
    pub section_title: Option<String>,
}
