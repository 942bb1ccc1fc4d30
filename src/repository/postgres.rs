use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::models::{ChunkRecord, Document, DocumentStatus, KnowledgeBase, NewChunk};

use super::Repository;

/// PostgreSQL repository for knowledge bases, documents and chunks.
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub async fn new(uri: &str, pool_size: u32) -> anyhow::Result<Self> {
        let clean_uri = uri.replace("postgresql+asyncpg://", "postgresql://");
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect(&clean_uri)
            .await?;

        info!("Connected to PostgreSQL (pool_size={pool_size})");
        Ok(Self { pool })
    }

    /// Create tables if missing.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS knowledge_bases (
                id VARCHAR(255) PRIMARY KEY,
                name VARCHAR(1024) NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                embedding_model VARCHAR(255) NOT NULL,
                chunk_size INTEGER NOT NULL,
                chunk_overlap INTEGER NOT NULL,
                active BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (
                id VARCHAR(255) PRIMARY KEY,
                kb_id VARCHAR(255) NOT NULL REFERENCES knowledge_bases(id) ON DELETE CASCADE,
                folder_id VARCHAR(255),
                filename VARCHAR(1024) NOT NULL,
                status VARCHAR(32) NOT NULL DEFAULT 'pending',
                chunk_count INTEGER NOT NULL DEFAULT 0,
                token_count BIGINT NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 1,
                created_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chunks (
                id VARCHAR(255) PRIMARY KEY,
                doc_id VARCHAR(255) NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                kb_id VARCHAR(255) NOT NULL,
                chunk_index INTEGER NOT NULL,
                content TEXT NOT NULL,
                token_count INTEGER NOT NULL DEFAULT 0,
                page INTEGER,
                section_title VARCHAR(1024),
                vector_id VARCHAR(255) NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_kb_id ON documents(kb_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_doc_id ON chunks(doc_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_kb_id ON chunks(kb_id)")
            .execute(&self.pool)
            .await?;

        info!("Repository tables initialized");
        Ok(())
    }
}

fn kb_from_row(row: &sqlx::postgres::PgRow) -> KnowledgeBase {
    KnowledgeBase {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        embedding_model: row.get("embedding_model"),
        chunk_size: row.get::<i32, _>("chunk_size") as usize,
        chunk_overlap: row.get::<i32, _>("chunk_overlap") as usize,
        active: row.get("active"),
    }
}

fn chunk_from_row(row: &sqlx::postgres::PgRow) -> ChunkRecord {
    ChunkRecord {
        id: row.get("id"),
        doc_id: row.get("doc_id"),
        kb_id: row.get("kb_id"),
        index: row.get("chunk_index"),
        content: row.get("content"),
        token_count: row.get("token_count"),
        page: row.get("page"),
        section_title: row.get("section_title"),
        vector_id: row.get("vector_id"),
    }
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn list_active_kbs(&self) -> anyhow::Result<Vec<KnowledgeBase>> {
        let rows = sqlx::query(
            "SELECT id, name, description, embedding_model, chunk_size, chunk_overlap, active
             FROM knowledge_bases WHERE active = TRUE ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(kb_from_row).collect())
    }

    async fn get_kb(&self, id: &str) -> anyhow::Result<Option<KnowledgeBase>> {
        let row = sqlx::query(
            "SELECT id, name, description, embedding_model, chunk_size, chunk_overlap, active
             FROM knowledge_bases WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(kb_from_row))
    }

    async fn list_chunks(
        &self,
        kb_id: &str,
        offset: i64,
        limit: i64,
    ) -> anyhow::Result<Vec<ChunkRecord>> {
        let rows = sqlx::query(
            "SELECT c.id, c.doc_id, c.kb_id, c.chunk_index, c.content, c.token_count,
                    c.page, c.section_title, c.vector_id
             FROM chunks c
             JOIN documents d ON c.doc_id = d.id
             WHERE c.kb_id = $1 AND d.status = 'completed'
             ORDER BY c.created_at, c.chunk_index
             OFFSET $2 LIMIT $3",
        )
        .bind(kb_id)
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(chunk_from_row).collect())
    }

    async fn get_document(&self, id: &str) -> anyhow::Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, kb_id, folder_id, filename, status, chunk_count, token_count, version
             FROM documents WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| {
            let status: String = r.get("status");
            Document {
                id: r.get("id"),
                kb_id: r.get("kb_id"),
                folder_id: r.get("folder_id"),
                filename: r.get("filename"),
                status: DocumentStatus::parse(&status).unwrap_or(DocumentStatus::Failed),
                chunk_count: r.get("chunk_count"),
                token_count: r.get("token_count"),
                version: r.get("version"),
            }
        }))
    }

    async fn update_document_status(
        &self,
        id: &str,
        status: DocumentStatus,
        chunk_count: Option<i32>,
        token_count: Option<i64>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE documents SET
                status = $2,
                chunk_count = COALESCE($3, chunk_count),
                token_count = COALESCE($4, token_count),
                updated_at = CURRENT_TIMESTAMP
             WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(chunk_count)
        .bind(token_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_chunks(&self, chunks: &[NewChunk]) -> anyhow::Result<Vec<ChunkRecord>> {
        if chunks.is_empty() {
            return Ok(vec![]);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            let id = Uuid::new_v4().to_string();
            let vector_id = Uuid::new_v4().to_string();
            sqlx::query(
                "INSERT INTO chunks
                    (id, doc_id, kb_id, chunk_index, content, token_count, page, section_title, vector_id)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(&id)
            .bind(&chunk.doc_id)
            .bind(&chunk.kb_id)
            .bind(chunk.index)
            .bind(&chunk.content)
            .bind(chunk.token_count)
            .bind(chunk.page)
            .bind(&chunk.section_title)
            .bind(&vector_id)
            .execute(&mut *tx)
            .await?;

            inserted.push(ChunkRecord {
                id,
                doc_id: chunk.doc_id.clone(),
                kb_id: chunk.kb_id.clone(),
                index: chunk.index,
                content: chunk.content.clone(),
                token_count: chunk.token_count,
                page: chunk.page,
                section_title: chunk.section_title.clone(),
                vector_id,
            });
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn delete_chunks_by_doc(&self, doc_id: &str) -> anyhow::Result<Vec<ChunkRecord>> {
        let rows = sqlx::query(
            "DELETE FROM chunks WHERE doc_id = $1
             RETURNING id, doc_id, kb_id, chunk_index, content, token_count,
                       page, section_title, vector_id",
        )
        .bind(doc_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(chunk_from_row).collect())
    }
}
