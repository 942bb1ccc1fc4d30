use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tracing::info;

use super::{VectorMatch, VectorStoreBackend};

/// PostgreSQL + pgvector backend. Each collection is its own table with an
/// IVFFlat cosine index.
pub struct PgVectorStore {
    pool: PgPool,
    ivfflat_probes: u32,
}

impl PgVectorStore {
    pub async fn new(uri: &str, pool_size: u32, ivfflat_probes: u32) -> anyhow::Result<Self> {
        let clean_uri = uri.replace("postgresql+asyncpg://", "postgresql://");
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect(&clean_uri)
            .await?;

        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&pool)
            .await?;

        info!("Created pgvector store connection pool (size={pool_size})");
        Ok(Self { pool, ivfflat_probes })
    }

    fn table_name(collection: &str) -> anyhow::Result<String> {
        // Collection names come from kb ids; reject anything that is not a
        // safe identifier before it reaches a dynamic DDL statement.
        if collection.is_empty()
            || !collection
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            anyhow::bail!("invalid collection name: {collection}");
        }
        Ok(format!("vs_{collection}"))
    }

    fn embedding_literal(vector: &[f32]) -> String {
        format!(
            "[{}]",
            vector
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(",")
        )
    }
}

#[async_trait]
impl VectorStoreBackend for PgVectorStore {
    async fn create_collection(&self, name: &str, dim: usize) -> anyhow::Result<()> {
        let table = Self::table_name(name)?;

        let create_sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id VARCHAR(255) PRIMARY KEY,
                metadata JSONB NOT NULL DEFAULT '{{}}',
                embedding vector({dim}) NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP
            )"
        );
        sqlx::query(&create_sql).execute(&self.pool).await?;

        let index_sql = format!(
            "CREATE INDEX IF NOT EXISTS {table}_embedding_idx ON {table}
             USING ivfflat (embedding vector_cosine_ops) WITH (lists = 100)"
        );
        sqlx::query(&index_sql).execute(&self.pool).await?;

        info!("Collection {name} ready (dim={dim})");
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> anyhow::Result<()> {
        let table = Self::table_name(name)?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(&self.pool)
            .await?;
        info!("Dropped collection {name}");
        Ok(())
    }

    async fn upsert(
        &self,
        collection: &str,
        ids: &[String],
        vectors: &[Vec<f32>],
        metadatas: &[HashMap<String, serde_json::Value>],
    ) -> anyhow::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let table = Self::table_name(collection)?;

        let mut tx = self.pool.begin().await?;
        for ((id, vector), metadata) in ids.iter().zip(vectors).zip(metadatas) {
            let metadata_json = serde_json::to_value(metadata)?;
            let insert_sql = format!(
                "INSERT INTO {table} (id, metadata, embedding)
                 VALUES ($1, $2, $3::vector)
                 ON CONFLICT (id)
                 DO UPDATE SET metadata = EXCLUDED.metadata, embedding = EXCLUDED.embedding"
            );
            sqlx::query(&insert_sql)
                .bind(id)
                .bind(&metadata_json)
                .bind(Self::embedding_literal(vector))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        top_k: usize,
        filter: Option<&HashMap<String, serde_json::Value>>,
    ) -> anyhow::Result<Vec<VectorMatch>> {
        let table = Self::table_name(collection)?;

        sqlx::query(&format!("SET LOCAL ivfflat.probes = {}", self.ivfflat_probes))
            .execute(&self.pool)
            .await
            .ok();

        let embedding_str = Self::embedding_literal(vector);
        let rows = if let Some(conditions) = filter {
            let filter_json = serde_json::to_value(conditions)?;
            sqlx::query(&format!(
                "SELECT id, metadata, embedding <=> $1::vector AS distance
                 FROM {table}
                 WHERE metadata @> $2
                 ORDER BY distance
                 LIMIT $3"
            ))
            .bind(&embedding_str)
            .bind(&filter_json)
            .bind(top_k as i64)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT id, metadata, embedding <=> $1::vector AS distance
                 FROM {table}
                 ORDER BY distance
                 LIMIT $2"
            ))
            .bind(&embedding_str)
            .bind(top_k as i64)
            .fetch_all(&self.pool)
            .await?
        };

        let mut matches = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let metadata: serde_json::Value = row.get("metadata");
            let distance: f64 = row.get("distance");
            matches.push(VectorMatch {
                id,
                // Cosine distance in [0, 2] mapped to similarity in [0, 1].
                score: 1.0 - distance / 2.0,
                metadata: serde_json::from_value(metadata).unwrap_or_default(),
            });
        }
        Ok(matches)
    }

    async fn delete_by_ids(&self, collection: &str, ids: &[String]) -> anyhow::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let table = Self::table_name(collection)?;
        sqlx::query(&format!("DELETE FROM {table} WHERE id = ANY($1)"))
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_ids(&self, collection: &str) -> anyhow::Result<Vec<String>> {
        let table = Self::table_name(collection)?;
        let rows = sqlx::query(&format!("SELECT id FROM {table}"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }
}
