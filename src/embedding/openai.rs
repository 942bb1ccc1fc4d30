use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::EmbeddingModel;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Embedding model behind an OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbeddingModel {
    model_name: String,
    api_key: String,
    base_url: String,
    dimensions: usize,
    http_client: reqwest::Client,
    batch_size: usize,
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

/// The API reports one row per input; rows are not guaranteed to arrive in
/// input order, so each carries its index.
#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiEmbeddingModel {
    pub fn new(
        model_name: &str,
        api_key: &str,
        base_url: Option<&str>,
        dimensions: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            model_name: model_name.to_string(),
            api_key: api_key.to_string(),
            base_url: base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/').to_string(),
            dimensions,
            http_client: reqwest::Client::new(),
            batch_size,
        }
    }

    async fn request_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let request = EmbeddingsRequest {
            model: &self.model_name,
            input: texts,
        };

        let resp = self
            .http_client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(crate::error::ApiStatusError::new("embedding", status, body).into());
        }

        let response: EmbeddingsResponse = resp.json().await?;
        reorder_rows(response.data, texts.len())
    }
}

/// Place each row at its reported index, rejecting gaps and duplicates.
fn reorder_rows(rows: Vec<EmbeddingRow>, expected: usize) -> anyhow::Result<Vec<Vec<f32>>> {
    if rows.len() != expected {
        anyhow::bail!("embedding API returned {} rows for {} inputs", rows.len(), expected);
    }
    let mut ordered: Vec<Option<Vec<f32>>> = vec![None; expected];
    for row in rows {
        let slot = ordered
            .get_mut(row.index)
            .ok_or_else(|| anyhow::anyhow!("embedding row index {} out of range", row.index))?;
        if slot.replace(row.embedding).is_some() {
            anyhow::bail!("embedding API returned duplicate row index {}", row.index);
        }
    }
    Ok(ordered.into_iter().flatten().collect())
}

#[async_trait]
impl EmbeddingModel for OpenAiEmbeddingModel {
    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let mut all_embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            all_embeddings.extend(self.request_batch(batch).await?);
        }
        Ok(all_embeddings)
    }

    async fn embed_text(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let results = self.request_batch(std::slice::from_ref(&text.to_string())).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no embedding returned"))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}
