use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::Reranker;

/// Reranker that offloads cross-encoder scoring to an external inference
/// server exposing a `/rerank` endpoint (TEI-style wire format).
pub struct ApiReranker {
    model_name: String,
    endpoint: String,
    http_client: reqwest::Client,
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    texts: &'a [String],
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

#[derive(Deserialize)]
struct RerankResult {
    index: usize,
    score: f64,
}

impl ApiReranker {
    pub fn new(model_name: &str, endpoint: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            http_client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Reranker for ApiReranker {
    async fn score(&self, query: &str, docs: &[String]) -> anyhow::Result<Vec<f64>> {
        if docs.is_empty() {
            return Ok(vec![]);
        }

        let request = RerankRequest {
            model: &self.model_name,
            query,
            texts: docs,
        };

        let resp = self
            .http_client
            .post(format!("{}/rerank", self.endpoint))
            .json(&request)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(crate::error::ApiStatusError::new("rerank", status, body).into());
        }

        let response: RerankResponse = resp.json().await?;
        if response.results.len() != docs.len() {
            anyhow::bail!(
                "rerank API returned {} scores for {} docs",
                response.results.len(),
                docs.len()
            );
        }

        // Results may arrive sorted by score; restore input order.
        let mut scores = vec![0.0; docs.len()];
        for result in response.results {
            if result.index >= scores.len() {
                anyhow::bail!("rerank API returned out-of-range index {}", result.index);
            }
            scores[result.index] = result.score;
        }
        Ok(scores)
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}
