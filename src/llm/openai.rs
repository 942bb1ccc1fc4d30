use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ApiStatusError;

use super::{CompletionModel, CompletionResult, Message, Usage};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Completion model behind an OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiCompletionModel {
    model_name: String,
    api_key: String,
    base_url: String,
    default_max_tokens: u32,
    default_temperature: f64,
    http_client: reqwest::Client,
}

/// Request payload; borrows the caller's messages, which already serialize
/// to the wire shape.
#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct TokenUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

// Streamed chunks carry deltas instead of complete messages.

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Extract the text delta from one SSE line, if it carries any.
/// Returns `None` for keep-alives, the `[DONE]` sentinel, and non-data lines.
fn delta_from_sse_line(line: &str) -> Option<String> {
    let payload = line.strip_prefix("data: ")?.trim();
    if payload == "[DONE]" {
        return None;
    }
    let chunk: StreamChunk = serde_json::from_str(payload).ok()?;
    chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
}

impl OpenAiCompletionModel {
    pub fn new(
        model_name: &str,
        api_key: &str,
        base_url: Option<&str>,
        default_max_tokens: u32,
        default_temperature: f64,
    ) -> Self {
        Self {
            model_name: model_name.to_string(),
            api_key: api_key.to_string(),
            base_url: base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/').to_string(),
            default_max_tokens,
            default_temperature,
            http_client: reqwest::Client::new(),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl CompletionModel for OpenAiCompletionModel {
    async fn complete(
        &self,
        messages: &[Message],
        max_tokens: Option<u32>,
        temperature: Option<f64>,
    ) -> anyhow::Result<CompletionResult> {
        let request = ChatCompletionRequest {
            model: &self.model_name,
            messages,
            max_tokens: max_tokens.unwrap_or(self.default_max_tokens),
            temperature: temperature.unwrap_or(self.default_temperature),
            stream: false,
        };

        let resp = self
            .http_client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiStatusError::new("llm", status, body).into());
        }

        let response: ChatCompletionResponse = resp.json().await?;
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        let usage = response.usage.map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        Ok(CompletionResult {
            content,
            usage,
            provider: String::new(),
        })
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        max_tokens: Option<u32>,
        temperature: Option<f64>,
    ) -> anyhow::Result<tokio::sync::mpsc::Receiver<String>> {
        let request = ChatCompletionRequest {
            model: &self.model_name,
            messages,
            max_tokens: max_tokens.unwrap_or(self.default_max_tokens),
            temperature: temperature.unwrap_or(self.default_temperature),
            stream: true,
        };

        // Issue the request up front so connection failures surface to the
        // caller instead of dying inside the forwarding task.
        let resp = self
            .http_client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiStatusError::new("llm", status, body).into());
        }

        let (tx, rx) = tokio::sync::mpsc::channel(100);
        tokio::spawn(async move {
            match resp.text().await {
                Ok(body) => {
                    for delta in body.lines().filter_map(delta_from_sse_line) {
                        if tx.send(delta).await.is_err() {
                            // Receiver dropped; stop forwarding.
                            return;
                        }
                    }
                }
                Err(e) => warn!("failed reading completion stream body: {e}"),
            }
        });

        Ok(rx)
    }
}
