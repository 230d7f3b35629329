use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StandardsError;

/// One completion call. The model id travels with the request so a shared
/// client never holds per-request state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub model_id: String,
    pub system: String,
    pub prompt: String,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn backend_name(&self) -> &'static str;
    async fn generate(&self, request: GenerationRequest) -> Result<String>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

pub fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("failed to build HTTP client")
}

pub struct OpenAiChatModel {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiChatModel {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>, base_url: &str) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiErrorBody {
    error: OpenAiErrorDetail,
}

#[derive(Deserialize)]
struct OpenAiErrorDetail {
    message: String,
}

async fn openai_error(response: reqwest::Response) -> anyhow::Error {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<OpenAiErrorBody>(&text)
        .map(|body| body.error.message)
        .unwrap_or(text);
    anyhow::anyhow!("OpenAI request failed with status {status}: {message}")
}

#[async_trait]
impl LanguageModel for OpenAiChatModel {
    fn backend_name(&self) -> &'static str {
        "openai"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<String> {
        let body = ChatCompletionRequest {
            model: &request.model_id,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("failed to send request to OpenAI chat completions")?;

        if !response.status().is_success() {
            return Err(openai_error(response).await);
        }

        let parsed = response
            .json::<ChatCompletionResponse>()
            .await
            .context("failed to decode OpenAI chat completion response")?;

        parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .ok_or_else(|| anyhow::anyhow!("OpenAI chat completion returned no content"))
    }
}

pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(
        client: reqwest::Client,
        api_key: impl Into<String>,
        base_url: &str,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a str,
    model: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                input: text,
                model: &self.model,
            })
            .send()
            .await
            .context("failed to send request to OpenAI embeddings")?;

        if !response.status().is_success() {
            return Err(openai_error(response).await);
        }

        let parsed = response
            .json::<EmbeddingResponse>()
            .await
            .context("failed to decode OpenAI embeddings response")?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|data| data.embedding)
            .ok_or_else(|| anyhow::anyhow!("OpenAI embeddings response contained no vectors"))
    }
}

pub fn validate_model_id(model_id: &str) -> Result<(), StandardsError> {
    if model_id.chars().any(char::is_whitespace) {
        return Err(StandardsError::InvalidRequest(format!(
            "model_id '{model_id}' must not contain whitespace"
        )));
    }
    Ok(())
}

/// A blank override means "use the default".
pub fn requested_model_id(override_id: Option<&str>) -> Option<&str> {
    override_id.map(str::trim).filter(|model_id| !model_id.is_empty())
}

/// Picks the per-call model id: a validated override, or the configured default.
pub fn select_model_id(
    override_id: Option<&str>,
    default_id: &str,
) -> Result<String, StandardsError> {
    match requested_model_id(override_id) {
        Some(model_id) => {
            validate_model_id(model_id)?;
            Ok(model_id.to_string())
        }
        None => Ok(default_id.to_string()),
    }
}

pub fn env_present(key: &str) -> bool {
    std::env::var(key)
        .map(|v| !v.trim().is_empty())
        .unwrap_or(false)
}
