//! Chat completion clients for OpenAI, Anthropic and Google.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{LlmProvider, ProviderConfig};
use crate::error::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn provider(&self) -> LlmProvider;

    fn model(&self) -> &str;

    /// Complete the conversation and return the reply text.
    async fn complete(&self, turns: &[ChatTurn], temperature: f32) -> Result<String, ProviderError>;
}

fn http_client(timeout_seconds: u64) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_seconds))
        .build()
        .map_err(|e| ProviderError::Http(format!("HTTP client init: {}", e)))
}

async fn send_json(
    provider: LlmProvider,
    request: reqwest::RequestBuilder,
    body: &serde_json::Value,
) -> Result<serde_json::Value, ProviderError> {
    let response = request
        .json(body)
        .send()
        .await
        .map_err(|e| ProviderError::Http(format!("{} request failed: {}", provider, e)))?;

    let status = response.status();
    if !status.is_success() {
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(ProviderError::Api {
            provider: provider.to_string(),
            status: status.as_u16(),
            message,
        });
    }

    response
        .json()
        .await
        .map_err(|e| ProviderError::parse(provider, e.to_string()))
}

/// Split system turns out for APIs that take the system prompt separately.
fn split_system(turns: &[ChatTurn]) -> (Option<String>, Vec<&ChatTurn>) {
    let system: Vec<&str> = turns
        .iter()
        .filter(|t| t.role == ChatRole::System)
        .map(|t| t.content.as_str())
        .collect();
    let rest = turns.iter().filter(|t| t.role != ChatRole::System).collect();
    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, rest)
}

pub struct OpenAiChat {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiChat {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(config.timeout_seconds)?,
            api_key: config.require_api_key()?,
            base_url: config.base_url.clone(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    fn provider(&self) -> LlmProvider {
        LlmProvider::OpenAi
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, turns: &[ChatTurn], temperature: f32) -> Result<String, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": turns,
            "temperature": temperature,
        });

        let start = std::time::Instant::now();
        let request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key);
        let resp_json = send_json(LlmProvider::OpenAi, request, &body).await?;

        if let Some(usage) = resp_json.get("usage") {
            tracing::info!(
                provider = "OpenAI",
                model = %self.model,
                prompt_tokens = usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                completion_tokens = usage.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                latency_ms = start.elapsed().as_millis() as u64,
                "LLM usage"
            );
        }

        resp_json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| ProviderError::parse(LlmProvider::OpenAi, "no content in choices"))
    }
}

pub struct AnthropicChat {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl AnthropicChat {
    const API_VERSION: &'static str = "2023-06-01";
    const MAX_TOKENS: u32 = 4096;

    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(config.timeout_seconds)?,
            api_key: config.require_api_key()?,
            base_url: config.base_url.clone(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl ChatModel for AnthropicChat {
    fn provider(&self) -> LlmProvider {
        LlmProvider::Anthropic
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, turns: &[ChatTurn], temperature: f32) -> Result<String, ProviderError> {
        let (system, rest) = split_system(turns);
        let mut body = serde_json::json!({
            "model": self.model,
            "max_tokens": Self::MAX_TOKENS,
            "temperature": temperature,
            "messages": rest,
        });
        if let Some(system) = system {
            body["system"] = serde_json::Value::String(system);
        }

        let request = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", Self::API_VERSION);
        let resp_json = send_json(LlmProvider::Anthropic, request, &body).await?;

        if let Some(usage) = resp_json.get("usage") {
            tracing::info!(
                provider = "Anthropic",
                model = %self.model,
                input_tokens = usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                output_tokens = usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                "LLM usage"
            );
        }

        // Content is an array of blocks; the reply is the first text block.
        resp_json
            .get("content")
            .and_then(|c| c.as_array())
            .and_then(|blocks| {
                blocks
                    .iter()
                    .find(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
            })
            .and_then(|b| b.get("text"))
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| ProviderError::parse(LlmProvider::Anthropic, "no text content block"))
    }
}

pub struct GoogleChat {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl GoogleChat {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(config.timeout_seconds)?,
            api_key: config.require_api_key()?,
            base_url: config.base_url.clone(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl ChatModel for GoogleChat {
    fn provider(&self) -> LlmProvider {
        LlmProvider::Google
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, turns: &[ChatTurn], temperature: f32) -> Result<String, ProviderError> {
        let (system, rest) = split_system(turns);
        let contents: Vec<serde_json::Value> = rest
            .iter()
            .map(|t| {
                let role = match t.role {
                    ChatRole::Assistant => "model",
                    _ => "user",
                };
                serde_json::json!({"role": role, "parts": [{"text": t.content}]})
            })
            .collect();

        let mut body = serde_json::json!({
            "contents": contents,
            "generationConfig": {"temperature": temperature},
        });
        if let Some(system) = system {
            body["systemInstruction"] = serde_json::json!({"parts": [{"text": system}]});
        }

        let request = self
            .client
            .post(format!(
                "{}/models/{}:generateContent",
                self.base_url, self.model
            ))
            .header("x-goog-api-key", &self.api_key);
        let resp_json = send_json(LlmProvider::Google, request, &body).await?;

        let parts = resp_json
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
            .ok_or_else(|| ProviderError::parse(LlmProvider::Google, "no candidates"))?;

        Ok(parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(""))
    }
}

/// Build the chat model selected by `LLM_PROVIDER`.
pub fn resolve_chat_model(config: &ProviderConfig) -> Result<Arc<dyn ChatModel>, ProviderError> {
    tracing::info!(provider = %config.provider, model = %config.model, "Resolving chat model");
    Ok(match config.provider {
        LlmProvider::OpenAi => Arc::new(OpenAiChat::new(config)?),
        LlmProvider::Anthropic => Arc::new(AnthropicChat::new(config)?),
        LlmProvider::Google => Arc::new(GoogleChat::new(config)?),
    })
}
