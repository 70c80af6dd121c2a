//! Embedding client used by the retrieval store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{LlmProvider, ProviderConfig};
use crate::error::ProviderError;

#[async_trait]
pub trait Embedder: Send + Sync {
    fn model(&self) -> &str;

    fn dimension(&self) -> usize;

    /// One vector per input text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

pub struct OpenAiEmbedder {
    client: reqwest::Client,
    model: String,
    base_url: String,
    api_key: String,
    dimension: usize,
}

impl OpenAiEmbedder {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let settings = &config.embedding;
        let api_key = settings
            .api_key
            .clone()
            .ok_or_else(|| ProviderError::MissingConfig {
                key: "OPENAI_API_KEY".to_string(),
            })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| ProviderError::Http(format!("HTTP client init: {}", e)))?;

        Ok(Self {
            client,
            model: settings.model.clone(),
            base_url: settings.base_url.clone(),
            api_key,
            dimension: settings.dimension,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let resp = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Http(format!("OpenAI request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ProviderError::Api {
                provider: LlmProvider::OpenAi.to_string(),
                status: status.as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::parse(LlmProvider::OpenAi, e.to_string()))?;

        if let Some(usage) = json.get("usage") {
            tracing::debug!(
                prompt_tokens = usage.get("prompt_tokens").and_then(|v| v.as_u64()),
                total_tokens = usage.get("total_tokens").and_then(|v| v.as_u64()),
                "OpenAI embedding token usage"
            );
        }

        let data = json
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ProviderError::parse(LlmProvider::OpenAi, "missing 'data' field"))?;

        let mut indexed: Vec<(usize, Vec<f32>)> = data
            .iter()
            .map(|item| {
                let index = item.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                let embedding = item
                    .get("embedding")
                    .and_then(|v| v.as_array())
                    .ok_or_else(|| {
                        ProviderError::parse(LlmProvider::OpenAi, "missing 'embedding' in item")
                    })?
                    .iter()
                    .map(|v| {
                        v.as_f64().map(|f| f as f32).ok_or_else(|| {
                            ProviderError::parse(LlmProvider::OpenAi, "invalid float in embedding")
                        })
                    })
                    .collect::<Result<Vec<f32>, _>>()?;
                Ok((index, embedding))
            })
            .collect::<Result<Vec<_>, ProviderError>>()?;

        if indexed.len() != texts.len() {
            return Err(ProviderError::parse(
                LlmProvider::OpenAi,
                format!("expected {} embeddings, got {}", texts.len(), indexed.len()),
            ));
        }

        // The API may return items out of order.
        indexed.sort_by_key(|(i, _)| *i);
        Ok(indexed.into_iter().map(|(_, emb)| emb).collect())
    }
}

/// Embeddings always come from OpenAI and need `OPENAI_API_KEY`, whatever
/// `LLM_PROVIDER` says.
pub fn resolve_embedder(config: &ProviderConfig) -> Result<Arc<dyn Embedder>, ProviderError> {
    let embedder = OpenAiEmbedder::new(config)?;
    tracing::info!(
        model = %embedder.model,
        url = %embedder.base_url,
        dimension = embedder.dimension,
        chat_provider = %config.provider,
        "Using OpenAI embedding service"
    );
    Ok(Arc::new(embedder))
}
