//! HTTP client for the agent's chat and ingestion endpoints.
//!
//! A chat request yields one of two reply shapes: a raw token stream with
//! citation headers, or a single JSON document with the agent's full message
//! list. Both are variants of [`AgentReply`].

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::config::AgentConfig;
use crate::error::SessionError;
use crate::types::{Message, TurnMode};

/// Base64 JSON array of source citations.
pub const SOURCES_HEADER: &str = "x-sources";
/// Position-from-end key the citations belong to.
pub const MESSAGE_INDEX_HEADER: &str = "x-message-index";

pub type TokenStream = BoxStream<'static, Result<String, SessionError>>;

/// A reply still being received, token by token.
pub struct IncrementalReply {
    pub sources: Option<String>,
    pub message_index: Option<String>,
    pub tokens: TokenStream,
}

impl std::fmt::Debug for IncrementalReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncrementalReply")
            .field("sources", &self.sources.as_ref().map(|s| s.len()))
            .field("message_index", &self.message_index)
            .finish_non_exhaustive()
    }
}

/// A complete structured reply.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchReply {
    pub messages: Vec<Message>,
}

#[derive(Debug)]
pub enum AgentReply {
    Incremental(IncrementalReply),
    Batch(BatchReply),
}

/// The remote agent as seen by the session.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Open a token stream for the given history.
    async fn open_stream(&self, messages: &[Message]) -> Result<IncrementalReply, SessionError>;

    /// Fetch a structured reply, including tool exchanges.
    async fn fetch_batch(&self, messages: &[Message]) -> Result<BatchReply, SessionError>;

    async fn send(&self, messages: &[Message], mode: TurnMode) -> Result<AgentReply, SessionError> {
        match mode {
            TurnMode::Streaming => self.open_stream(messages).await.map(AgentReply::Incremental),
            TurnMode::Structured => self.fetch_batch(messages).await.map(AgentReply::Batch),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    show_intermediate_steps: Option<bool>,
}

#[derive(Debug, Serialize)]
struct IngestRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

/// reqwest implementation of [`AgentBackend`].
#[derive(Clone)]
pub struct HttpAgentClient {
    client: reqwest::Client,
    endpoint: String,
    ingest_endpoint: String,
    request_timeout: std::time::Duration,
}

impl HttpAgentClient {
    pub fn new(config: &AgentConfig) -> Result<Self, SessionError> {
        let ingest_endpoint = config.resolved_ingest_endpoint()?;

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| SessionError::Transport(format!("HTTP client init: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            ingest_endpoint,
            request_timeout: config.request_timeout(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn ingest_endpoint(&self) -> &str {
        &self.ingest_endpoint
    }

    /// Upload a document for retrieval.
    pub async fn ingest(&self, text: &str) -> Result<(), SessionError> {
        let resp = self
            .client
            .post(&self.ingest_endpoint)
            .timeout(self.request_timeout)
            .json(&IngestRequest { text })
            .send()
            .await
            .map_err(|e| SessionError::Transport(format!("ingest request failed: {}", e)))?;

        if resp.status() == reqwest::StatusCode::OK {
            tracing::info!(bytes = text.len(), "document ingested");
            return Ok(());
        }
        Err(upstream_error(resp).await)
    }
}

#[async_trait]
impl AgentBackend for HttpAgentClient {
    async fn open_stream(&self, messages: &[Message]) -> Result<IncrementalReply, SessionError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&ChatRequest {
                messages,
                show_intermediate_steps: None,
            })
            .send()
            .await
            .map_err(|e| SessionError::Transport(format!("chat request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(upstream_error(resp).await);
        }

        let header = |name: &str| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let sources = header(SOURCES_HEADER);
        let message_index = header(MESSAGE_INDEX_HEADER);

        tracing::debug!(
            has_sources = sources.is_some(),
            message_index = message_index.as_deref().unwrap_or("-"),
            "token stream opened"
        );

        Ok(IncrementalReply {
            sources,
            message_index,
            tokens: decode_text_stream(resp.bytes_stream()),
        })
    }

    async fn fetch_batch(&self, messages: &[Message]) -> Result<BatchReply, SessionError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .timeout(self.request_timeout)
            .json(&ChatRequest {
                messages,
                show_intermediate_steps: Some(true),
            })
            .send()
            .await
            .map_err(|e| SessionError::Transport(format!("chat request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(upstream_error(resp).await);
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| SessionError::Transport(format!("reading chat response: {}", e)))?;
        serde_json::from_slice(&body)
            .map_err(|e| SessionError::Decode(format!("chat response: {}", e)))
    }
}

/// Turn a failed response into the error shown to the user: the `error`
/// field of a JSON body when present, else the raw body, else the status.
async fn upstream_error(resp: reqwest::Response) -> SessionError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();

    let message = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .and_then(|b| b.error)
        .or_else(|| (!body.trim().is_empty()).then(|| body.trim().to_string()))
        .unwrap_or_else(|| format!("HTTP {}", status));

    tracing::warn!(status = %status, "agent returned an error: {}", message);
    SessionError::Upstream(message)
}

/// Decode a byte stream as UTF-8 text, holding back characters split across
/// chunk boundaries until they are complete.
pub fn decode_text_stream<S, B, E>(body: S) -> TokenStream
where
    S: futures::Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    futures::stream::unfold(
        (Box::pin(body), Utf8Chunker::default(), false),
        |(mut body, mut chunker, done)| async move {
            if done {
                return None;
            }
            loop {
                match body.next().await {
                    Some(Ok(bytes)) => {
                        let text = chunker.push(bytes.as_ref());
                        if !text.is_empty() {
                            return Some((Ok(text), (body, chunker, false)));
                        }
                    }
                    Some(Err(e)) => {
                        let err = SessionError::Transport(format!("stream interrupted: {}", e));
                        return Some((Err(err), (body, chunker, true)));
                    }
                    None => {
                        let rest = chunker.finish();
                        if rest.is_empty() {
                            return None;
                        }
                        return Some((Ok(rest), (body, chunker, true)));
                    }
                }
            }
        },
    )
    .boxed()
}

#[derive(Debug, Default)]
struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or_default());
                    match err.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // Incomplete trailing sequence; wait for more bytes.
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
