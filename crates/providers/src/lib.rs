//! Chat model and embedding provider resolution.
//!
//! The chat provider and model are selected with `LLM_PROVIDER`
//! (`openai`, `anthropic` or `google`) and `LLM_MODEL`. Embeddings are
//! always served by OpenAI.

pub mod chat;
pub mod config;
pub mod embedding;
pub mod error;

pub use chat::{
    resolve_chat_model, AnthropicChat, ChatModel, ChatRole, ChatTurn, GoogleChat, OpenAiChat,
};
pub use config::{EmbeddingSettings, LlmProvider, ProviderConfig};
pub use embedding::{resolve_embedder, Embedder, OpenAiEmbedder};
pub use error::ProviderError;
