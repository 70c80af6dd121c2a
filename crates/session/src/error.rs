use thiserror::Error;

use crate::config::ConfigError;
use crate::types::Role;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("transport error: {0}")]
    Transport(String),

    /// The agent answered with an explicit error payload.
    #[error("agent error: {0}")]
    Upstream(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("a turn is already in progress")]
    Busy,

    #[error("transcript error: {0}")]
    Transcript(#[from] TranscriptError),

    #[error("decode error: {0}")]
    Decode(String),
}

impl SessionError {
    /// Text shown to the user. Agent-supplied errors are passed through verbatim.
    pub fn user_message(&self) -> String {
        match self {
            SessionError::Upstream(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

/// The agent's structured response broke the tool-call/tool-result contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("expected tool calls and tool results in pairs, got {count} messages")]
    OddExchangeCount { count: usize },

    #[error("unexpected {role} message at tool exchange position {position}")]
    OutOfOrder { position: usize, role: Role },

    #[error("agent response contained no messages")]
    EmptyResponse,
}

#[derive(Debug, Error)]
pub enum StepDecodeError {
    #[error("invalid step payload: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum HeaderDecodeError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("invalid citation list: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranscriptError {
    #[error("duplicate message id '{0}'")]
    DuplicateId(String),

    #[error("no message with id '{0}'")]
    UnknownMessage(String),

    #[error("message '{0}' is not being streamed")]
    NotStreaming(String),

    #[error("citation key '{0}' does not resolve to a message")]
    UnresolvedPosition(String),
}
