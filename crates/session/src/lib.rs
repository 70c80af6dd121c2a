//! Chat session engine for a tool-using retrieval agent.
//!
//! A [`ChatSession`] sends the conversation to an agent endpoint and grows
//! the transcript from the reply, in one of two modes:
//!
//! - **streaming**: the answer arrives as raw text tokens, with the sources
//!   the agent retrieved carried in response headers;
//! - **structured**: the agent returns its whole message list, including
//!   tool calls and tool results, which are paired into intermediate steps
//!   and revealed one at a time before the final answer.
//!
//! Intermediate steps travel back to the agent as `system` messages holding
//! `{"action": <tool call>, "observation": <tool output>}`.

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod steps;
pub mod transcript;
pub mod types;

pub use client::{
    AgentBackend, AgentReply, BatchReply, HttpAgentClient, IncrementalReply, TokenStream,
    MESSAGE_INDEX_HEADER, SOURCES_HEADER,
};
pub use config::{ChatConfig, ConfigError};
pub use error::{
    HeaderDecodeError, ProtocolViolation, SessionError, StepDecodeError, TranscriptError,
};
pub use logging::{TurnLogger, TurnRecord, TurnStatus};
pub use orchestrator::{ChatSession, RejectReason, SessionEvent, TurnOutcome};
pub use steps::{render_entry, EntryView, StepView, UNPARSEABLE_STEP};
pub use transcript::Transcript;
pub use types::{
    EntryBody, IntermediateStep, Message, MessageId, Role, SourceCitation, ToolCall,
    TranscriptEntry, TurnMode,
};
