use serde::{Deserialize, Deserializer, Serialize};

use crate::steps::{decode_step, encode_step};

/// Wire role tag of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A tool invocation embedded in an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, args: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// A chat message as exchanged with the agent endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Agent responses frequently omit ids; they are assigned on append.
    #[serde(default)]
    pub id: String,
    pub role: Role,
    #[serde(default, deserialize_with = "deserialize_content")]
    pub content: String,
    #[serde(
        default,
        deserialize_with = "deserialize_tool_calls",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub tool_calls: Vec<ToolCall>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            role,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::with_role(Role::Tool, content)
    }

    /// An assistant message that only carries tool calls.
    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::with_role(Role::Assistant, "")
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Message content arrives either as plain text, as null, or as an array of
/// typed content parts (`{"type":"text","text":...}`). Parts are joined with
/// newlines; non-text parts are skipped.
fn deserialize_content<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(text) => text,
        serde_json::Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match part {
                serde_json::Value::String(text) => Some(text.as_str()),
                other => other.get("text").and_then(|t| t.as_str()),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    })
}

fn deserialize_tool_calls<'de, D>(deserializer: D) -> Result<Vec<ToolCall>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<ToolCall>>::deserialize(deserializer)?.unwrap_or_default())
}

/// A retrieved passage the agent used to answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCitation {
    #[serde(rename = "pageContent")]
    pub page_content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl SourceCitation {
    /// First `max_chars` characters of the passage.
    pub fn preview(&self, max_chars: usize) -> &str {
        match self.page_content.char_indices().nth(max_chars) {
            Some((idx, _)) => &self.page_content[..idx],
            None => &self.page_content,
        }
    }
}

/// One tool invocation paired with its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntermediateStep {
    pub action: ToolCall,
    pub observation: String,
}

/// Stable identifier of a transcript entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// What a transcript entry holds. Intermediate steps are their own variant
/// rather than `system` text, so rendering never has to guess.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryBody {
    User(String),
    Assistant(String),
    Step(IntermediateStep),
    Tool(String),
    /// A `system` payload that did not decode as a step.
    Malformed(String),
}

impl EntryBody {
    pub fn role(&self) -> Role {
        match self {
            EntryBody::User(_) => Role::User,
            EntryBody::Assistant(_) => Role::Assistant,
            EntryBody::Step(_) | EntryBody::Malformed(_) => Role::System,
            EntryBody::Tool(_) => Role::Tool,
        }
    }
}

/// A single row of the transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub id: MessageId,
    pub body: EntryBody,
}

impl TranscriptEntry {
    pub fn new(id: MessageId, body: EntryBody) -> Self {
        Self { id, body }
    }

    /// Decode a wire message. `system` content that is not a step becomes
    /// [`EntryBody::Malformed`] instead of failing.
    pub fn from_message(id: MessageId, message: Message) -> Self {
        let body = match message.role {
            Role::User => EntryBody::User(message.content),
            Role::Assistant => EntryBody::Assistant(message.content),
            Role::Tool => EntryBody::Tool(message.content),
            Role::System => match decode_step(&message.content) {
                Ok(step) => EntryBody::Step(step),
                Err(e) => {
                    tracing::debug!(id = %id, error = %e, "system message is not a step");
                    EntryBody::Malformed(message.content)
                }
            },
        };
        Self { id, body }
    }

    /// Encode for the wire. Steps travel as `system` messages.
    pub fn to_message(&self) -> Message {
        let message = match &self.body {
            EntryBody::User(text) => Message::user(text.clone()),
            EntryBody::Assistant(text) => Message::assistant(text.clone()),
            EntryBody::Step(step) => Message::system(encode_step(step)),
            EntryBody::Tool(text) => Message::tool(text.clone()),
            EntryBody::Malformed(raw) => Message::system(raw.clone()),
        };
        message.with_id(self.id.as_str())
    }

    pub fn role(&self) -> Role {
        self.body.role()
    }
}

/// Which response protocol a turn uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnMode {
    /// Raw token stream, citations in response headers.
    Streaming,
    /// One JSON document including the agent's tool exchanges.
    Structured,
}

impl TurnMode {
    pub fn from_reveal_steps(reveal_steps: bool) -> Self {
        if reveal_steps {
            TurnMode::Structured
        } else {
            TurnMode::Streaming
        }
    }
}

impl std::fmt::Display for TurnMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnMode::Streaming => write!(f, "streaming"),
            TurnMode::Structured => write!(f, "structured"),
        }
    }
}
