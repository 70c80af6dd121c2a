//! Intermediate step decoding.
//!
//! Turns the agent's flat list of tool-call and tool-result messages into
//! ordered [`IntermediateStep`]s, serializes steps for the wire, and projects
//! transcript entries into something a renderer can print without parsing.

use base64::Engine;

use crate::error::{HeaderDecodeError, ProtocolViolation, StepDecodeError};
use crate::types::{
    EntryBody, IntermediateStep, Message, Role, SourceCitation, ToolCall, TranscriptEntry,
};

/// Shown in place of a `system` payload that is not a step.
pub const UNPARSEABLE_STEP: &str = "[unparseable intermediate step]";

impl IntermediateStep {
    pub fn new(action: ToolCall, observation: impl Into<String>) -> Self {
        Self {
            action,
            observation: observation.into(),
        }
    }
}

pub fn encode_step(step: &IntermediateStep) -> String {
    // A struct of strings and JSON maps always serializes.
    serde_json::to_string(step).unwrap_or_default()
}

pub fn decode_step(content: &str) -> Result<IntermediateStep, StepDecodeError> {
    Ok(serde_json::from_str(content)?)
}

/// An assistant message carrying at least one tool call, or a tool result.
pub fn is_tool_exchange(message: &Message) -> bool {
    match message.role {
        Role::Assistant => !message.tool_calls.is_empty(),
        Role::Tool => true,
        _ => false,
    }
}

/// Pair the tool exchanges of a structured response into steps.
///
/// The filtered sequence must alternate assistant tool call, tool result.
/// Anything else rejects the whole turn; nothing is dropped.
pub fn pair_tool_exchanges(
    messages: &[Message],
) -> Result<Vec<IntermediateStep>, ProtocolViolation> {
    let exchanges: Vec<&Message> = messages.iter().filter(|m| is_tool_exchange(m)).collect();

    if exchanges.len() % 2 != 0 {
        tracing::warn!(
            exchanges = exchanges.len(),
            total = messages.len(),
            "tool exchanges do not pair up"
        );
        return Err(ProtocolViolation::OddExchangeCount {
            count: exchanges.len(),
        });
    }

    let mut steps = Vec::with_capacity(exchanges.len() / 2);
    for (pair_idx, pair) in exchanges.chunks_exact(2).enumerate() {
        let (call, result) = (pair[0], pair[1]);
        if call.role != Role::Assistant {
            return Err(out_of_order(pair_idx * 2, call.role));
        }
        if result.role != Role::Tool {
            return Err(out_of_order(pair_idx * 2 + 1, result.role));
        }
        // is_tool_exchange guarantees at least one call on assistant entries.
        let Some(action) = call.tool_calls.first() else {
            return Err(out_of_order(pair_idx * 2, call.role));
        };
        if call.tool_calls.len() > 1 {
            tracing::debug!(
                calls = call.tool_calls.len(),
                "only the first tool call of a message is revealed"
            );
        }
        steps.push(IntermediateStep::new(action.clone(), result.content.clone()));
    }

    Ok(steps)
}

fn out_of_order(position: usize, role: Role) -> ProtocolViolation {
    tracing::warn!(position, role = %role, "tool exchanges out of order");
    ProtocolViolation::OutOfOrder { position, role }
}

/// Decode the `x-sources` header: base64 of a JSON array of citations.
pub fn decode_citations_header(raw: &str) -> Result<Vec<SourceCitation>, HeaderDecodeError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(raw.trim())?;
    let json = String::from_utf8(bytes)?;
    Ok(serde_json::from_str(&json)?)
}

pub fn encode_citations_header(citations: &[SourceCitation]) -> String {
    let json = serde_json::to_string(citations).unwrap_or_else(|_| "[]".to_string());
    base64::engine::general_purpose::STANDARD.encode(json)
}

/// Display fields of a step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepView {
    pub tool: String,
    /// Tool arguments, pretty-printed JSON.
    pub input: String,
    pub output: String,
}

impl StepView {
    pub fn from_step(step: &IntermediateStep) -> Self {
        let input = serde_json::to_string_pretty(&step.action.args)
            .unwrap_or_else(|_| "{}".to_string());
        Self {
            tool: step.action.name.clone(),
            input,
            output: step.observation.clone(),
        }
    }

    /// Parse raw `system` content straight into a view.
    pub fn parse(content: &str) -> Result<Self, StepDecodeError> {
        decode_step(content).map(|step| Self::from_step(&step))
    }
}

/// Render-time projection of a transcript entry.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryView<'a> {
    User(&'a str),
    Assistant(&'a str),
    Step(StepView),
    Tool(&'a str),
    Placeholder(&'static str),
}

pub fn render_entry(entry: &TranscriptEntry) -> EntryView<'_> {
    match &entry.body {
        EntryBody::User(text) => EntryView::User(text),
        EntryBody::Assistant(text) => EntryView::Assistant(text),
        EntryBody::Step(step) => EntryView::Step(StepView::from_step(step)),
        EntryBody::Tool(text) => EntryView::Tool(text),
        EntryBody::Malformed(_) => EntryView::Placeholder(UNPARSEABLE_STEP),
    }
}
