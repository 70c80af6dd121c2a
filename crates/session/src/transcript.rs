//! Transcript store and citation index.
//!
//! The transcript is append-only. Ids come from a per-transcript counter and
//! never repeat. Citations reported by the agent arrive keyed by position
//! from the end of the transcript; they are resolved once, at response time,
//! and stored against the stable id of the message they belong to.

use std::collections::{HashMap, HashSet};

use crate::error::TranscriptError;
use crate::types::{EntryBody, Message, MessageId, SourceCitation, TranscriptEntry};

#[derive(Debug, Clone, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
    next_id: u64,
    /// The assistant message currently receiving tokens, if any.
    streaming: Option<MessageId>,
    citations: HashMap<MessageId, Vec<SourceCitation>>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&mut self) -> MessageId {
        let id = MessageId::new(self.next_id.to_string());
        self.next_id += 1;
        id
    }

    /// Append an entry and return its id.
    pub fn append(&mut self, body: EntryBody) -> MessageId {
        let id = self.allocate_id();
        self.entries.push(TranscriptEntry::new(id.clone(), body));
        id
    }

    /// Append a wire message. Its own id is ignored.
    pub fn append_message(&mut self, message: Message) -> MessageId {
        let id = self.allocate_id();
        self.entries
            .push(TranscriptEntry::from_message(id.clone(), message));
        id
    }

    /// Replace every entry at once. Citations of ids that no longer exist
    /// are dropped.
    pub fn replace_all(&mut self, entries: Vec<TranscriptEntry>) -> Result<(), TranscriptError> {
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            if !seen.insert(entry.id.clone()) {
                return Err(TranscriptError::DuplicateId(entry.id.to_string()));
            }
        }

        let max_numeric = entries
            .iter()
            .filter_map(|e| e.id.as_str().parse::<u64>().ok())
            .max();
        if let Some(max) = max_numeric {
            self.next_id = self.next_id.max(max + 1);
        }

        self.citations.retain(|id, _| seen.contains(id));
        if let Some(streaming) = &self.streaming {
            if !seen.contains(streaming) {
                self.streaming = None;
            }
        }
        self.entries = entries;
        Ok(())
    }

    /// Append an empty assistant message that will receive streamed tokens.
    pub fn begin_stream(&mut self) -> MessageId {
        let id = self.append(EntryBody::Assistant(String::new()));
        self.streaming = Some(id.clone());
        id
    }

    /// Append a token to the message being streamed.
    pub fn append_token(&mut self, id: &MessageId, token: &str) -> Result<(), TranscriptError> {
        if self.streaming.as_ref() != Some(id) {
            return Err(TranscriptError::NotStreaming(id.to_string()));
        }
        let entry = self
            .entries
            .iter_mut()
            .rev()
            .find(|e| &e.id == id)
            .ok_or_else(|| TranscriptError::UnknownMessage(id.to_string()))?;
        match &mut entry.body {
            EntryBody::Assistant(text) => {
                text.push_str(token);
                Ok(())
            }
            _ => Err(TranscriptError::NotStreaming(id.to_string())),
        }
    }

    /// Mark the streamed message complete. It is immutable afterwards.
    pub fn seal(&mut self, id: &MessageId) {
        if self.streaming.as_ref() == Some(id) {
            self.streaming = None;
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.is_some()
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn get(&self, id: &MessageId) -> Option<&TranscriptEntry> {
        self.entries.iter().find(|e| &e.id == id)
    }

    pub fn last(&self) -> Option<&TranscriptEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The transcript as wire messages, for the next request.
    pub fn to_wire(&self) -> Vec<Message> {
        self.entries.iter().map(TranscriptEntry::to_message).collect()
    }

    /// Position from the end: the last entry is 0.
    pub fn position_from_end(&self, id: &MessageId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| &e.id == id)
            .map(|idx| self.entries.len() - 1 - idx)
    }

    fn id_at_position_from_end(&self, position: usize) -> Option<&MessageId> {
        let idx = self.entries.len().checked_sub(1)?.checked_sub(position)?;
        self.entries.get(idx).map(|e| &e.id)
    }

    /// Attach citations reported under a positional key
    /// (`len - 1 - index`, evaluated now). Returns the id they were bound to.
    pub fn attach_citations(
        &mut self,
        position_key: &str,
        citations: Vec<SourceCitation>,
    ) -> Result<MessageId, TranscriptError> {
        let id = position_key
            .trim()
            .parse::<usize>()
            .ok()
            .and_then(|pos| self.id_at_position_from_end(pos))
            .cloned()
            .ok_or_else(|| TranscriptError::UnresolvedPosition(position_key.to_string()))?;
        self.citations.insert(id.clone(), citations);
        Ok(id)
    }

    /// Positional read. The position is evaluated against the transcript as
    /// it is now, so a key computed before N further appends lands N
    /// messages too late.
    pub fn read_citations(&self, position_from_end: usize) -> Option<&[SourceCitation]> {
        let id = self.id_at_position_from_end(position_from_end)?;
        self.citations_for(id)
    }

    pub fn citations_for(&self, id: &MessageId) -> Option<&[SourceCitation]> {
        self.citations.get(id).map(Vec::as_slice)
    }
}
