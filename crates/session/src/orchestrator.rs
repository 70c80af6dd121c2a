//! Turn orchestration.
//!
//! A [`ChatSession`] runs one turn at a time against an [`AgentBackend`]:
//! it appends the user's message optimistically, sends the history, and
//! grows the transcript from the reply. Observers follow along through a
//! broadcast channel of [`SessionEvent`]s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::client::{
    AgentBackend, AgentReply, BatchReply, HttpAgentClient, IncrementalReply, TokenStream,
};
use crate::config::ChatConfig;
use crate::error::{ProtocolViolation, SessionError};
use crate::logging::{TurnLogger, TurnRecord, TurnStatus};
use crate::steps::{decode_citations_header, pair_tool_exchanges};
use crate::transcript::Transcript;
use crate::types::{EntryBody, MessageId, SourceCitation, TranscriptEntry, TurnMode};

const EVENT_CAPACITY: usize = 256;

/// Why a submission was ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Busy,
    EmptyInput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed {
        mode: TurnMode,
        steps: usize,
        citations: usize,
    },
    /// The stream was stopped; tokens received so far were kept.
    Stopped { tokens: usize },
    Rejected(RejectReason),
}

/// Change notifications. Each one means "re-render".
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    EntryAppended { id: MessageId },
    TokenAppended { id: MessageId, token: String },
    CitationsAttached { id: MessageId, count: usize },
    TurnFailed { message: String },
    TurnFinished { outcome: TurnOutcome },
}

#[derive(Debug, Default)]
struct TurnStats {
    steps: usize,
    citations: usize,
    tokens: usize,
}

/// Holds the busy flag for the duration of a turn.
struct BusyGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct ChatSession {
    config: Arc<ChatConfig>,
    backend: Arc<dyn AgentBackend>,
    transcript: RwLock<Transcript>,
    busy: AtomicBool,
    reveal_steps: AtomicBool,
    draft: Mutex<String>,
    cancel: Mutex<Option<CancellationToken>>,
    events: broadcast::Sender<SessionEvent>,
    turn_log: TurnLogger,
}

impl ChatSession {
    pub fn new(config: ChatConfig, backend: Arc<dyn AgentBackend>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            reveal_steps: AtomicBool::new(config.session.reveal_steps),
            turn_log: TurnLogger::new(config.logging.turn_log.clone()),
            config: Arc::new(config),
            backend,
            transcript: RwLock::new(Transcript::new()),
            busy: AtomicBool::new(false),
            draft: Mutex::new(String::new()),
            cancel: Mutex::new(None),
            events,
        }
    }

    /// A session talking HTTP to the configured endpoint.
    pub fn connect(config: ChatConfig) -> Result<Self, SessionError> {
        let client = HttpAgentClient::new(&config.agent)?;
        Ok(Self::new(config, Arc::new(client)))
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn reveal_steps(&self) -> bool {
        self.reveal_steps.load(Ordering::Acquire)
    }

    /// Flip the "show intermediate steps" toggle. Not allowed mid-turn.
    pub fn set_reveal_steps(&self, on: bool) -> Result<(), SessionError> {
        if self.is_busy() {
            return Err(SessionError::Busy);
        }
        self.reveal_steps.store(on, Ordering::Release);
        tracing::debug!(reveal_steps = on, "reveal toggle changed");
        Ok(())
    }

    /// The mode the next [`submit_draft`](Self::submit_draft) will use.
    pub fn mode(&self) -> TurnMode {
        TurnMode::from_reveal_steps(self.reveal_steps())
    }

    pub fn draft(&self) -> String {
        self.draft.lock().clone()
    }

    pub fn set_draft(&self, text: impl Into<String>) {
        *self.draft.lock() = text.into();
    }

    pub fn transcript(&self) -> Transcript {
        self.transcript.read().clone()
    }

    pub fn with_transcript<R>(&self, f: impl FnOnce(&Transcript) -> R) -> R {
        f(&*self.transcript.read())
    }

    pub fn entry(&self, id: &MessageId) -> Option<TranscriptEntry> {
        self.transcript.read().get(id).cloned()
    }

    pub fn citations_for(&self, id: &MessageId) -> Option<Vec<SourceCitation>> {
        self.transcript.read().citations_for(id).map(<[_]>::to_vec)
    }

    /// Turns that reached the turn log, rejected submissions excluded.
    pub async fn turn_count(&self) -> u64 {
        self.turn_log.turn_count().await
    }

    /// Cancel the stream in flight. Returns false when there is none.
    pub fn stop(&self) -> bool {
        match self.cancel.lock().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Submit the composer draft in the current mode.
    pub async fn submit_draft(&self) -> Result<TurnOutcome, SessionError> {
        let input = self.draft();
        self.submit(&input, self.mode()).await
    }

    /// Run one turn.
    ///
    /// Blank input and submissions during another turn are rejected without
    /// touching any state. Otherwise the user message is appended before the
    /// request goes out and stays in the transcript whatever happens next.
    pub async fn submit(&self, input: &str, mode: TurnMode) -> Result<TurnOutcome, SessionError> {
        if input.trim().is_empty() {
            return Ok(TurnOutcome::Rejected(RejectReason::EmptyInput));
        }
        let Some(guard) = BusyGuard::acquire(&self.busy) else {
            tracing::debug!("submission ignored, turn in progress");
            return Ok(TurnOutcome::Rejected(RejectReason::Busy));
        };

        let started = tokio::time::Instant::now();
        tracing::info!(mode = %mode, "turn started");

        self.append(EntryBody::User(input.to_string()));
        self.draft.lock().clear();

        let mut stats = TurnStats::default();
        let result = self.run_turn(mode, &mut stats).await;
        drop(guard);

        let duration_ms = started.elapsed().as_millis() as u64;
        let status = match &result {
            Ok(TurnOutcome::Stopped { .. }) => TurnStatus::Stopped,
            Ok(_) => TurnStatus::Completed,
            Err(_) => TurnStatus::Failed,
        };
        let mut record = TurnRecord::new(mode, status, duration_ms);
        record.steps = stats.steps;
        record.citations = stats.citations;
        record.tokens = stats.tokens;
        record.error = result.as_ref().err().map(SessionError::user_message);
        self.turn_log.log(&record).await;

        match result {
            Ok(outcome) => {
                tracing::info!(mode = %mode, duration_ms, steps = stats.steps, "turn finished");
                self.emit(SessionEvent::TurnFinished {
                    outcome: outcome.clone(),
                });
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!(mode = %mode, duration_ms, "turn failed: {}", e);
                self.emit(SessionEvent::TurnFailed {
                    message: e.user_message(),
                });
                Err(e)
            }
        }
    }

    /// Only streaming turns register a cancellation token, so `stop()` is a
    /// no-op while a structured turn runs.
    async fn run_turn(&self, mode: TurnMode, stats: &mut TurnStats) -> Result<TurnOutcome, SessionError> {
        let cancel = CancellationToken::new();
        if mode == TurnMode::Streaming {
            *self.cancel.lock() = Some(cancel.clone());
        }
        let result = self.exchange(mode, &cancel, stats).await;
        *self.cancel.lock() = None;
        result
    }

    async fn exchange(
        &self,
        mode: TurnMode,
        cancel: &CancellationToken,
        stats: &mut TurnStats,
    ) -> Result<TurnOutcome, SessionError> {
        let wire = self.transcript.read().to_wire();
        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("stopped before the agent answered");
                return Ok(TurnOutcome::Stopped { tokens: 0 });
            }
            reply = self.backend.send(&wire, mode) => reply?,
        };

        match reply {
            AgentReply::Incremental(reply) => self.follow_stream(reply, cancel, stats).await,
            AgentReply::Batch(reply) => self.reveal_steps_then_answer(reply, stats).await,
        }
    }

    async fn reveal_steps_then_answer(
        &self,
        reply: BatchReply,
        stats: &mut TurnStats,
    ) -> Result<TurnOutcome, SessionError> {
        let steps = pair_tool_exchanges(&reply.messages)?;
        let answer = reply
            .messages
            .last()
            .map(|m| m.content.clone())
            .ok_or(ProtocolViolation::EmptyResponse)?;

        for step in steps {
            let tool = step.action.name.clone();
            let id = self.append(EntryBody::Step(step));
            stats.steps += 1;
            let delay = self.config.pacing.sample();
            tracing::debug!(id = %id, tool = %tool, delay_ms = delay.as_millis() as u64, "step revealed");
            tokio::time::sleep(delay).await;
        }

        self.append(EntryBody::Assistant(answer));

        Ok(TurnOutcome::Completed {
            mode: TurnMode::Structured,
            steps: stats.steps,
            citations: 0,
        })
    }

    async fn follow_stream(
        &self,
        reply: IncrementalReply,
        cancel: &CancellationToken,
        stats: &mut TurnStats,
    ) -> Result<TurnOutcome, SessionError> {
        let IncrementalReply {
            sources,
            message_index,
            tokens,
        } = reply;

        let id = self.transcript.write().begin_stream();
        self.emit(SessionEvent::EntryAppended { id: id.clone() });

        if let Some(raw) = sources {
            self.attach_header_citations(&raw, message_index.as_deref(), stats);
        }

        let result = self.pump_tokens(&id, tokens, cancel, stats).await;
        self.transcript.write().seal(&id);
        result
    }

    async fn pump_tokens(
        &self,
        id: &MessageId,
        mut tokens: TokenStream,
        cancel: &CancellationToken,
        stats: &mut TurnStats,
    ) -> Result<TurnOutcome, SessionError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(id = %id, tokens = stats.tokens, "stream stopped");
                    return Ok(TurnOutcome::Stopped { tokens: stats.tokens });
                }
                next = tokens.next() => next,
            };

            match next {
                Some(Ok(token)) => {
                    self.transcript.write().append_token(id, &token)?;
                    stats.tokens += 1;
                    self.emit(SessionEvent::TokenAppended {
                        id: id.clone(),
                        token,
                    });
                }
                Some(Err(e)) => {
                    tracing::warn!(id = %id, tokens = stats.tokens, "stream ended early: {}", e);
                    return Err(e);
                }
                None => break,
            }
        }

        Ok(TurnOutcome::Completed {
            mode: TurnMode::Streaming,
            steps: 0,
            citations: stats.citations,
        })
    }

    fn attach_header_citations(&self, raw: &str, key: Option<&str>, stats: &mut TurnStats) {
        let citations = match decode_citations_header(raw) {
            Ok(citations) => citations,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring undecodable sources header");
                return;
            }
        };
        if citations.is_empty() {
            return;
        }
        let Some(key) = key else {
            tracing::warn!(count = citations.len(), "sources header without a message index");
            return;
        };

        let count = citations.len();
        let attached = self.transcript.write().attach_citations(key, citations);
        match attached {
            Ok(id) => {
                stats.citations = count;
                tracing::debug!(id = %id, key, count, "citations attached");
                self.emit(SessionEvent::CitationsAttached { id, count });
            }
            Err(e) => tracing::warn!(key, "dropping citations: {}", e),
        }
    }

    fn append(&self, body: EntryBody) -> MessageId {
        let id = self.transcript.write().append(body);
        self.emit(SessionEvent::EntryAppended { id: id.clone() });
        id
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PacingConfig;
    use crate::steps::{encode_citations_header, UNPARSEABLE_STEP};
    use crate::types::{Message, Role, ToolCall};
    use async_trait::async_trait;
    use futures::channel::mpsc;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::time::Duration;

    enum Scripted {
        Stream {
            sources: Option<String>,
            index: Option<String>,
            tokens: TokenStream,
        },
        Batch(Result<BatchReply, SessionError>),
    }

    #[derive(Default)]
    struct ScriptedBackend {
        replies: Mutex<VecDeque<Scripted>>,
        requests: Mutex<Vec<Vec<crate::types::Message>>>,
    }

    impl ScriptedBackend {
        fn with(replies: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn next(&self, messages: &[crate::types::Message]) -> Option<Scripted> {
            self.requests.lock().push(messages.to_vec());
            self.replies.lock().pop_front()
        }
    }

    #[async_trait]
    impl AgentBackend for ScriptedBackend {
        async fn open_stream(
            &self,
            messages: &[crate::types::Message],
        ) -> Result<IncrementalReply, SessionError> {
            match self.next(messages) {
                Some(Scripted::Stream {
                    sources,
                    index,
                    tokens,
                }) => Ok(IncrementalReply {
                    sources,
                    message_index: index,
                    tokens,
                }),
                _ => Err(SessionError::Transport("no scripted stream".into())),
            }
        }

        async fn fetch_batch(
            &self,
            messages: &[crate::types::Message],
        ) -> Result<BatchReply, SessionError> {
            match self.next(messages) {
                Some(Scripted::Batch(reply)) => reply,
                _ => Err(SessionError::Transport("no scripted batch".into())),
            }
        }
    }

    fn batch(messages: Vec<Message>) -> Scripted {
        Scripted::Batch(Ok(BatchReply { messages }))
    }

    fn tokens(parts: &[&str]) -> TokenStream {
        let items: Vec<Result<String, SessionError>> =
            parts.iter().map(|p| Ok(p.to_string())).collect();
        futures::stream::iter(items).boxed()
    }

    fn search_call(query: &str) -> Message {
        let mut args = serde_json::Map::new();
        args.insert("query".into(), json!(query));
        Message::assistant_tool_calls(vec![ToolCall::new("search_latest_knowledge", args)])
    }

    fn citation(text: &str) -> SourceCitation {
        SourceCitation {
            page_content: text.into(),
            metadata: json!({}),
        }
    }

    fn session(backend: Arc<ScriptedBackend>) -> ChatSession {
        ChatSession::new(ChatConfig::default(), backend)
    }

    fn bodies(session: &ChatSession) -> Vec<EntryBody> {
        session
            .transcript()
            .entries()
            .iter()
            .map(|e| e.body.clone())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn structured_turn_reveals_steps_then_answer() {
        let backend = ScriptedBackend::with(vec![batch(vec![
            Message::user("q"),
            search_call("retrieval"),
            Message::tool("passages"),
            Message::assistant("You can use retrievers."),
        ])]);
        let session = session(backend.clone());

        let started = tokio::time::Instant::now();
        let outcome = session.submit("q", TurnMode::Structured).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(
            outcome,
            TurnOutcome::Completed {
                mode: TurnMode::Structured,
                steps: 1,
                citations: 0
            }
        );
        assert!(elapsed >= Duration::from_millis(1000), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(2000), "{:?}", elapsed);

        let entries = bodies(&session);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], EntryBody::User("q".into()));
        match &entries[1] {
            EntryBody::Step(step) => {
                assert_eq!(step.action.name, "search_latest_knowledge");
                assert_eq!(step.observation, "passages");
            }
            other => panic!("expected a step, got {:?}", other),
        }
        assert_eq!(entries[2], EntryBody::Assistant("You can use retrievers.".into()));
        assert!(!session.is_busy());

        let sent = backend.requests.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].len(), 1);
        assert_eq!(sent[0][0].role, Role::User);
    }

    #[tokio::test(start_paused = true)]
    async fn every_step_waits_before_the_next() {
        let backend = ScriptedBackend::with(vec![batch(vec![
            search_call("a"),
            Message::tool("ra"),
            search_call("b"),
            Message::tool("rb"),
            Message::assistant("done"),
        ])]);
        let session = session(backend);

        let started = tokio::time::Instant::now();
        session.submit("q", TurnMode::Structured).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(2000));
        assert_eq!(session.transcript().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn steps_are_visible_while_paced_and_stop_does_not_apply() {
        let backend = ScriptedBackend::with(vec![batch(vec![
            search_call("a"),
            Message::tool("ra"),
            search_call("b"),
            Message::tool("rb"),
            Message::assistant("done"),
        ])]);
        let session = Arc::new(session(backend));

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.submit("q", TurnMode::Structured).await }
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        let shown = bodies(&session);
        assert_eq!(shown.len(), 2);
        assert!(matches!(&shown[1], EntryBody::Step(step) if step.observation == "ra"));
        assert!(session.is_busy());
        assert!(!session.stop());

        let second = session.submit("again", TurnMode::Structured).await.unwrap();
        assert_eq!(second, TurnOutcome::Rejected(RejectReason::Busy));
        assert_eq!(session.transcript().len(), 2);

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            TurnOutcome::Completed {
                mode: TurnMode::Structured,
                steps: 2,
                citations: 0
            }
        );
        assert_eq!(session.transcript().len(), 4);
    }

    /// Answers in batch form whatever mode was asked for.
    struct BatchOnlyBackend;

    #[async_trait]
    impl AgentBackend for BatchOnlyBackend {
        async fn open_stream(
            &self,
            _messages: &[crate::types::Message],
        ) -> Result<IncrementalReply, SessionError> {
            Err(SessionError::Transport("streaming unsupported".into()))
        }

        async fn fetch_batch(
            &self,
            _messages: &[crate::types::Message],
        ) -> Result<BatchReply, SessionError> {
            Err(SessionError::Transport("use send".into()))
        }

        async fn send(
            &self,
            _messages: &[crate::types::Message],
            _mode: TurnMode,
        ) -> Result<AgentReply, SessionError> {
            Ok(AgentReply::Batch(BatchReply {
                messages: vec![Message::assistant("batched")],
            }))
        }
    }

    #[tokio::test]
    async fn turn_follows_the_reply_shape() {
        let session = ChatSession::new(ChatConfig::default(), Arc::new(BatchOnlyBackend));

        let outcome = session.submit("q", TurnMode::Streaming).await.unwrap();

        assert_eq!(
            outcome,
            TurnOutcome::Completed {
                mode: TurnMode::Structured,
                steps: 0,
                citations: 0
            }
        );
        assert_eq!(
            bodies(&session),
            vec![
                EntryBody::User("q".into()),
                EntryBody::Assistant("batched".into())
            ]
        );
        assert!(!session.stop());
    }

    #[tokio::test]
    async fn final_answer_is_last_message_even_without_steps() {
        let backend = ScriptedBackend::with(vec![batch(vec![
            Message::user("q"),
            Message::assistant("direct answer"),
        ])]);
        let session = session(backend);
        session.submit("q", TurnMode::Structured).await.unwrap();
        assert_eq!(
            bodies(&session),
            vec![
                EntryBody::User("q".into()),
                EntryBody::Assistant("direct answer".into())
            ]
        );
    }

    #[tokio::test]
    async fn odd_exchanges_reject_turn_but_keep_user_message() {
        let backend = ScriptedBackend::with(vec![batch(vec![
            search_call("a"),
            Message::tool("ra"),
            search_call("b"),
            Message::assistant("final"),
        ])]);
        let session = session(backend);
        let mut events = session.subscribe();

        let err = session.submit("q", TurnMode::Structured).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolViolation::OddExchangeCount { count: 3 })
        ));
        assert_eq!(bodies(&session), vec![EntryBody::User("q".into())]);
        assert!(!session.is_busy());

        let mut failed = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::TurnFailed { .. }) {
                failed = true;
            }
        }
        assert!(failed);
    }

    #[tokio::test]
    async fn empty_structured_reply_is_a_protocol_error() {
        let backend = ScriptedBackend::with(vec![batch(vec![])]);
        let session = session(backend);
        let err = session.submit("q", TurnMode::Structured).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolViolation::EmptyResponse)
        ));
        assert_eq!(session.transcript().len(), 1);
    }

    #[tokio::test]
    async fn upstream_error_surfaces_text() {
        let backend = ScriptedBackend::with(vec![Scripted::Batch(Err(SessionError::Upstream(
            "boom".into(),
        )))]);
        let session = session(backend);
        let err = session.submit("q", TurnMode::Structured).await.unwrap_err();
        assert_eq!(err.user_message(), "boom");
        assert_eq!(bodies(&session), vec![EntryBody::User("q".into())]);
    }

    #[tokio::test]
    async fn blank_input_is_rejected_without_state_change() {
        let backend = ScriptedBackend::with(vec![]);
        let session = session(backend.clone());
        session.set_draft("   ");
        let outcome = session.submit_draft().await.unwrap();
        assert_eq!(outcome, TurnOutcome::Rejected(RejectReason::EmptyInput));
        assert!(session.transcript().is_empty());
        assert_eq!(session.draft(), "   ");
        assert!(backend.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn submit_draft_clears_draft_and_follows_toggle() {
        let backend = ScriptedBackend::with(vec![Scripted::Stream {
            sources: None,
            index: None,
            tokens: tokens(&["hi"]),
        }]);
        let session = session(backend);
        session.set_reveal_steps(false).unwrap();
        assert_eq!(session.mode(), TurnMode::Streaming);

        session.set_draft("hello");
        let outcome = session.submit_draft().await.unwrap();
        assert!(matches!(
            outcome,
            TurnOutcome::Completed {
                mode: TurnMode::Streaming,
                ..
            }
        ));
        assert_eq!(session.draft(), "");
    }

    #[tokio::test]
    async fn streaming_turn_accumulates_tokens_and_citations() {
        let header = encode_citations_header(&[citation("one"), citation("two")]);
        let backend = ScriptedBackend::with(vec![Scripted::Stream {
            sources: Some(header),
            index: Some("0".into()),
            tokens: tokens(&["Retrieval ", "uses ", "retrievers."]),
        }]);
        let session = session(backend);
        let mut events = session.subscribe();

        let outcome = session.submit("q", TurnMode::Streaming).await.unwrap();
        assert_eq!(
            outcome,
            TurnOutcome::Completed {
                mode: TurnMode::Streaming,
                steps: 0,
                citations: 2
            }
        );

        let transcript = session.transcript();
        let answer = transcript.last().unwrap();
        assert_eq!(
            answer.body,
            EntryBody::Assistant("Retrieval uses retrievers.".into())
        );
        assert!(!transcript.is_streaming());
        let cited = transcript.read_citations(0).unwrap();
        assert_eq!(cited.len(), 2);
        assert_eq!(cited[0].page_content, "one");
        assert_eq!(session.citations_for(&answer.id).unwrap().len(), 2);

        let mut token_events = 0;
        let mut attached = None;
        while let Ok(event) = events.try_recv() {
            match event {
                SessionEvent::TokenAppended { .. } => token_events += 1,
                SessionEvent::CitationsAttached { id, count } => attached = Some((id, count)),
                _ => {}
            }
        }
        assert_eq!(token_events, 3);
        assert_eq!(attached, Some((answer.id.clone(), 2)));
    }

    #[tokio::test]
    async fn undecodable_sources_header_is_ignored() {
        let backend = ScriptedBackend::with(vec![Scripted::Stream {
            sources: Some("not base64 !!".into()),
            index: Some("0".into()),
            tokens: tokens(&["still ", "here"]),
        }]);
        let session = session(backend);
        let outcome = session.submit("q", TurnMode::Streaming).await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Completed { citations: 0, .. }));
        assert_eq!(
            session.transcript().last().unwrap().body,
            EntryBody::Assistant("still here".into())
        );
        assert!(session.transcript().read_citations(0).is_none());
    }

    #[tokio::test]
    async fn stream_error_keeps_partial_tokens() {
        let items: Vec<Result<String, SessionError>> = vec![
            Ok("partial".into()),
            Err(SessionError::Transport("reset".into())),
        ];
        let backend = ScriptedBackend::with(vec![Scripted::Stream {
            sources: None,
            index: None,
            tokens: futures::stream::iter(items).boxed(),
        }]);
        let session = session(backend);
        let err = session.submit("q", TurnMode::Streaming).await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));

        let transcript = session.transcript();
        assert_eq!(transcript.len(), 2);
        assert_eq!(
            transcript.last().unwrap().body,
            EntryBody::Assistant("partial".into())
        );
        assert!(!transcript.is_streaming());
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn stop_keeps_received_tokens() {
        let (tx, rx) = mpsc::unbounded::<Result<String, SessionError>>();
        let backend = ScriptedBackend::with(vec![Scripted::Stream {
            sources: None,
            index: None,
            tokens: rx.boxed(),
        }]);
        let session = Arc::new(session(backend));
        let mut events = session.subscribe();

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.submit("q", TurnMode::Streaming).await }
        });

        tx.unbounded_send(Ok("Hel".into())).unwrap();
        tx.unbounded_send(Ok("lo".into())).unwrap();
        let mut seen = 0;
        while seen < 2 {
            if let SessionEvent::TokenAppended { .. } = events.recv().await.unwrap() {
                seen += 1;
            }
        }

        assert!(session.stop());
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome, TurnOutcome::Stopped { tokens: 2 });
        assert_eq!(
            session.transcript().last().unwrap().body,
            EntryBody::Assistant("Hello".into())
        );
        assert!(!session.is_busy());
        assert!(!session.stop());
    }

    #[tokio::test]
    async fn second_submit_while_busy_is_a_no_op() {
        let (tx, rx) = mpsc::unbounded::<Result<String, SessionError>>();
        let backend = ScriptedBackend::with(vec![Scripted::Stream {
            sources: None,
            index: None,
            tokens: rx.boxed(),
        }]);
        let session = Arc::new(session(backend.clone()));
        let mut events = session.subscribe();

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.submit("first", TurnMode::Streaming).await }
        });

        // The in-progress assistant message exists once the reply has started.
        let mut appended = 0;
        while appended < 2 {
            if let SessionEvent::EntryAppended { .. } = events.recv().await.unwrap() {
                appended += 1;
            }
        }
        assert!(session.is_busy());
        let len_before = session.transcript().len();

        let outcome = session.submit("second", TurnMode::Streaming).await.unwrap();
        assert_eq!(outcome, TurnOutcome::Rejected(RejectReason::Busy));
        assert_eq!(session.transcript().len(), len_before);
        assert!(matches!(
            session.set_reveal_steps(true),
            Err(SessionError::Busy)
        ));

        drop(tx);
        task.await.unwrap().unwrap();
        assert!(!session.is_busy());
        assert_eq!(backend.requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn history_is_resent_with_steps_as_system_messages() {
        let backend = ScriptedBackend::with(vec![
            batch(vec![search_call("a"), Message::tool("ra"), Message::assistant("one")]),
            batch(vec![Message::assistant("two")]),
        ]);
        let mut config = ChatConfig::default();
        config.pacing = PacingConfig { min_ms: 0, max_ms: 1 };
        let session = ChatSession::new(config, backend.clone());

        session.submit("q1", TurnMode::Structured).await.unwrap();
        session.submit("q2", TurnMode::Structured).await.unwrap();

        let sent = backend.requests.lock();
        let roles: Vec<Role> = sent[1].iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::System, Role::Assistant, Role::User]
        );
        let ids: Vec<&str> = sent[1].iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1", "2", "3"]);
    }

    #[tokio::test]
    async fn malformed_system_entries_survive_history() {
        let backend = ScriptedBackend::with(vec![]);
        let session = session(backend);
        session
            .transcript
            .write()
            .append_message(Message::system("{not a step"));
        let entry = session.transcript().last().cloned().unwrap();
        assert_eq!(
            crate::steps::render_entry(&entry),
            crate::steps::EntryView::Placeholder(UNPARSEABLE_STEP)
        );
    }

    #[tokio::test]
    async fn turns_are_logged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("turns.jsonl");
        let mut config = ChatConfig::default();
        config.logging.turn_log = Some(path.clone());
        let backend = ScriptedBackend::with(vec![Scripted::Stream {
            sources: None,
            index: None,
            tokens: tokens(&["a", "b"]),
        }]);
        let session = ChatSession::new(config, backend);

        session.submit("q", TurnMode::Streaming).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(content.contains("\"mode\":\"streaming\""));
        assert!(content.contains("\"tokens\":2"));

        session.submit("  ", TurnMode::Streaming).await.unwrap();
        assert_eq!(session.turn_count().await, 1);
    }
}
