// src/services/message_pipeline.rs
// Send-message orchestration: validation, quota, attachments, persistence and generation
use crate::ai::bridge::AiBridge;
use crate::ai::{AiError, ChatTurn, CompletionRequest, ErrorCategory, ImageRef};
use crate::models::chat::{derive_title, Chat, ChatUpdate, FileUpload, Message, MessageRole, NewMessage, SendMessageRequest};
use crate::models::quota::LimitStatus;
use crate::services::chat_store::{ChatStore, StoreError};
use crate::services::file_ingestor::{decode_payload, FileIngestor, Fragment};
use crate::services::quota::QuotaTracker;
use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{0}")]
    Validation(String),
    #[error("chat {0} not found")]
    ChatNotFound(Uuid),
    #[error("message limit reached")]
    LimitReached(LimitStatus),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Messages of prior context sent to the model, the current one included.
    pub history_limit: usize,
    /// Minimum time between checkpoints of a streaming reply.
    pub flush_interval: Duration,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SendMessage {
    pub content: String,
    /// As sent by the client; checked in `prepare` so an unknown role is a validation error.
    pub role: Option<String>,
    pub files: Vec<FileUpload>,
}

impl From<SendMessageRequest> for SendMessage {
    fn from(request: SendMessageRequest) -> Self {
        Self {
            content: request.content,
            role: request.role,
            files: request.files,
        }
    }
}

/// Events of one streaming send, in emission order.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "userMessage")]
    UserMessage { message: Message },
    #[serde(rename = "aiMessageStart")]
    AiMessageStart { message_id: Uuid },
    #[serde(rename = "chunk")]
    Chunk { message_id: Uuid, delta: String, content: String },
    #[serde(rename = "complete")]
    Complete { message: Message },
    #[serde(rename = "error")]
    Error { message_id: Uuid, category: ErrorCategory, message: String },
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::UserMessage { .. } => "userMessage",
            StreamEvent::AiMessageStart { .. } => "aiMessageStart",
            StreamEvent::Chunk { .. } => "chunk",
            StreamEvent::Complete { .. } => "complete",
            StreamEvent::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Cancelled,
    Failed(ErrorCategory),
}

/// Result of a non-streaming send.
#[derive(Debug, Clone, Serialize)]
pub struct TurnResult {
    pub user_message: Message,
    pub assistant_message: Message,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCategory>,
}

/// A validated, persisted user turn with its placeholder reply, ready to stream.
pub struct StreamTurn {
    user_id: String,
    user_message: Message,
    placeholder: Message,
    request: CompletionRequest,
}

impl StreamTurn {
    pub fn placeholder_id(&self) -> Uuid {
        self.placeholder.id
    }

    pub fn user_message(&self) -> &Message {
        &self.user_message
    }
}

struct Prepared {
    chat: Chat,
    user_message: Message,
    /// What the model sees: the typed content plus extracted attachment text.
    model_content: String,
    images: Vec<ImageRef>,
}

/// In-flight accumulator for one streamed reply.
struct StreamSession {
    message_id: Uuid,
    buffer: String,
    cancel: CancellationToken,
    /// Buffer holds text not yet checkpointed.
    dirty: bool,
}

/// Runs an effect whose failure must not affect the response.
async fn best_effort<F, E>(label: &str, effect: F)
where
    F: Future<Output = Result<(), E>>,
    E: Display,
{
    if let Err(e) = effect.await {
        tracing::warn!("Best-effort {} failed: {}", label, e);
    }
}

pub struct MessagePipeline {
    store: Arc<dyn ChatStore>,
    quota: Arc<dyn QuotaTracker>,
    ingestor: Arc<dyn FileIngestor>,
    bridge: Arc<AiBridge>,
    settings: PipelineSettings,
}

impl MessagePipeline {
    pub fn new(
        store: Arc<dyn ChatStore>,
        quota: Arc<dyn QuotaTracker>,
        ingestor: Arc<dyn FileIngestor>,
        bridge: Arc<AiBridge>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            quota,
            ingestor,
            bridge,
            settings,
        }
    }

    /// Validation, quota gate, attachment ingestion and the user-message write.
    /// Nothing is persisted when this returns an error before the write.
    async fn prepare(&self, user_id: &str, chat_id: Uuid, request: SendMessage) -> Result<Prepared, PipelineError> {
        let role = match request.role.as_deref() {
            None => MessageRole::User,
            Some(raw) => raw
                .parse::<MessageRole>()
                .map_err(|_| PipelineError::Validation(format!("unknown message role: {}", raw)))?,
        };
        if role != MessageRole::User {
            return Err(PipelineError::Validation("only user messages can be sent".to_string()));
        }
        if request.content.trim().is_empty() && request.files.is_empty() {
            return Err(PipelineError::Validation(
                "message must have content or at least one file".to_string(),
            ));
        }

        let chat = self
            .store
            .find_chat_by_id(chat_id, user_id)
            .await?
            .ok_or(PipelineError::ChatNotFound(chat_id))?;

        match self.quota.check_limit(user_id).await {
            Ok(status) if !status.can_send => {
                tracing::info!("User {} reached message limit ({})", user_id, status.ceiling);
                return Err(PipelineError::LimitReached(status));
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Quota check failed for {}, allowing send: {}", user_id, e),
        }

        let (model_content, images) = self.ingest(&request.content, &request.files).await;

        let existing = self.store.count_messages(chat.id).await?;
        let user_message = self
            .store
            .create_message(NewMessage {
                chat_id: chat.id,
                role: MessageRole::User,
                content: request.content.clone(),
            })
            .await?;

        let title = (existing == 0).then(|| {
            if request.content.trim().is_empty() {
                derive_title(&request.files[0].filename)
            } else {
                derive_title(&request.content)
            }
        });
        self.store
            .update_chat(chat.id, ChatUpdate { title, updated_at: Utc::now() })
            .await?;

        Ok(Prepared {
            chat,
            user_message,
            model_content,
            images,
        })
    }

    /// Extracted text is appended to the model-facing copy only; a failing attachment is skipped.
    async fn ingest(&self, content: &str, files: &[FileUpload]) -> (String, Vec<ImageRef>) {
        let mut model_content = content.to_string();
        let mut images = Vec::new();

        for file in files {
            let bytes = match decode_payload(&file.data) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!("Skipping attachment {}: {}", file.filename, e);
                    continue;
                }
            };

            match self.ingestor.process(bytes, &file.filename, &file.mime_type).await {
                Ok(Fragment::Image(image)) => images.push(image),
                Ok(fragment) => {
                    if let Some(text) = fragment.context_text() {
                        if !model_content.is_empty() {
                            model_content.push_str("\n\n");
                        }
                        model_content.push_str(&text);
                    }
                }
                Err(e) => tracing::warn!("Skipping attachment {}: {}", file.filename, e),
            }
        }

        (model_content, images)
    }

    /// Recent history, oldest first, with the current turn carrying the enhanced content.
    async fn build_request(&self, prepared: &Prepared) -> CompletionRequest {
        let recent = match self
            .store
            .list_recent_messages(prepared.chat.id, self.settings.history_limit)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!("Could not load history for chat {}: {}", prepared.chat.id, e);
                Vec::new()
            }
        };

        let current = ChatTurn {
            role: MessageRole::User,
            content: prepared.model_content.clone(),
            images: prepared.images.clone(),
        };

        let mut turns = Vec::with_capacity(recent.len() + 1);
        let mut placed = false;
        for message in recent {
            if message.id == prepared.user_message.id {
                turns.push(current.clone());
                placed = true;
            } else if !message.content.trim().is_empty() {
                turns.push(ChatTurn::text(message.role, message.content));
            }
        }
        if !placed {
            turns.push(current);
        }

        CompletionRequest {
            model: prepared.chat.model.clone(),
            system: self.settings.system_prompt.clone(),
            messages: turns,
            max_tokens: self.settings.max_tokens,
        }
    }

    /// Non-streaming send. Generation failures become the assistant message's content.
    pub async fn send(&self, user_id: &str, chat_id: Uuid, request: SendMessage) -> Result<TurnResult, PipelineError> {
        let prepared = self.prepare(user_id, chat_id, request).await?;
        let completion_request = self.build_request(&prepared).await;

        let (content, error) = match self.bridge.generate(completion_request, user_id).await {
            Ok(completion) if !completion.content.trim().is_empty() => {
                tracing::debug!("Completion from {} ({:?} tokens)", completion.model, completion.tokens_used);
                (completion.content, None)
            }
            Ok(_) => failure_text(&AiError::Stream("empty completion".to_string())),
            Err(e) => failure_text(&e),
        };

        let assistant_message = self
            .store
            .create_message(NewMessage {
                chat_id: prepared.chat.id,
                role: MessageRole::Assistant,
                content,
            })
            .await?;

        if error.is_none() {
            best_effort("increment_usage", self.quota.increment_usage(user_id)).await;
        }

        Ok(TurnResult {
            user_message: prepared.user_message,
            assistant_message,
            error,
        })
    }

    /// Everything up to the placeholder reply. Errors here are returned to the caller directly.
    pub async fn begin_stream(&self, user_id: &str, chat_id: Uuid, request: SendMessage) -> Result<StreamTurn, PipelineError> {
        let prepared = self.prepare(user_id, chat_id, request).await?;
        let completion_request = self.build_request(&prepared).await;

        let placeholder = self
            .store
            .create_message(NewMessage {
                chat_id: prepared.chat.id,
                role: MessageRole::Assistant,
                content: String::new(),
            })
            .await?;

        Ok(StreamTurn {
            user_id: user_id.to_string(),
            user_message: prepared.user_message,
            placeholder,
            request: completion_request,
        })
    }

    /// Drives generation for a prepared turn and emits its events.
    ///
    /// A closed receiver counts as a disconnect and cancels `cancel`. After cancellation the partial
    /// reply is kept, usage is not counted and no `complete` event is sent.
    pub async fn run_stream(
        &self,
        turn: StreamTurn,
        events: UnboundedSender<StreamEvent>,
        cancel: CancellationToken,
    ) -> StreamOutcome {
        let emit = |event: StreamEvent| {
            if events.send(event).is_err() {
                cancel.cancel();
            }
        };

        emit(StreamEvent::UserMessage { message: turn.user_message.clone() });
        emit(StreamEvent::AiMessageStart { message_id: turn.placeholder.id });

        let mut session = StreamSession {
            message_id: turn.placeholder.id,
            buffer: String::new(),
            cancel: cancel.clone(),
            dirty: false,
        };

        let result = self.drive(&turn, &mut session, &emit).await;

        if session.cancel.is_cancelled() {
            tracing::info!(
                "Stream for message {} cancelled after {} chars",
                session.message_id,
                session.buffer.len()
            );
            if let Err(e) = self.store.update_message(session.message_id, &session.buffer).await {
                tracing::error!("Failed to persist partial reply {}: {}", session.message_id, e);
            }
            return StreamOutcome::Cancelled;
        }

        let result = result.and_then(|()| {
            if session.buffer.trim().is_empty() {
                Err(AiError::Stream("empty completion".to_string()))
            } else {
                Ok(())
            }
        });

        match result {
            Ok(()) => {
                if let Err(e) = self.store.update_message(session.message_id, &session.buffer).await {
                    tracing::error!("Failed to persist reply {}: {}", session.message_id, e);
                }
                let message = Message {
                    content: session.buffer,
                    ..turn.placeholder
                };
                emit(StreamEvent::Complete { message });
                best_effort("increment_usage", self.quota.increment_usage(&turn.user_id)).await;
                StreamOutcome::Completed
            }
            Err(e) => {
                let category = e.category();
                tracing::warn!("Generation failed for message {} ({:?}): {}", session.message_id, category, e);
                let text = e.user_message();
                if let Err(e) = self.store.update_message(session.message_id, &text).await {
                    tracing::error!("Failed to record error on message {}: {}", session.message_id, e);
                }
                emit(StreamEvent::Error {
                    message_id: session.message_id,
                    category,
                    message: text,
                });
                StreamOutcome::Failed(category)
            }
        }
    }

    async fn drive<F>(&self, turn: &StreamTurn, session: &mut StreamSession, emit: &F) -> Result<(), AiError>
    where
        F: Fn(StreamEvent),
    {
        let mut deltas = self
            .bridge
            .generate_streaming(turn.request.clone(), &turn.user_id, session.cancel.clone())
            .await?;

        // Checkpoint on a timer, not on delta arrival; a stalled provider must not leave the row empty
        let period = self.settings.flush_interval.max(Duration::from_millis(1));
        let mut checkpoints = tokio::time::interval(period);
        checkpoints.set_missed_tick_behavior(MissedTickBehavior::Delay);
        checkpoints.tick().await;

        loop {
            tokio::select! {
                next = deltas.next() => {
                    let Some(delta) = next else { break };
                    let delta = delta?;
                    session.buffer.push_str(&delta);
                    session.dirty = true;
                    emit(StreamEvent::Chunk {
                        message_id: session.message_id,
                        delta,
                        content: session.buffer.clone(),
                    });
                    if session.cancel.is_cancelled() {
                        break;
                    }
                }
                _ = checkpoints.tick() => {
                    if session.dirty {
                        self.checkpoint(session).await;
                    }
                }
            }
        }

        Ok(())
    }

    async fn checkpoint(&self, session: &mut StreamSession) {
        match self.store.update_message(session.message_id, &session.buffer).await {
            Ok(()) => session.dirty = false,
            Err(e) => tracing::warn!("Checkpoint of message {} failed: {}", session.message_id, e),
        }
    }
}

fn failure_text(error: &AiError) -> (String, Option<ErrorCategory>) {
    let category = error.category();
    tracing::warn!("Generation failed ({:?}): {}", category, error);
    (error.user_message(), Some(category))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::ProviderKind;
    use crate::ai::credentials::ProviderCredentialStore;
    use crate::models::chat::DEFAULT_CHAT_TITLE;
    use crate::models::quota::QuotaState;
    use crate::test_support::{harness, harness_with, BrokenQuota, Harness, ScriptedProvider, Step, TEST_USER};
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use tokio::sync::mpsc;

    fn text(content: &str) -> SendMessage {
        SendMessage {
            content: content.to_string(),
            role: None,
            files: Vec::new(),
        }
    }

    fn file(filename: &str, mime_type: &str, bytes: &[u8]) -> FileUpload {
        FileUpload {
            filename: filename.to_string(),
            mime_type: mime_type.to_string(),
            data: STANDARD.encode(bytes),
        }
    }

    async fn stream_all(h: &Harness, request: SendMessage) -> (StreamOutcome, Vec<StreamEvent>) {
        let turn = h.pipeline.begin_stream(TEST_USER, h.chat.id, request).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = h.pipeline.run_stream(turn, tx, CancellationToken::new()).await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (outcome, events)
    }

    async fn seed_exchange(h: &Harness, question: &str, answer: &str) {
        for (role, content) in [(MessageRole::User, question), (MessageRole::Assistant, answer)] {
            h.store
                .create_message(NewMessage { chat_id: h.chat.id, role, content: content.to_string() })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn streaming_send_end_to_end() {
        let h = harness(vec![Step::delta("Hel"), Step::delta("lo!")]).await;
        seed_exchange(&h, "earlier question", "earlier answer").await;
        h.quota
            .set_state(QuotaState {
                messages_used: 24,
                ..QuotaState::new_free(TEST_USER, Utc::now())
            })
            .await;

        let (outcome, events) = stream_all(&h, text("hi")).await;
        assert_eq!(outcome, StreamOutcome::Completed);
        assert_eq!(events.len(), 5);

        let StreamEvent::UserMessage { message: user } = &events[0] else {
            panic!("expected userMessage first, got {:?}", events[0]);
        };
        assert_eq!(user.content, "hi");
        let StreamEvent::AiMessageStart { message_id } = events[1] else {
            panic!("expected aiMessageStart second");
        };
        let cumulative: Vec<&str> = events[2..4]
            .iter()
            .map(|e| match e {
                StreamEvent::Chunk { content, .. } => content.as_str(),
                other => panic!("expected chunk, got {:?}", other),
            })
            .collect();
        assert_eq!(cumulative, vec!["Hel", "Hello!"]);
        let StreamEvent::Complete { message } = &events[4] else {
            panic!("expected complete last");
        };
        assert_eq!(message.id, message_id);
        assert_eq!(message.content, "Hello!");

        let stored = h.store.list_messages(h.chat.id).await.unwrap();
        assert_eq!(stored.last().unwrap().content, "Hello!");
        assert_eq!(h.quota.check_limit(TEST_USER).await.unwrap().remaining, 0);

        let sent = &h.provider.requests()[0];
        let contents: Vec<_> = sent.messages.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["earlier question", "earlier answer", "hi"]);
    }

    #[tokio::test]
    async fn attachment_text_reaches_model_but_not_transcript() {
        let h = harness(vec![Step::delta("Summary")]).await;
        let request = SendMessage {
            files: vec![file("notes.txt", "text/plain", b"SECRET123")],
            ..text("summarize")
        };

        let result = h.pipeline.send(TEST_USER, h.chat.id, request).await.unwrap();
        assert_eq!(result.user_message.content, "summarize");
        assert_eq!(result.assistant_message.content, "Summary");

        let stored = h.store.list_messages(h.chat.id).await.unwrap();
        assert_eq!(stored[0].content, "summarize");
        assert!(stored.iter().all(|m| !m.content.contains("SECRET123")));

        let model_turn = h.provider.requests()[0].messages.last().cloned().unwrap();
        assert!(model_turn.content.starts_with("summarize\n\n"));
        assert!(model_turn.content.contains("SECRET123"));
    }

    #[tokio::test]
    async fn cancellation_keeps_partial_reply_and_skips_usage() {
        let h = harness(vec![Step::delta("Hello "), Step::delta("wor"), Step::Stall]).await;
        let turn = h.pipeline.begin_stream(TEST_USER, h.chat.id, text("hi")).await.unwrap();
        let placeholder = turn.placeholder_id();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let consumer = async {
            let mut seen = Vec::new();
            while let Some(event) = rx.recv().await {
                if matches!(&event, StreamEvent::Chunk { content, .. } if content == "Hello wor") {
                    cancel.cancel();
                }
                seen.push(event);
            }
            seen
        };
        let (outcome, events) = tokio::join!(h.pipeline.run_stream(turn, tx, cancel.clone()), consumer);

        assert_eq!(outcome, StreamOutcome::Cancelled);
        assert!(events.iter().all(|e| !matches!(e, StreamEvent::Complete { .. } | StreamEvent::Error { .. })));
        let stored = h.store.list_messages(h.chat.id).await.unwrap();
        let reply = stored.iter().find(|m| m.id == placeholder).unwrap();
        assert_eq!(reply.content, "Hello wor");
        assert_eq!(h.quota.state(TEST_USER).await.unwrap().messages_used, 0);
    }

    #[tokio::test]
    async fn dropped_receiver_counts_as_disconnect() {
        let h = harness(vec![Step::delta("a"), Step::delta("b"), Step::Stall]).await;
        let turn = h.pipeline.begin_stream(TEST_USER, h.chat.id, text("hi")).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let outcome = h.pipeline.run_stream(turn, tx, CancellationToken::new()).await;
        assert_eq!(outcome, StreamOutcome::Cancelled);
        assert_eq!(h.quota.state(TEST_USER).await.unwrap().messages_used, 0);
    }

    #[tokio::test]
    async fn first_message_sets_title() {
        let h = harness(vec![Step::delta("ok")]).await;
        let long = "x".repeat(80);
        h.pipeline.send(TEST_USER, h.chat.id, text(&long)).await.unwrap();
        let chat = h.store.find_chat_by_id(h.chat.id, TEST_USER).await.unwrap().unwrap();
        assert_eq!(chat.title, format!("{}…", "x".repeat(50)));

        h.pipeline.send(TEST_USER, h.chat.id, text("second message")).await.unwrap();
        let chat = h.store.find_chat_by_id(h.chat.id, TEST_USER).await.unwrap().unwrap();
        assert_eq!(chat.title, format!("{}…", "x".repeat(50)));
        assert!(chat.updated_at >= h.chat.updated_at);

        let h = harness(vec![Step::delta("ok")]).await;
        let short = "y".repeat(30);
        h.pipeline.send(TEST_USER, h.chat.id, text(&short)).await.unwrap();
        let chat = h.store.find_chat_by_id(h.chat.id, TEST_USER).await.unwrap().unwrap();
        assert_eq!(chat.title, short);
    }

    #[tokio::test]
    async fn files_only_message_takes_title_from_filename_and_passes_images() {
        let h = harness(vec![Step::delta("a cat")]).await;
        let request = SendMessage {
            content: String::new(),
            role: None,
            files: vec![file("cat.png", "image/png", &[0x89, b'P', b'N', b'G'])],
        };
        h.pipeline.send(TEST_USER, h.chat.id, request).await.unwrap();

        let chat = h.store.find_chat_by_id(h.chat.id, TEST_USER).await.unwrap().unwrap();
        assert_eq!(chat.title, "cat.png");
        let turn = h.provider.requests()[0].messages.last().cloned().unwrap();
        assert_eq!(turn.images.len(), 1);
        assert_eq!(turn.images[0].media_type, "image/png");
    }

    #[tokio::test]
    async fn exhausted_quota_short_circuits_without_writes() {
        let h = harness(vec![Step::delta("never")]).await;
        h.quota
            .set_state(QuotaState {
                messages_used: 25,
                ..QuotaState::new_free(TEST_USER, Utc::now())
            })
            .await;

        let err = h.pipeline.send(TEST_USER, h.chat.id, text("hi")).await.unwrap_err();
        let PipelineError::LimitReached(status) = err else {
            panic!("expected limit reached, got {:?}", err);
        };
        assert_eq!(status.remaining, 0);
        assert_eq!(status.ceiling, 25);
        assert!(!status.is_premium_active);

        assert!(matches!(
            h.pipeline.begin_stream(TEST_USER, h.chat.id, text("hi")).await,
            Err(PipelineError::LimitReached(_))
        ));
        assert_eq!(h.store.count_messages(h.chat.id).await.unwrap(), 0);
        assert!(h.provider.requests().is_empty());
    }

    #[tokio::test]
    async fn provider_rate_limit_is_written_into_the_reply() {
        let provider = ScriptedProvider::rejecting(ProviderKind::Anthropic, 429, "rate limit exceeded");
        let h = harness_with(provider, None).await;

        let (outcome, events) = stream_all(&h, text("hi")).await;
        assert_eq!(outcome, StreamOutcome::Failed(ErrorCategory::RateLimited));
        assert_eq!(events.len(), 3);
        let StreamEvent::Error { message_id, category, message } = &events[2] else {
            panic!("expected error event last");
        };
        assert_eq!(*category, ErrorCategory::RateLimited);
        assert_eq!(message, ErrorCategory::RateLimited.user_message());

        let stored = h.store.list_messages(h.chat.id).await.unwrap();
        let reply = stored.iter().find(|m| m.id == *message_id).unwrap();
        assert_eq!(reply.content, ErrorCategory::RateLimited.user_message());
        assert_ne!(reply.content, ErrorCategory::Unknown.user_message());
        assert_eq!(h.quota.state(TEST_USER).await.unwrap().messages_used, 0);
    }

    #[tokio::test]
    async fn mid_stream_failure_replaces_partial_text_with_category() {
        let h = harness(vec![
            Step::delta("par"),
            Step::Error { status: 500, body: "upstream exploded".to_string() },
        ])
        .await;

        let (outcome, events) = stream_all(&h, text("hi")).await;
        assert_eq!(outcome, StreamOutcome::Failed(ErrorCategory::Unknown));
        let names: Vec<_> = events.iter().map(StreamEvent::name).collect();
        assert_eq!(names, vec!["userMessage", "aiMessageStart", "chunk", "error"]);

        let stored = h.store.list_messages(h.chat.id).await.unwrap();
        assert_eq!(stored.last().unwrap().content, ErrorCategory::Unknown.user_message());
    }

    #[tokio::test]
    async fn missing_key_is_reported_as_its_own_category() {
        let h = harness(vec![Step::delta("never")]).await;
        h.credentials.delete_key(TEST_USER, ProviderKind::Anthropic).await.unwrap();

        let result = h.pipeline.send(TEST_USER, h.chat.id, text("hi")).await.unwrap();
        assert_eq!(result.error, Some(ErrorCategory::MissingCredential));
        assert!(result.assistant_message.content.contains("Anthropic"));
        assert!(result.assistant_message.content.contains("configure your API key"));
        assert_eq!(h.quota.state(TEST_USER).await.unwrap().messages_used, 0);
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_before_any_write() {
        let h = harness(vec![Step::delta("never")]).await;

        let err = h.pipeline.send(TEST_USER, h.chat.id, text("   ")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));

        for role in ["assistant", "system"] {
            let request = SendMessage { role: Some(role.to_string()), ..text("hi") };
            let err = h.pipeline.send(TEST_USER, h.chat.id, request).await.unwrap_err();
            assert!(matches!(err, PipelineError::Validation(_)), "role {} accepted", role);
        }

        let err = h.pipeline.send("intruder", h.chat.id, text("hi")).await.unwrap_err();
        assert!(matches!(err, PipelineError::ChatNotFound(_)));

        assert_eq!(h.store.count_messages(h.chat.id).await.unwrap(), 0);
        let chat = h.store.find_chat_by_id(h.chat.id, TEST_USER).await.unwrap().unwrap();
        assert_eq!(chat.title, DEFAULT_CHAT_TITLE);
    }

    #[tokio::test]
    async fn quota_storage_failure_fails_open() {
        let provider = ScriptedProvider::new(ProviderKind::Anthropic, vec![Step::delta("still here")]);
        let h = harness_with(provider, Some(Arc::new(BrokenQuota) as Arc<dyn QuotaTracker>)).await;

        let result = h.pipeline.send(TEST_USER, h.chat.id, text("hi")).await.unwrap();
        assert_eq!(result.assistant_message.content, "still here");
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn broken_attachment_is_skipped() {
        let h = harness(vec![Step::delta("ok")]).await;
        let request = SendMessage {
            files: vec![
                FileUpload {
                    filename: "garbage.txt".to_string(),
                    mime_type: "text/plain".to_string(),
                    data: "%%% not base64 %%%".to_string(),
                },
                file("archive.zip", "application/zip", b"PK"),
            ],
            ..text("hello")
        };

        let result = h.pipeline.send(TEST_USER, h.chat.id, request).await.unwrap();
        assert!(result.error.is_none());
        assert_eq!(h.provider.requests()[0].messages.last().unwrap().content, "hello");
    }

    #[tokio::test]
    async fn history_skips_empty_rows_and_respects_the_window() {
        let h = harness(vec![Step::delta("ok")]).await;
        for i in 0..12 {
            seed_exchange(&h, &format!("q{}", i), if i == 11 { "" } else { "a" }).await;
        }

        h.pipeline.send(TEST_USER, h.chat.id, text("now")).await.unwrap();
        let turns = &h.provider.requests()[0].messages;
        // window of 10 includes the empty reply, which is dropped
        assert_eq!(turns.len(), 9);
        assert_eq!(turns.last().unwrap().content, "now");
        assert!(turns.iter().all(|t| !t.content.is_empty()));
    }

    #[tokio::test]
    async fn stalled_stream_still_checkpoints_partial_reply() {
        let h = harness(vec![Step::delta("a"), Step::delta("b"), Step::Stall]).await;
        let turn = h.pipeline.begin_stream(TEST_USER, h.chat.id, text("hi")).await.unwrap();
        let placeholder = turn.placeholder_id();
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        // flush interval is 1s; the provider has gone quiet well before this
        let observer = async {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            let stored = h.store.list_messages(h.chat.id).await.unwrap();
            let content = stored.into_iter().find(|m| m.id == placeholder).unwrap().content;
            cancel.cancel();
            content
        };
        let (outcome, mid_stream) = tokio::join!(h.pipeline.run_stream(turn, tx, cancel.clone()), observer);

        assert_eq!(mid_stream, "ab");
        assert_eq!(outcome, StreamOutcome::Cancelled);
    }

    #[tokio::test]
    async fn streamed_missing_key_names_the_provider() {
        let h = harness(vec![Step::delta("never")]).await;
        h.credentials.delete_key(TEST_USER, ProviderKind::Anthropic).await.unwrap();

        let (outcome, events) = stream_all(&h, text("hi")).await;
        assert_eq!(outcome, StreamOutcome::Failed(ErrorCategory::MissingCredential));
        let Some(StreamEvent::Error { message, .. }) = events.last() else {
            panic!("expected error event last");
        };
        assert!(message.contains("Anthropic"));
        let stored = h.store.list_messages(h.chat.id).await.unwrap();
        assert_eq!(&stored.last().unwrap().content, message);
    }

    #[test]
    fn events_serialize_with_type_tags() {
        let id = Uuid::new_v4();
        let event = StreamEvent::Chunk { message_id: id, delta: "lo!".into(), content: "Hello!".into() };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "chunk");
        assert_eq!(json["content"], "Hello!");

        let event = StreamEvent::Error {
            message_id: id,
            category: ErrorCategory::ModelUnavailable,
            message: "m".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["category"], "model_unavailable");
    }
}
