//! Streaming Engine
//!
//! Wires the registry, batching policy, delivery router, tool coordinator,
//! status machine and reconciler into the operations a transport calls:
//! submit a user message, attach, detach, connection closed, load for
//! display.
//!
//! # Stream lifecycle
//!
//! ```text
//! submit_user_message
//!   ├─ registry.start (rejects a second active stream)
//!   ├─ persist user message, status → processing, emit user_message_sent
//!   └─ spawn drive task
//!        for each generator item:
//!          Delta  → append, run new tool calls, check budget, maybe flush
//!          Done   → final flush, persist, status → completed, grace period
//!          Error  → emit AI_RESPONSE_ERROR, status → interrupted, delete now
//! ```
//!
//! One task drives each stream. Attach and detach run on the transport's
//! tasks and only touch the stream under its own lock.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::batching::BatchingPolicy;
use crate::config::{DEFAULT_MAX_RESPONSE_TOKENS, DEFAULT_MODEL};
use crate::conversation::{Conversation, ConversationStatus, Message, MessageRole, ToolCall};
use crate::delivery::{DeliveryError, DeliveryRouter};
use crate::generator::{Generator, GeneratorError, GeneratorItem, GeneratorRequest};
use crate::hub::{ConnectionHub, ConnectionId};
use crate::messages::{ConversationId, ErrorCode, MessageId, ProjectId, RelayMessage, TokenUsage, UserId};
use crate::reconciler::{ConversationView, ReconcileError, Reconciler};
use crate::status::StatusMachine;
use crate::store::{ConversationStore, StoreError};
use crate::streaming::{DetachOutcome, RegistryError, StreamRegistry, StreamState};
use crate::tools::{ToolCoordinator, ToolRegistry, DEFAULT_TOOL_TIMEOUT};

/// Metadata key recording why a persisted message was cut short
pub const INTERRUPTED_METADATA_KEY: &str = "interrupted";

/// Metadata key holding token usage on persisted assistant messages
pub const USAGE_METADATA_KEY: &str = "usage";

/// Engine settings
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// When to flush accumulated content
    pub batching: BatchingPolicy,
    /// Bound on one tool execution
    pub tool_timeout: Duration,
    /// Abort a response once its token estimate exceeds this
    pub max_response_tokens: u32,
    /// Model passed to the generator
    pub model: String,
    /// System prompt passed to the generator
    pub system_prompt: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batching: BatchingPolicy::default(),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            max_response_tokens: DEFAULT_MAX_RESPONSE_TOKENS,
            model: DEFAULT_MODEL.to_string(),
            system_prompt: None,
        }
    }
}

/// Engine errors returned to the transport
#[derive(Debug, Error)]
pub enum EngineError {
    /// The conversation belongs to another user
    #[error("conversation {conversation_id} does not belong to user {user_id}")]
    Forbidden {
        /// Requested conversation
        conversation_id: ConversationId,
        /// Requesting user
        user_id: UserId,
    },

    /// Store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Registry failure (e.g. a stream is already generating)
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Reconciliation failure
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    /// The drive task panicked or was cancelled
    #[error("stream task failed: {0}")]
    TaskFailed(String),
}

/// A user message to answer
#[derive(Debug, Clone)]
pub struct SendMessage {
    /// Target conversation
    pub conversation_id: ConversationId,
    /// Sending user (must own the conversation)
    pub user_id: UserId,
    /// Message text
    pub content: String,
    /// Connection the message arrived on; attached to the new stream
    pub origin: Option<ConnectionId>,
}

/// How a stream ended
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    /// Generation finished and the reply was persisted
    Completed {
        /// Persisted assistant message ID
        message_id: MessageId,
        /// Final content
        content: String,
    },
    /// The token budget was exceeded; partial content was persisted
    TokenLimitExceeded {
        /// Persisted assistant message ID
        message_id: MessageId,
        /// Partial content
        content: String,
    },
    /// The generator failed; nothing was persisted
    GeneratorFailed(GeneratorError),
    /// Generation finished but the reply could not be persisted
    PersistFailed(StoreError),
}

/// Handle to a submitted message's stream
#[derive(Debug)]
pub struct StreamTicket {
    /// The persisted user message
    pub user_message: Message,
    /// Reserved ID of the assistant reply
    pub message_id: MessageId,
    handle: JoinHandle<StreamOutcome>,
}

impl StreamTicket {
    /// Wait for the stream to end
    pub async fn wait(self) -> Result<StreamOutcome, EngineError> {
        self.handle
            .await
            .map_err(|e| EngineError::TaskFailed(e.to_string()))
    }

    /// Whether the drive task has ended
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

enum Consumed {
    Done(Option<TokenUsage>),
    OverBudget,
}

struct EngineInner {
    config: EngineConfig,
    registry: Arc<StreamRegistry>,
    router: DeliveryRouter,
    store: Arc<dyn ConversationStore>,
    generator: Arc<dyn Generator>,
    tools: ToolCoordinator,
    status: StatusMachine,
    reconciler: Reconciler,
}

/// The streaming delivery engine
///
/// Cloning is cheap and shares all state.
#[derive(Clone)]
pub struct StreamingEngine {
    inner: Arc<EngineInner>,
}

impl StreamingEngine {
    /// Create an engine
    pub fn new(
        config: EngineConfig,
        registry: Arc<StreamRegistry>,
        hub: Arc<dyn ConnectionHub>,
        store: Arc<dyn ConversationStore>,
        generator: Arc<dyn Generator>,
        tools: Arc<dyn ToolRegistry>,
    ) -> Self {
        let router = DeliveryRouter::new(hub, Arc::clone(&registry));
        let tools = ToolCoordinator::new(tools, config.tool_timeout);
        let status = StatusMachine::new(Arc::clone(&store));
        let reconciler = Reconciler::new(Arc::clone(&store), Arc::clone(&registry));
        Self {
            inner: Arc::new(EngineInner {
                config,
                registry,
                router,
                store,
                generator,
                tools,
                status,
                reconciler,
            }),
        }
    }

    /// Engine settings
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The stream registry
    #[must_use]
    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.inner.registry
    }

    /// The status machine
    #[must_use]
    pub fn status(&self) -> &StatusMachine {
        &self.inner.status
    }

    /// Create and persist a new conversation
    pub async fn create_conversation(
        &self,
        project_id: ProjectId,
        user_id: UserId,
        title: impl Into<String>,
    ) -> Result<Conversation, EngineError> {
        let conversation = Conversation::new(project_id, user_id, title);
        self.inner.store.create_conversation(conversation.clone()).await?;
        tracing::info!(
            conversation_id = %conversation.id,
            project_id = %conversation.project_id,
            "Conversation created"
        );
        Ok(conversation)
    }

    /// Persist a user message and start streaming the reply
    pub async fn submit_user_message(&self, request: SendMessage) -> Result<StreamTicket, EngineError> {
        let inner = &self.inner;
        let conversation_id = request.conversation_id.clone();

        let conversation = inner.store.get_conversation(&conversation_id).await?;
        if !conversation.is_owned_by(&request.user_id) {
            return Err(EngineError::Forbidden {
                conversation_id,
                user_id: request.user_id,
            });
        }
        let mut history = inner.store.get_messages(&conversation_id).await?;

        let message_id = MessageId::new();
        let state = inner.registry.start(
            conversation_id.clone(),
            request.user_id.clone(),
            conversation.project_id.clone(),
            message_id.clone(),
            request.origin,
        )?;

        let user_message = Message::new(conversation_id.clone(), MessageRole::User, request.content);
        let prepared = async {
            inner.store.save_message(user_message.clone()).await?;
            inner.status.begin(&conversation_id).await?;
            Ok::<(), StoreError>(())
        }
        .await;
        if let Err(e) = prepared {
            inner.registry.delete(&conversation_id);
            return Err(e.into());
        }
        // An origin that left before `begin` found nothing to interrupt
        if request.origin.is_some() && state.active_connections().is_empty() {
            inner.status.interrupt(&conversation_id).await?;
        }

        self.deliver(
            &state,
            RelayMessage::UserMessageSent {
                conversation_id: conversation_id.clone(),
                message: user_message.clone(),
            },
        )
        .await;

        history.push(user_message.clone());
        let generator_request = GeneratorRequest {
            conversation_id: conversation_id.clone(),
            model: inner.config.model.clone(),
            system: inner.config.system_prompt.clone(),
            history,
            max_tokens: inner.config.max_response_tokens,
        };

        tracing::info!(
            conversation_id = %conversation_id,
            message_id = %message_id,
            generator = inner.generator.name(),
            "Streaming reply"
        );

        let engine = self.clone();
        let handle = tokio::spawn(async move { engine.drive(state, generator_request).await });

        Ok(StreamTicket {
            user_message,
            message_id,
            handle,
        })
    }

    async fn drive(&self, state: Arc<StreamState>, request: GeneratorRequest) -> StreamOutcome {
        let inner = &self.inner;
        let rx = match inner.generator.generate(&request).await {
            Ok(rx) => rx,
            Err(e) => return self.fail_generation(&state, e).await,
        };
        match self.consume(&state, rx).await {
            Ok(Consumed::Done(usage)) => self.finish(&state, usage).await,
            Ok(Consumed::OverBudget) => self.abort_token_limit(&state).await,
            Err(e) => self.fail_generation(&state, e).await,
        }
    }

    /// Feed generator items into the stream
    ///
    /// Dropping `rx` on return cancels the generator.
    async fn consume(
        &self,
        state: &StreamState,
        mut rx: mpsc::Receiver<GeneratorItem>,
    ) -> Result<Consumed, GeneratorError> {
        let inner = &self.inner;
        loop {
            match rx.recv().await {
                Some(GeneratorItem::Delta(chunk)) => {
                    let progress = state.append(&chunk.content);

                    if !chunk.tool_calls.is_empty() {
                        let added = state.add_tool_calls(&chunk.tool_calls);
                        if !added.is_empty() {
                            inner.tools.run(state, &inner.router, added).await;
                        }
                    }

                    if progress.token_count > inner.config.max_response_tokens {
                        return Ok(Consumed::OverBudget);
                    }

                    let flush = inner.config.batching.decide(
                        progress.previous_count,
                        progress.token_count,
                        progress.is_first_content_chunk,
                        false,
                    );
                    if flush {
                        self.flush(state, false, None).await;
                    }
                }
                Some(GeneratorItem::Done { usage }) => return Ok(Consumed::Done(usage)),
                Some(GeneratorItem::Error(e)) => return Err(e),
                None => return Err(GeneratorError::UnexpectedEnd),
            }
        }
    }

    async fn flush(&self, state: &StreamState, done: bool, reported: Option<TokenUsage>) {
        let snapshot = state.snapshot();
        let usage = TokenUsage::estimated(snapshot.token_count).merge_reported(reported);
        let tool_calls = (!snapshot.tool_calls.is_empty()).then_some(snapshot.tool_calls);
        self.deliver(
            state,
            RelayMessage::AssistantResponse {
                conversation_id: state.conversation_id().clone(),
                message_id: state.message_id().clone(),
                content: snapshot.content,
                done,
                tool_calls,
                usage,
            },
        )
        .await;
    }

    async fn finish(&self, state: &StreamState, reported: Option<TokenUsage>) -> StreamOutcome {
        let inner = &self.inner;
        let conversation_id = state.conversation_id();

        self.flush(state, true, reported).await;

        let snapshot = state.snapshot();
        let usage = TokenUsage::estimated(snapshot.token_count).merge_reported(reported);
        let message = self.assistant_message(state, snapshot.content.clone(), snapshot.tool_calls, usage);

        if let Err(e) = inner.store.save_message(message).await {
            tracing::error!(
                conversation_id = %conversation_id,
                message_id = %state.message_id(),
                error = %e,
                "Failed to persist assistant reply"
            );
            self.emit_error(state, ErrorCode::ExecutionError, format!("failed to save reply: {e}"))
                .await;
            self.write_status(conversation_id, ConversationStatus::Interrupted).await;
            self.retire(state);
            return StreamOutcome::PersistFailed(e);
        }

        self.write_status(conversation_id, ConversationStatus::Completed).await;
        self.retire(state);

        tracing::info!(
            conversation_id = %conversation_id,
            message_id = %state.message_id(),
            tokens = snapshot.token_count,
            "Stream completed"
        );
        StreamOutcome::Completed {
            message_id: state.message_id().clone(),
            content: snapshot.content,
        }
    }

    async fn abort_token_limit(&self, state: &StreamState) -> StreamOutcome {
        let inner = &self.inner;
        let conversation_id = state.conversation_id();
        let snapshot = state.snapshot();

        tracing::warn!(
            conversation_id = %conversation_id,
            tokens = snapshot.token_count,
            limit = inner.config.max_response_tokens,
            "Response exceeded token budget, aborting"
        );
        self.emit_error(
            state,
            ErrorCode::TokenLimitExceeded,
            format!(
                "response exceeded the limit of {} tokens",
                inner.config.max_response_tokens
            ),
        )
        .await;

        let message = self
            .assistant_message(
                state,
                snapshot.content.clone(),
                snapshot.tool_calls,
                TokenUsage::estimated(snapshot.token_count),
            )
            .with_metadata(
                INTERRUPTED_METADATA_KEY,
                serde_json::Value::String(ErrorCode::TokenLimitExceeded.as_str().to_string()),
            );
        if let Err(e) = inner.store.save_message(message).await {
            tracing::error!(
                conversation_id = %conversation_id,
                error = %e,
                "Failed to persist partial reply"
            );
        }

        self.write_status(conversation_id, ConversationStatus::Interrupted).await;
        self.retire(state);

        StreamOutcome::TokenLimitExceeded {
            message_id: state.message_id().clone(),
            content: snapshot.content,
        }
    }

    async fn fail_generation(&self, state: &StreamState, error: GeneratorError) -> StreamOutcome {
        let conversation_id = state.conversation_id();
        tracing::error!(
            conversation_id = %conversation_id,
            error = %error,
            "Generator failed, aborting stream"
        );
        self.emit_error(state, ErrorCode::AiResponseError, error.to_string())
            .await;
        self.write_status(conversation_id, ConversationStatus::Interrupted).await;
        self.inner.registry.delete(conversation_id);
        StreamOutcome::GeneratorFailed(error)
    }

    fn assistant_message(
        &self,
        state: &StreamState,
        content: String,
        tool_calls: Vec<ToolCall>,
        usage: TokenUsage,
    ) -> Message {
        let mut message = Message::with_id(
            state.message_id().clone(),
            state.conversation_id().clone(),
            MessageRole::Assistant,
            content,
        );
        message.tool_calls = tool_calls;
        if let Ok(usage) = serde_json::to_value(usage) {
            message = message.with_metadata(USAGE_METADATA_KEY, usage);
        }
        message
    }

    /// Mark the stream completed, starting its grace period
    fn retire(&self, state: &StreamState) {
        if let Err(e) = self.inner.registry.mark_completed(state.conversation_id()) {
            tracing::warn!(
                conversation_id = %state.conversation_id(),
                error = %e,
                "Stream vanished before completion"
            );
        }
    }

    async fn write_status(&self, conversation_id: &ConversationId, next: ConversationStatus) {
        if let Err(e) = self.inner.status.transition(conversation_id, next).await {
            tracing::error!(
                conversation_id = %conversation_id,
                status = %next,
                error = %e,
                "Failed to write conversation status"
            );
        }
    }

    async fn emit_error(&self, state: &StreamState, code: ErrorCode, message: String) {
        self.deliver(
            state,
            RelayMessage::Error {
                conversation_id: state.conversation_id().clone(),
                code,
                message,
            },
        )
        .await;
    }

    async fn deliver(&self, state: &StreamState, event: RelayMessage) {
        let kind = event.kind();
        match self.inner.router.send_to_stream(state, event).await {
            Ok(report) if !report.failed.is_empty() => {
                tracing::debug!(
                    conversation_id = %state.conversation_id(),
                    event = kind,
                    delivered = report.delivered,
                    failed = report.failed.len(),
                    "Partial delivery"
                );
            }
            Ok(_) => {}
            Err(DeliveryError::NoSubscriber(_)) => {
                tracing::debug!(
                    conversation_id = %state.conversation_id(),
                    event = kind,
                    "No subscriber, continuing"
                );
            }
            Err(e) => {
                tracing::warn!(
                    conversation_id = %state.conversation_id(),
                    event = kind,
                    error = %e,
                    "Delivery failed"
                );
            }
        }
    }

    /// Attach a connection to a conversation's resident stream
    ///
    /// The connection immediately receives a snapshot of the content so far.
    /// Returns `false` when no stream is resident (the client should load the
    /// conversation instead).
    pub async fn attach(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        conn: ConnectionId,
    ) -> Result<bool, EngineError> {
        let conversation = self.inner.store.get_conversation(conversation_id).await?;
        if !conversation.is_owned_by(user_id) {
            return Err(EngineError::Forbidden {
                conversation_id: conversation_id.clone(),
                user_id: user_id.clone(),
            });
        }

        let Some(state) = self.inner.registry.get(conversation_id) else {
            return Ok(false);
        };
        let newly_attached = state.attach(conn);
        tracing::info!(
            conversation_id = %conversation_id,
            connection_id = %conn,
            newly_attached,
            "Connection attached to stream"
        );

        let snapshot = state.snapshot();
        let catch_up = RelayMessage::AssistantResponse {
            conversation_id: conversation_id.clone(),
            message_id: state.message_id().clone(),
            content: snapshot.content,
            done: !snapshot.is_active,
            tool_calls: (!snapshot.tool_calls.is_empty()).then_some(snapshot.tool_calls),
            usage: TokenUsage::estimated(snapshot.token_count),
        };
        if let Err(e) = self.inner.router.send_to_connection(conn, catch_up).await {
            tracing::debug!(connection_id = %conn, error = %e, "Catch-up snapshot not delivered");
        }
        Ok(true)
    }

    /// Detach a connection from a conversation's stream
    ///
    /// When this removes the last attached connection of a generating stream,
    /// the conversation is marked `interrupted` before returning. Generation
    /// itself continues and the reply is still persisted.
    pub async fn detach(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        conn: ConnectionId,
    ) -> Result<DetachOutcome, EngineError> {
        let Some(state) = self.inner.registry.get(conversation_id) else {
            return Ok(DetachOutcome::NotAttached);
        };
        if state.user_id() != user_id {
            return Err(EngineError::Forbidden {
                conversation_id: conversation_id.clone(),
                user_id: user_id.clone(),
            });
        }
        self.detach_state(&state, conn).await
    }

    async fn detach_state(&self, state: &StreamState, conn: ConnectionId) -> Result<DetachOutcome, EngineError> {
        let outcome = state.detach(conn);
        tracing::info!(
            conversation_id = %state.conversation_id(),
            connection_id = %conn,
            outcome = ?outcome,
            "Connection detached from stream"
        );
        if outcome == DetachOutcome::LastActiveDetached {
            self.inner.status.interrupt(state.conversation_id()).await?;
        }
        Ok(outcome)
    }

    /// Detach a closed connection from every stream it was attached to
    pub async fn connection_closed(&self, conn: ConnectionId) -> Vec<(ConversationId, DetachOutcome)> {
        let mut results = Vec::new();
        for state in self.inner.registry.streams_for_connection(conn) {
            match self.detach_state(&state, conn).await {
                Ok(outcome) => results.push((state.conversation_id().clone(), outcome)),
                Err(e) => tracing::error!(
                    conversation_id = %state.conversation_id(),
                    connection_id = %conn,
                    error = %e,
                    "Failed to detach closed connection"
                ),
            }
        }
        results
    }

    /// Durable history merged with any resident stream
    pub async fn load_for_display(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<ConversationView, EngineError> {
        Ok(self
            .inner
            .reconciler
            .load_for_display(conversation_id, user_id)
            .await?)
    }

    /// Mark `processing` conversations without a live stream `interrupted`
    pub async fn sweep_stale_processing(&self) -> Result<Vec<ConversationId>, EngineError> {
        Ok(self.inner.status.sweep_stale(&self.inner.registry).await?)
    }

    /// Drop all resident streams
    pub fn shutdown(&self) -> usize {
        self.inner.registry.shutdown()
    }
}

impl std::fmt::Debug for StreamingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingEngine")
            .field("config", &self.inner.config)
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}
