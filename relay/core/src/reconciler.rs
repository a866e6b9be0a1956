//! Reconciler
//!
//! Builds the view a (re)connecting client renders: durable history merged
//! with whatever is still in memory for the conversation's stream.
//!
//! The in-flight assistant message is keyed by its reserved ID, so the merge
//! never produces two messages with the same ID:
//!
//! - not yet persisted: a transient assistant message is synthesized from
//!   the stream state
//! - already persisted: the durable copy is kept, with its content refreshed
//!   from memory only when the in-memory content is strictly longer (a read
//!   that raced a persist still in flight)

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::conversation::{Conversation, Message, MessageRole};
use crate::messages::{ConversationId, MessageId, UserId};
use crate::store::{ConversationStore, StoreError};
use crate::streaming::StreamRegistry;

/// Metadata key marking a message synthesized from in-memory stream state
pub const TRANSIENT_METADATA_KEY: &str = "transient";

/// Reconciliation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    /// The conversation belongs to another user
    #[error("conversation {conversation_id} does not belong to user {user_id}")]
    Forbidden {
        /// Requested conversation
        conversation_id: ConversationId,
        /// Requesting user
        user_id: UserId,
    },

    /// The store failed (including a missing conversation)
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Live stream information attached to a view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamingInfo {
    /// Reserved ID of the in-flight message
    pub message_id: MessageId,
    /// Whether the stream is still generating
    pub is_active: bool,
    /// Running token estimate
    pub token_count: u32,
    /// Whether the message in the view was synthesized from memory
    pub synthesized: bool,
}

/// What a client renders for a conversation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationView {
    /// The durable conversation
    pub conversation: Conversation,
    /// Messages in display order, the in-flight one last
    pub messages: Vec<Message>,
    /// Present when a stream is resident for the conversation
    pub streaming: Option<StreamingInfo>,
}

/// Merges durable history with resident stream state
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn ConversationStore>,
    registry: Arc<StreamRegistry>,
}

impl Reconciler {
    /// Create a reconciler
    pub fn new(store: Arc<dyn ConversationStore>, registry: Arc<StreamRegistry>) -> Self {
        Self { store, registry }
    }

    /// Load a conversation for display on behalf of `user_id`
    pub async fn load_for_display(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<ConversationView, ReconcileError> {
        let conversation = self.store.get_conversation(conversation_id).await?;
        if !conversation.is_owned_by(user_id) {
            return Err(ReconcileError::Forbidden {
                conversation_id: conversation_id.clone(),
                user_id: user_id.clone(),
            });
        }
        let mut messages = self.store.get_messages(conversation_id).await?;

        // Read the registry after the store: a stream that completes and
        // persists in between is then found in `messages` and not duplicated.
        let Some(state) = self.registry.get(conversation_id) else {
            return Ok(ConversationView {
                conversation,
                messages,
                streaming: None,
            });
        };
        let snapshot = state.snapshot();

        let synthesized = match messages.iter_mut().find(|m| &m.id == state.message_id()) {
            Some(existing) => {
                if snapshot.content.len() > existing.content.len() {
                    existing.content = snapshot.content.clone();
                }
                false
            }
            None => {
                let mut message = Message::with_id(
                    state.message_id().clone(),
                    conversation_id.clone(),
                    MessageRole::Assistant,
                    snapshot.content.clone(),
                )
                .with_metadata(TRANSIENT_METADATA_KEY, serde_json::Value::Bool(true));
                message.tool_calls = snapshot.tool_calls.clone();
                message.created_at = state.started_at();
                messages.push(message);
                true
            }
        };

        tracing::debug!(
            conversation_id = %conversation_id,
            message_id = %state.message_id(),
            synthesized,
            is_active = snapshot.is_active,
            "Merged resident stream into conversation view"
        );

        Ok(ConversationView {
            conversation,
            messages,
            streaming: Some(StreamingInfo {
                message_id: state.message_id().clone(),
                is_active: snapshot.is_active,
                token_count: snapshot.token_count,
                synthesized,
            }),
        })
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
