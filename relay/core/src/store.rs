//! Durable Conversation Store
//!
//! Plain CRUD over conversations and messages. The engine only ever persists
//! finished messages; partial output stays in memory.
//!
//! Status writes are compare-and-set: the caller names the statuses it
//! expects the row to be in, and the write is skipped otherwise. That keeps a
//! late writer from moving a `completed` conversation back to `interrupted`.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;

use crate::conversation::{Conversation, ConversationStatus, Message};
use crate::messages::ConversationId;

/// Store errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The conversation does not exist
    #[error("conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    /// A conversation with that ID already exists
    #[error("conversation already exists: {0}")]
    AlreadyExists(ConversationId),

    /// The backing store failed
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Durable storage for conversations and messages
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Insert a new conversation
    async fn create_conversation(&self, conversation: Conversation) -> Result<(), StoreError>;

    /// Fetch a conversation
    async fn get_conversation(&self, id: &ConversationId) -> Result<Conversation, StoreError>;

    /// Insert a message, replacing any stored message with the same ID
    async fn save_message(&self, message: Message) -> Result<(), StoreError>;

    /// Messages of a conversation in insertion order
    async fn get_messages(&self, id: &ConversationId) -> Result<Vec<Message>, StoreError>;

    /// Set `next` if the current status is one of `expected`
    ///
    /// Returns `false` when the current status did not match.
    async fn update_conversation_status(
        &self,
        id: &ConversationId,
        expected: &[ConversationStatus],
        next: ConversationStatus,
    ) -> Result<bool, StoreError>;

    /// Conversations currently in `status`
    async fn list_conversations_with_status(
        &self,
        status: ConversationStatus,
    ) -> Result<Vec<Conversation>, StoreError>;
}

/// In-memory store
#[derive(Debug, Default)]
pub struct InMemoryStore {
    conversations: DashMap<ConversationId, Conversation>,
    messages: DashMap<ConversationId, Vec<Message>>,
}

impl InMemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored conversations
    #[must_use]
    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn create_conversation(&self, conversation: Conversation) -> Result<(), StoreError> {
        let id = conversation.id.clone();
        match self.conversations.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::AlreadyExists(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(conversation);
                self.messages.entry(id).or_default();
                Ok(())
            }
        }
    }

    async fn get_conversation(&self, id: &ConversationId) -> Result<Conversation, StoreError> {
        self.conversations
            .get(id)
            .map(|c| c.clone())
            .ok_or_else(|| StoreError::ConversationNotFound(id.clone()))
    }

    async fn save_message(&self, message: Message) -> Result<(), StoreError> {
        let id = message.conversation_id.clone();
        {
            let mut conversation = self
                .conversations
                .get_mut(&id)
                .ok_or_else(|| StoreError::ConversationNotFound(id.clone()))?;
            conversation.updated_at = Utc::now();
        }

        let mut messages = self.messages.entry(id).or_default();
        match messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message,
            None => messages.push(message),
        }
        Ok(())
    }

    async fn get_messages(&self, id: &ConversationId) -> Result<Vec<Message>, StoreError> {
        if !self.conversations.contains_key(id) {
            return Err(StoreError::ConversationNotFound(id.clone()));
        }
        Ok(self.messages.get(id).map(|m| m.clone()).unwrap_or_default())
    }

    async fn update_conversation_status(
        &self,
        id: &ConversationId,
        expected: &[ConversationStatus],
        next: ConversationStatus,
    ) -> Result<bool, StoreError> {
        let mut conversation = self
            .conversations
            .get_mut(id)
            .ok_or_else(|| StoreError::ConversationNotFound(id.clone()))?;
        if !expected.contains(&conversation.status) {
            return Ok(false);
        }
        conversation.status = next;
        conversation.updated_at = Utc::now();
        Ok(true)
    }

    async fn list_conversations_with_status(
        &self,
        status: ConversationStatus,
    ) -> Result<Vec<Conversation>, StoreError> {
        Ok(self
            .conversations
            .iter()
            .filter(|c| c.status == status)
            .map(|c| c.clone())
            .collect())
    }
}
