//! Conversation Status Machine
//!
//! Drives the persisted [`ConversationStatus`] through its legal transitions.
//! Every write is a compare-and-set against the statuses that may precede
//! the target, so writers racing each other can never regress a conversation
//! out of `completed`.
//!
//! Who writes `interrupted` on disconnect is decided by the stream itself
//! ([`DetachOutcome::LastActiveDetached`](crate::streaming::DetachOutcome));
//! this module only performs the durable write.

use std::sync::Arc;

use crate::conversation::ConversationStatus;
use crate::messages::ConversationId;
use crate::store::{ConversationStore, StoreError};
use crate::streaming::StreamRegistry;

/// Persisted status transitions
#[derive(Clone)]
pub struct StatusMachine {
    store: Arc<dyn ConversationStore>,
}

impl StatusMachine {
    /// Create a status machine over a store
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self { store }
    }

    /// Move to `next` from any legal predecessor
    ///
    /// Returns `false` (and writes nothing) when the current status cannot
    /// reach `next`.
    pub async fn transition(
        &self,
        conversation_id: &ConversationId,
        next: ConversationStatus,
    ) -> Result<bool, StoreError> {
        let expected = ConversationStatus::predecessors(next);
        let applied = self
            .store
            .update_conversation_status(conversation_id, &expected, next)
            .await?;
        if applied {
            tracing::info!(conversation_id = %conversation_id, status = %next, "Conversation status updated");
        } else {
            tracing::debug!(
                conversation_id = %conversation_id,
                status = %next,
                "Status transition skipped, current status is not a predecessor"
            );
        }
        Ok(applied)
    }

    /// A stream started: `idle | completed | interrupted → processing`
    pub async fn begin(&self, conversation_id: &ConversationId) -> Result<bool, StoreError> {
        self.transition(conversation_id, ConversationStatus::Processing).await
    }

    /// A stream ended and its reply was persisted: `processing | interrupted → completed`
    pub async fn complete(&self, conversation_id: &ConversationId) -> Result<bool, StoreError> {
        self.transition(conversation_id, ConversationStatus::Completed).await
    }

    /// A stream was aborted or lost every viewer: `processing → interrupted`
    pub async fn interrupt(&self, conversation_id: &ConversationId) -> Result<bool, StoreError> {
        self.transition(conversation_id, ConversationStatus::Interrupted).await
    }

    /// Current persisted status
    pub async fn current(&self, conversation_id: &ConversationId) -> Result<ConversationStatus, StoreError> {
        Ok(self.store.get_conversation(conversation_id).await?.status)
    }

    /// Mark `processing` conversations with no generating stream as `interrupted`
    ///
    /// Run at startup, before connections are accepted. Returns the IDs that
    /// were swept.
    pub async fn sweep_stale(&self, registry: &StreamRegistry) -> Result<Vec<ConversationId>, StoreError> {
        let processing = self
            .store
            .list_conversations_with_status(ConversationStatus::Processing)
            .await?;

        let mut swept = Vec::new();
        for conversation in processing {
            let live = registry
                .get(&conversation.id)
                .is_some_and(|s| s.is_active());
            if live {
                continue;
            }
            if self.interrupt(&conversation.id).await? {
                swept.push(conversation.id);
            }
        }

        if !swept.is_empty() {
            tracing::warn!(count = swept.len(), "Marked stale processing conversations interrupted");
        }
        Ok(swept)
    }
}

impl std::fmt::Debug for StatusMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusMachine").finish_non_exhaustive()
    }
}
