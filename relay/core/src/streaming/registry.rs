//! Stream Registry
//!
//! Process-wide table from conversation ID to [`StreamState`], constructed
//! explicitly and torn down with [`StreamRegistry::shutdown`].
//!
//! The registry lock guards map membership only. Per-stream fields live
//! behind each state's own lock, so unrelated conversations never contend.
//! Completed streams stay resident for a grace period to serve late
//! reconnects, then a timer task removes them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::task::AbortHandle;

use super::state::StreamState;
use crate::hub::ConnectionId;
use crate::messages::{ConversationId, MessageId, ProjectId, UserId};

/// Default retention window for completed streams
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Errors from registry operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No stream is resident for the conversation
    #[error("no stream for conversation {0}")]
    NotFound(ConversationId),

    /// The conversation already has a generating stream
    #[error("conversation {0} already has an active stream")]
    StreamAlreadyActive(ConversationId),
}

struct Entry {
    state: Arc<StreamState>,
    pending_removal: Option<AbortHandle>,
}

impl Entry {
    fn cancel_pending_removal(&mut self) {
        if let Some(handle) = self.pending_removal.take() {
            handle.abort();
        }
    }
}

/// Conversation ID → stream state table
pub struct StreamRegistry {
    streams: Arc<RwLock<HashMap<ConversationId, Entry>>>,
    grace_period: Duration,
    total_started: AtomicU64,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

impl StreamRegistry {
    /// Create an empty registry with the given retention window
    #[must_use]
    pub fn new(grace_period: Duration) -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            grace_period,
            total_started: AtomicU64::new(0),
        }
    }

    /// Retention window for completed streams
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Insert a new stream for a conversation
    ///
    /// A stream still in its grace window is replaced and its pending removal
    /// cancelled. A stream that is still generating is left untouched and
    /// [`RegistryError::StreamAlreadyActive`] is returned.
    pub fn start(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        project_id: ProjectId,
        message_id: MessageId,
        origin: Option<ConnectionId>,
    ) -> Result<Arc<StreamState>, RegistryError> {
        let mut streams = self.streams.write();

        if let Some(existing) = streams.get_mut(&conversation_id) {
            if existing.state.is_active() {
                return Err(RegistryError::StreamAlreadyActive(conversation_id));
            }
            existing.cancel_pending_removal();
            tracing::debug!(
                conversation_id = %conversation_id,
                "Replacing completed stream inside its grace window"
            );
        }

        let state = Arc::new(StreamState::new(
            conversation_id.clone(),
            user_id,
            project_id,
            message_id,
            origin,
        ));
        streams.insert(
            conversation_id.clone(),
            Entry {
                state: Arc::clone(&state),
                pending_removal: None,
            },
        );
        self.total_started.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            conversation_id = %conversation_id,
            message_id = %state.message_id(),
            origin = ?origin,
            "Stream started"
        );
        Ok(state)
    }

    /// Look up a resident stream (active or within its grace window)
    #[must_use]
    pub fn get(&self, conversation_id: &ConversationId) -> Option<Arc<StreamState>> {
        self.streams
            .read()
            .get(conversation_id)
            .map(|e| Arc::clone(&e.state))
    }

    /// Look up a resident stream, failing with [`RegistryError::NotFound`]
    pub fn require(&self, conversation_id: &ConversationId) -> Result<Arc<StreamState>, RegistryError> {
        self.get(conversation_id)
            .ok_or_else(|| RegistryError::NotFound(conversation_id.clone()))
    }

    /// Mark a stream inactive and schedule its removal after the grace period
    pub fn mark_completed(&self, conversation_id: &ConversationId) -> Result<(), RegistryError> {
        let mut streams = self.streams.write();
        let entry = streams
            .get_mut(conversation_id)
            .ok_or_else(|| RegistryError::NotFound(conversation_id.clone()))?;

        entry.state.deactivate();
        entry.cancel_pending_removal();

        if self.grace_period.is_zero() {
            streams.remove(conversation_id);
            return Ok(());
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                conversation_id = %conversation_id,
                "No runtime to schedule stream removal, removing immediately"
            );
            streams.remove(conversation_id);
            return Ok(());
        };

        let map = Arc::clone(&self.streams);
        let target = Arc::clone(&entry.state);
        let key = conversation_id.clone();
        let grace = self.grace_period;
        let task = runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            let mut streams = map.write();
            let same_stream = streams
                .get(&key)
                .is_some_and(|e| Arc::ptr_eq(&e.state, &target));
            if same_stream {
                streams.remove(&key);
                tracing::debug!(conversation_id = %key, "Grace period elapsed, stream removed");
            }
        });
        entry.pending_removal = Some(task.abort_handle());

        tracing::debug!(
            conversation_id = %conversation_id,
            grace_ms = grace.as_millis() as u64,
            "Stream completed, removal scheduled"
        );
        Ok(())
    }

    /// Remove a stream immediately (fatal error path)
    pub fn delete(&self, conversation_id: &ConversationId) -> Option<Arc<StreamState>> {
        let mut entry = self.streams.write().remove(conversation_id)?;
        entry.cancel_pending_removal();
        entry.state.deactivate();
        tracing::debug!(conversation_id = %conversation_id, "Stream deleted");
        Some(entry.state)
    }

    /// Resident streams the connection is currently attached to
    #[must_use]
    pub fn streams_for_connection(&self, conn: ConnectionId) -> Vec<Arc<StreamState>> {
        let states: Vec<Arc<StreamState>> = self
            .streams
            .read()
            .values()
            .map(|e| Arc::clone(&e.state))
            .collect();
        states.into_iter().filter(|s| s.is_attached(conn)).collect()
    }

    /// IDs of conversations with a generating stream
    #[must_use]
    pub fn active_conversations(&self) -> Vec<ConversationId> {
        let states: Vec<Arc<StreamState>> = self
            .streams
            .read()
            .values()
            .map(|e| Arc::clone(&e.state))
            .collect();
        states
            .into_iter()
            .filter(|s| s.is_active())
            .map(|s| s.conversation_id().clone())
            .collect()
    }

    /// Check if a conversation has a resident stream
    #[must_use]
    pub fn contains(&self, conversation_id: &ConversationId) -> bool {
        self.streams.read().contains_key(conversation_id)
    }

    /// Number of resident streams
    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.read().len()
    }

    /// Check if no streams are resident
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.read().is_empty()
    }

    /// Total number of streams started (lifetime)
    #[must_use]
    pub fn total_started(&self) -> u64 {
        self.total_started.load(Ordering::Relaxed)
    }

    /// Drop every stream and cancel all pending removals
    ///
    /// Returns the number of streams that were resident.
    pub fn shutdown(&self) -> usize {
        let mut streams = self.streams.write();
        let count = streams.len();
        for (_, mut entry) in streams.drain() {
            entry.cancel_pending_removal();
            entry.state.deactivate();
        }
        tracing::info!(streams = count, "Stream registry shut down");
        count
    }
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("resident", &self.len())
            .field("grace_period", &self.grace_period)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(registry: &StreamRegistry, conv: &ConversationId) -> Result<Arc<StreamState>, RegistryError> {
        registry.start(
            conv.clone(),
            UserId::new(),
            ProjectId::new(),
            MessageId::new(),
            None,
        )
    }

    #[tokio::test]
    async fn test_start_get_delete() {
        let registry = StreamRegistry::default();
        let conv = ConversationId::new();
        let state = start(&registry, &conv).unwrap();

        assert!(registry.contains(&conv));
        assert!(Arc::ptr_eq(&registry.get(&conv).unwrap(), &state));
        assert_eq!(registry.active_conversations(), vec![conv.clone()]);

        let removed = registry.delete(&conv).unwrap();
        assert!(!removed.is_active());
        assert!(registry.get(&conv).is_none());
        assert_eq!(
            registry.require(&conv).unwrap_err(),
            RegistryError::NotFound(conv)
        );
    }

    #[tokio::test]
    async fn test_start_rejects_active_duplicate() {
        let registry = StreamRegistry::default();
        let conv = ConversationId::new();
        let first = start(&registry, &conv).unwrap();

        let err = start(&registry, &conv).unwrap_err();
        assert_eq!(err, RegistryError::StreamAlreadyActive(conv.clone()));
        assert!(Arc::ptr_eq(&registry.get(&conv).unwrap(), &first));
    }

    #[tokio::test]
    async fn test_completed_stream_removed_after_grace() {
        let registry = StreamRegistry::new(Duration::from_millis(50));
        let conv = ConversationId::new();
        start(&registry, &conv).unwrap();

        registry.mark_completed(&conv).unwrap();
        let resident = registry.get(&conv).unwrap();
        assert!(!resident.is_active());
        assert!(registry.active_conversations().is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(registry.get(&conv).is_none());
    }

    #[tokio::test]
    async fn test_restart_in_grace_window_cancels_removal() {
        let registry = StreamRegistry::new(Duration::from_millis(50));
        let conv = ConversationId::new();
        start(&registry, &conv).unwrap();
        registry.mark_completed(&conv).unwrap();

        let second = start(&registry, &conv).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let resident = registry.get(&conv).unwrap();
        assert!(Arc::ptr_eq(&resident, &second));
        assert!(resident.is_active());
        assert_eq!(registry.total_started(), 2);
    }

    #[tokio::test]
    async fn test_zero_grace_removes_immediately() {
        let registry = StreamRegistry::new(Duration::ZERO);
        let conv = ConversationId::new();
        start(&registry, &conv).unwrap();
        registry.mark_completed(&conv).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_mark_completed_without_runtime_removes() {
        let registry = StreamRegistry::default();
        let conv = ConversationId::new();
        start(&registry, &conv).unwrap();
        registry.mark_completed(&conv).unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_mark_completed_unknown() {
        let registry = StreamRegistry::default();
        let conv = ConversationId::new();
        assert_eq!(
            registry.mark_completed(&conv).unwrap_err(),
            RegistryError::NotFound(conv)
        );
    }

    #[tokio::test]
    async fn test_streams_for_connection() {
        let registry = StreamRegistry::default();
        let conn = ConnectionId::new();
        let conv_a = ConversationId::new();
        let conv_b = ConversationId::new();
        let a = registry
            .start(conv_a.clone(), UserId::new(), ProjectId::new(), MessageId::new(), Some(conn))
            .unwrap();
        start(&registry, &conv_b).unwrap();

        let attached = registry.streams_for_connection(conn);
        assert_eq!(attached.len(), 1);
        assert!(Arc::ptr_eq(&attached[0], &a));
    }

    #[tokio::test]
    async fn test_isolated_registries() {
        let one = StreamRegistry::default();
        let two = StreamRegistry::default();
        let conv = ConversationId::new();
        start(&one, &conv).unwrap();
        assert!(two.get(&conv).is_none());
    }

    #[tokio::test]
    async fn test_shutdown_clears_everything() {
        let registry = StreamRegistry::new(Duration::from_millis(20));
        let conv = ConversationId::new();
        let state = start(&registry, &conv).unwrap();
        start(&registry, &ConversationId::new()).unwrap();
        registry.mark_completed(&conv).unwrap();

        assert_eq!(registry.shutdown(), 2);
        assert!(registry.is_empty());
        assert!(!state.is_active());
    }
}
