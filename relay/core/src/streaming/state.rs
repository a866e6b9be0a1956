//! Stream State
//!
//! The mutable record of one in-flight assistant response. Identity fields
//! are immutable; everything else sits behind a single per-stream lock that
//! is only ever held for in-memory bookkeeping, never across I/O.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::batching::estimate_tokens;
use crate::conversation::{ToolCall, ToolCallStatus};
use crate::hub::ConnectionId;
use crate::messages::{ConversationId, MessageId, ProjectId, UserId};

/// Result of appending a delta
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkProgress {
    /// Token estimate before this delta
    pub previous_count: u32,
    /// Token estimate after this delta
    pub token_count: u32,
    /// Whether this delta was the first one carrying content
    pub is_first_content_chunk: bool,
}

/// Result of detaching a connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetachOutcome {
    /// The connection was not attached
    NotAttached,
    /// Detached; other connections are still watching, or the stream is no longer active
    Detached,
    /// Detached the last active connection of an active stream
    ///
    /// Returned to exactly one caller per stream. That caller owns the
    /// transition to `interrupted`.
    LastActiveDetached,
}

/// Where a flush should go, captured under the lock
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveryTargets {
    /// Currently attached connections
    pub active: Vec<ConnectionId>,
    /// Whether any connection ever attached
    pub any_attached: bool,
}

/// Point-in-time copy of a stream's mutable fields
#[derive(Clone, Debug, PartialEq)]
pub struct StreamSnapshot {
    /// Accumulated content
    pub content: String,
    /// Running token estimate
    pub token_count: u32,
    /// Tool calls on the in-flight message
    pub tool_calls: Vec<ToolCall>,
    /// Whether the stream is still generating
    pub is_active: bool,
    /// When the last delta arrived
    pub last_chunk_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct StreamInner {
    content: String,
    token_count: u32,
    last_chunk_at: Option<DateTime<Utc>>,
    is_active: bool,
    seen_content: bool,
    active_connections: BTreeSet<ConnectionId>,
    all_connections: BTreeSet<ConnectionId>,
    tool_calls: Vec<ToolCall>,
    disconnect_interrupt_claimed: bool,
}

/// Mutable per-conversation stream record
#[derive(Debug)]
pub struct StreamState {
    conversation_id: ConversationId,
    user_id: UserId,
    project_id: ProjectId,
    message_id: MessageId,
    started_at: DateTime<Utc>,
    inner: Mutex<StreamInner>,
}

impl StreamState {
    /// Create an active stream, optionally seeded with the originating connection
    #[must_use]
    pub fn new(
        conversation_id: ConversationId,
        user_id: UserId,
        project_id: ProjectId,
        message_id: MessageId,
        origin: Option<ConnectionId>,
    ) -> Self {
        let mut inner = StreamInner {
            is_active: true,
            ..StreamInner::default()
        };
        if let Some(conn) = origin {
            inner.active_connections.insert(conn);
            inner.all_connections.insert(conn);
        }
        Self {
            conversation_id,
            user_id,
            project_id,
            message_id,
            started_at: Utc::now(),
            inner: Mutex::new(inner),
        }
    }

    /// Conversation this stream belongs to
    #[must_use]
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// User who started the stream
    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Project owning the conversation
    #[must_use]
    pub fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    /// Reserved ID of the in-flight assistant message
    #[must_use]
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    /// When the stream started
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Whether the stream is still generating
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.lock().is_active
    }

    /// Running token estimate
    #[must_use]
    pub fn token_count(&self) -> u32 {
        self.inner.lock().token_count
    }

    /// Copy of the accumulated content
    #[must_use]
    pub fn content(&self) -> String {
        self.inner.lock().content.clone()
    }

    /// Append a content delta and advance the token estimate
    ///
    /// Empty deltas still refresh the last-chunk time but never count as the
    /// first content chunk.
    pub fn append(&self, delta: &str) -> ChunkProgress {
        let mut inner = self.inner.lock();
        let previous_count = inner.token_count;
        inner.token_count = inner.token_count.saturating_add(estimate_tokens(delta));
        inner.last_chunk_at = Some(Utc::now());

        let is_first_content_chunk = !delta.is_empty() && !inner.seen_content;
        if !delta.is_empty() {
            inner.seen_content = true;
            inner.content.push_str(delta);
        }

        ChunkProgress {
            previous_count,
            token_count: inner.token_count,
            is_first_content_chunk,
        }
    }

    /// Attach a connection; returns `true` if it was not already attached
    pub fn attach(&self, conn: ConnectionId) -> bool {
        let mut inner = self.inner.lock();
        inner.all_connections.insert(conn);
        inner.active_connections.insert(conn)
    }

    /// Detach a connection
    ///
    /// The empty-set decision is made here, under the same lock that guards
    /// the connection sets, so concurrent detaches agree on a single winner.
    pub fn detach(&self, conn: ConnectionId) -> DetachOutcome {
        let mut inner = self.inner.lock();
        if !inner.active_connections.remove(&conn) {
            return DetachOutcome::NotAttached;
        }
        if inner.active_connections.is_empty()
            && inner.is_active
            && !inner.disconnect_interrupt_claimed
        {
            inner.disconnect_interrupt_claimed = true;
            return DetachOutcome::LastActiveDetached;
        }
        DetachOutcome::Detached
    }

    /// Flip `is_active` to false; returns `true` only for the call that flipped it
    pub fn deactivate(&self) -> bool {
        let mut inner = self.inner.lock();
        let was_active = inner.is_active;
        inner.is_active = false;
        was_active
    }

    /// Whether the connection is currently attached
    #[must_use]
    pub fn is_attached(&self, conn: ConnectionId) -> bool {
        self.inner.lock().active_connections.contains(&conn)
    }

    /// Whether the connection ever attached
    #[must_use]
    pub fn has_seen(&self, conn: ConnectionId) -> bool {
        self.inner.lock().all_connections.contains(&conn)
    }

    /// Currently attached connections
    #[must_use]
    pub fn active_connections(&self) -> Vec<ConnectionId> {
        self.inner.lock().active_connections.iter().copied().collect()
    }

    /// Every connection that ever attached
    #[must_use]
    pub fn all_connections(&self) -> Vec<ConnectionId> {
        self.inner.lock().all_connections.iter().copied().collect()
    }

    /// Delivery targets for the next send
    #[must_use]
    pub fn delivery_targets(&self) -> DeliveryTargets {
        let inner = self.inner.lock();
        DeliveryTargets {
            active: inner.active_connections.iter().copied().collect(),
            any_attached: !inner.all_connections.is_empty(),
        }
    }

    /// Add tool calls surfaced by the generator; calls with a known ID are ignored
    pub fn add_tool_calls(&self, calls: &[ToolCall]) -> Vec<ToolCall> {
        let mut inner = self.inner.lock();
        let mut added = Vec::new();
        for call in calls {
            if inner.tool_calls.iter().any(|c| c.id == call.id) {
                continue;
            }
            inner.tool_calls.push(call.clone());
            added.push(call.clone());
        }
        added
    }

    /// Update a tool call in place; returns the updated call
    pub fn update_tool_call(
        &self,
        id: &str,
        status: ToolCallStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Option<ToolCall> {
        let mut inner = self.inner.lock();
        let call = inner.tool_calls.iter_mut().find(|c| c.id == id)?;
        call.status = status;
        if result.is_some() {
            call.result = result;
        }
        if error.is_some() {
            call.error = error;
        }
        Some(call.clone())
    }

    /// Copy of the mutable fields
    #[must_use]
    pub fn snapshot(&self) -> StreamSnapshot {
        let inner = self.inner.lock();
        StreamSnapshot {
            content: inner.content.clone(),
            token_count: inner.token_count,
            tool_calls: inner.tool_calls.clone(),
            is_active: inner.is_active,
            last_chunk_at: inner.last_chunk_at,
        }
    }
}
