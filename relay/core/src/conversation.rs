//! Conversation Model
//!
//! Durable records: conversations, messages, and the tool calls embedded in
//! assistant messages. The in-flight assistant message is not one of these
//! until its stream ends; until then it lives in a
//! [`StreamState`](crate::streaming::StreamState) under a reserved
//! [`MessageId`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::messages::{ConversationId, MessageId, ProjectId, UserId};

/// Persisted conversation status
///
/// ```text
/// idle ──► processing ──► completed ──► processing (next turn)
///              │               ▲
///              ▼               │
///         interrupted ─────────┘
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    /// No turn has been processed yet
    #[default]
    Idle,
    /// A stream is generating a reply
    Processing,
    /// The last stream ended successfully
    Completed,
    /// The last stream was aborted or lost every subscriber
    Interrupted,
}

impl ConversationStatus {
    /// Whether moving from `self` to `next` is a legal transition
    ///
    /// `Completed` only ever moves forward into a new turn (`Processing`).
    /// `Interrupted` may still become `Completed` when a stream that lost its
    /// viewers runs to its end and the reply is persisted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConversationStatus::{Completed, Idle, Interrupted, Processing};
        matches!(
            (self, next),
            (Idle | Completed | Interrupted, Processing)
                | (Processing, Completed | Interrupted)
                | (Interrupted, Completed)
        )
    }

    /// Statuses from which `next` may be reached
    #[must_use]
    pub fn predecessors(next: Self) -> Vec<Self> {
        [Self::Idle, Self::Processing, Self::Completed, Self::Interrupted]
            .into_iter()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }

    /// Lowercase label
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A durable conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique conversation ID
    pub id: ConversationId,
    /// Owning project
    pub project_id: ProjectId,
    /// Owning user
    pub user_id: UserId,
    /// Display title
    pub title: String,
    /// Persisted status
    pub status: ConversationStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Create a new idle conversation
    pub fn new(project_id: ProjectId, user_id: UserId, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            project_id,
            user_id,
            title: title.into(),
            status: ConversationStatus::Idle,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `user` owns this conversation
    #[must_use]
    pub fn is_owned_by(&self, user: &UserId) -> bool {
        &self.user_id == user
    }
}

/// Who authored a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// User input
    User,
    /// AI assistant
    Assistant,
    /// System message
    System,
}

/// Lifecycle of a tool call on the in-flight assistant message
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    /// Surfaced by the generator, not started
    #[default]
    Pending,
    /// Handed to the tool registry
    Executing,
    /// Finished with a result
    Completed,
    /// Finished with an error (or timed out)
    Failed,
}

impl ToolCallStatus {
    /// Whether the call has finished (completed or failed)
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A structured request, embedded in an assistant message, to invoke a tool
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Tool call identifier (assigned by the generator)
    pub id: String,
    /// Function name in the tool registry
    pub function_name: String,
    /// Arguments as produced by the generator
    pub arguments: serde_json::Value,
    /// Execution status
    #[serde(default)]
    pub status: ToolCallStatus,
    /// Tool output once completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Failure description once failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCall {
    /// Create a pending tool call
    pub fn pending(
        id: impl Into<String>,
        function_name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            function_name: function_name.into(),
            arguments,
            status: ToolCallStatus::Pending,
            result: None,
            error: None,
        }
    }
}

/// A durable message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: MessageId,
    /// Conversation this message belongs to
    pub conversation_id: ConversationId,
    /// Author role
    pub role: MessageRole,
    /// Message content
    pub content: String,
    /// Free-form metadata (token usage, interruption reason, ...)
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Tool calls made while producing this message
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a new message with a fresh ID
    pub fn new(conversation_id: ConversationId, role: MessageRole, content: impl Into<String>) -> Self {
        Self::with_id(MessageId::new(), conversation_id, role, content)
    }

    /// Create a message with a pre-reserved ID
    pub fn with_id(
        id: MessageId,
        conversation_id: ConversationId,
        role: MessageRole,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id,
            conversation_id,
            role,
            content: content.into(),
            metadata: serde_json::Map::new(),
            tool_calls: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Attach a metadata entry
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
