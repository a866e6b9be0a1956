//! Relay Messages
//!
//! Typed events sent from the engine to subscribed connections, plus the
//! identifier types shared across the crate.
//!
//! # Design Philosophy
//!
//! Connections are pure renderers. Every event carries the conversation it
//! belongs to and, where relevant, the message being streamed, so a client
//! can route events without any other state. Events serialize as JSON objects
//! tagged by a `type` field (`assistant_response`, `tool_execution_started`, ...).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::conversation::{Message, ToolCall};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a new random identifier
            #[must_use]
            pub fn new() -> Self {
                Self(format!(concat!($prefix, "_{}"), uuid::Uuid::new_v4().simple()))
            }

            /// Wrap an existing identifier
            pub fn from_string(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the string value
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Conversation identifier (key of the stream registry)
    ConversationId,
    "conv"
);
string_id!(
    /// Message identifier
    ///
    /// Reserved up front for the in-flight assistant message, which only
    /// becomes durable when its stream ends.
    MessageId,
    "msg"
);
string_id!(
    /// User identifier
    UserId,
    "user"
);
string_id!(
    /// Project identifier (also names the project broadcast room)
    ProjectId,
    "proj"
);

/// Machine-readable error codes carried by [`RelayMessage::Error`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The response exceeded the configured token budget
    TokenLimitExceeded,
    /// The generator or its provider failed
    AiResponseError,
    /// The engine failed to carry out an operation (e.g. persisting the reply)
    ExecutionError,
}

impl ErrorCode {
    /// Wire representation of the code
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenLimitExceeded => "TOKEN_LIMIT_EXCEEDED",
            Self::AiResponseError => "AI_RESPONSE_ERROR",
            Self::ExecutionError => "EXECUTION_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token usage attached to assistant responses
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens, when the generator reports them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u32>,
    /// Completion tokens (the engine's running estimate until the generator reports)
    pub completion_tokens: u32,
    /// Sum of prompt and completion tokens
    pub total_tokens: u32,
}

impl TokenUsage {
    /// Usage built from the engine's own completion estimate
    #[must_use]
    pub fn estimated(completion_tokens: u32) -> Self {
        Self {
            prompt_tokens: None,
            completion_tokens,
            total_tokens: completion_tokens,
        }
    }

    /// Prefer generator-reported numbers over the running estimate
    #[must_use]
    pub fn merge_reported(self, reported: Option<TokenUsage>) -> Self {
        match reported {
            Some(reported) if reported.total_tokens > 0 => reported,
            _ => self,
        }
    }
}

/// Events from the engine to connected clients
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    /// The user's message was accepted and persisted
    UserMessageSent {
        /// Conversation the message belongs to
        conversation_id: ConversationId,
        /// The persisted user message
        message: Message,
    },

    /// Snapshot of the assistant message being streamed
    AssistantResponse {
        /// Conversation being streamed
        conversation_id: ConversationId,
        /// Reserved ID of the in-flight assistant message
        message_id: MessageId,
        /// Full accumulated content so far (not a delta)
        content: String,
        /// Whether this is the terminal flush
        done: bool,
        /// Tool calls on the in-flight message, if any
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<ToolCall>>,
        /// Token usage so far
        usage: TokenUsage,
    },

    /// A tool call started executing
    ToolExecutionStarted {
        /// Conversation being streamed
        conversation_id: ConversationId,
        /// In-flight assistant message
        message_id: MessageId,
        /// Tool call identifier
        tool_call_id: String,
        /// Function being invoked
        function_name: String,
    },

    /// A tool call finished successfully
    ToolExecutionCompleted {
        /// Conversation being streamed
        conversation_id: ConversationId,
        /// In-flight assistant message
        message_id: MessageId,
        /// Tool call identifier
        tool_call_id: String,
        /// Function that was invoked
        function_name: String,
        /// Tool output
        result: serde_json::Value,
    },

    /// A tool call failed (the stream continues)
    ToolExecutionFailed {
        /// Conversation being streamed
        conversation_id: ConversationId,
        /// In-flight assistant message
        message_id: MessageId,
        /// Tool call identifier
        tool_call_id: String,
        /// Function that was invoked
        function_name: String,
        /// Failure description
        error: String,
    },

    /// The stream was aborted or an operation failed
    Error {
        /// Conversation affected
        conversation_id: ConversationId,
        /// Machine-readable code
        code: ErrorCode,
        /// Human-readable description
        message: String,
    },
}

impl RelayMessage {
    /// Conversation this event belongs to
    #[must_use]
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::UserMessageSent {
                conversation_id, ..
            }
            | Self::AssistantResponse {
                conversation_id, ..
            }
            | Self::ToolExecutionStarted {
                conversation_id, ..
            }
            | Self::ToolExecutionCompleted {
                conversation_id, ..
            }
            | Self::ToolExecutionFailed {
                conversation_id, ..
            }
            | Self::Error {
                conversation_id, ..
            } => conversation_id,
        }
    }

    /// Event name as it appears in the `type` field
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserMessageSent { .. } => "user_message_sent",
            Self::AssistantResponse { .. } => "assistant_response",
            Self::ToolExecutionStarted { .. } => "tool_execution_started",
            Self::ToolExecutionCompleted { .. } => "tool_execution_completed",
            Self::ToolExecutionFailed { .. } => "tool_execution_failed",
            Self::Error { .. } => "error",
        }
    }
}
