//! Token Generators
//!
//! A generator turns a conversation into a stream of [`GeneratorItem`]s
//! delivered over an mpsc channel, one item at a time, in generation order.
//! Exactly one terminal item ends the stream: [`GeneratorItem::Done`] on
//! success or [`GeneratorItem::Error`] on failure. A channel that closes
//! without a terminal item is treated as a provider failure.
//!
//! # Implementations
//!
//! - [`OllamaGenerator`]: Ollama's streaming `/api/chat` endpoint
//! - [`ScriptedGenerator`]: replays a fixed script or echoes the prompt,
//!   for tests and offline runs

mod ollama;
mod scripted;

pub use ollama::{OllamaGenerator, DEFAULT_OLLAMA_URL};
pub use scripted::ScriptedGenerator;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::conversation::{Message, ToolCall};
use crate::messages::{ConversationId, TokenUsage};

/// Generator failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeneratorError {
    /// The provider could not be reached or set up
    #[error("generator unavailable: {0}")]
    Unavailable(String),

    /// The provider reported an error
    #[error("provider error: {0}")]
    Provider(String),

    /// The provider sent something unparseable
    #[error("malformed provider output: {0}")]
    Protocol(String),

    /// The item stream ended without a terminal item
    #[error("generator stream ended without completion")]
    UnexpectedEnd,
}

/// One content delta, possibly carrying tool calls
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneratorChunk {
    /// New content (may be empty)
    pub content: String,
    /// Tool calls surfaced with this delta
    pub tool_calls: Vec<ToolCall>,
}

impl GeneratorChunk {
    /// Content-only delta
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }
}

/// An item produced by a generator
#[derive(Debug, Clone, PartialEq)]
pub enum GeneratorItem {
    /// A content delta
    Delta(GeneratorChunk),
    /// Generation finished successfully
    Done {
        /// Usage reported by the provider, when available
        usage: Option<TokenUsage>,
    },
    /// Generation failed; nothing follows
    Error(GeneratorError),
}

impl GeneratorItem {
    /// Content-only delta
    pub fn text(content: impl Into<String>) -> Self {
        Self::Delta(GeneratorChunk::text(content))
    }

    /// Whether this item ends the stream
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error(_))
    }
}

/// Input to a generator
#[derive(Debug, Clone, Default)]
pub struct GeneratorRequest {
    /// Conversation being answered
    pub conversation_id: ConversationId,
    /// Model identifier (provider-specific)
    pub model: String,
    /// System prompt
    pub system: Option<String>,
    /// Conversation history, oldest first, ending with the new user message
    pub history: Vec<Message>,
    /// Provider-side cap on generated tokens (0 = provider default)
    pub max_tokens: u32,
}

impl GeneratorRequest {
    /// Content of the last user message, if any
    #[must_use]
    pub fn last_user_content(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|m| m.role == crate::conversation::MessageRole::User)
            .map(|m| m.content.as_str())
    }
}

/// Source of streamed assistant output
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generator name for logs
    fn name(&self) -> &str;

    /// Start generating
    ///
    /// Returns a receiver that yields items until exactly one terminal item.
    /// Dropping the receiver cancels generation.
    async fn generate(
        &self,
        request: &GeneratorRequest,
    ) -> Result<mpsc::Receiver<GeneratorItem>, GeneratorError>;
}
