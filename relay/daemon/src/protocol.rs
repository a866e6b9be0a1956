//! Wire protocol between clients and the daemon
//!
//! Newline-delimited JSON in both directions. Clients send
//! [`ClientRequest`]s; the daemon answers each with a [`ServerReply`] and
//! interleaves streamed [`RelayMessage`] events on the same connection.
//!
//! ```text
//! → {"type":"hello","user_id":"user-…","project_id":"proj-…"}
//! ← {"type":"welcome","connection_id":7}
//! → {"type":"send_message","conversation_id":"conv-…","content":"hi"}
//! ← {"type":"message_accepted","conversation_id":"conv-…","message_id":"msg-…"}
//! ← {"type":"user_message_sent",…}
//! ← {"type":"assistant_response","content":"Hel","done":false,…}
//! ```

use serde::{Deserialize, Serialize};

use relay_core::{
    Conversation, ConversationId, ConversationView, MessageId, ProjectId, RelayMessage, UserId,
};

/// Upper bound on one request line
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// A request from a client
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Identify the connection; required before anything else
    Hello {
        /// Connecting user
        user_id: UserId,
        /// Project room to join
        project_id: ProjectId,
    },
    /// Create a conversation in the connection's project
    CreateConversation {
        /// Display title
        #[serde(default)]
        title: String,
    },
    /// Post a user message and stream the reply to this connection
    SendMessage {
        /// Target conversation
        conversation_id: ConversationId,
        /// Message text
        content: String,
    },
    /// Subscribe to a conversation's in-flight reply
    Attach {
        /// Conversation to follow
        conversation_id: ConversationId,
    },
    /// Stop following a conversation
    Detach {
        /// Conversation to leave
        conversation_id: ConversationId,
    },
    /// Fetch history merged with any in-flight reply
    LoadConversation {
        /// Conversation to load
        conversation_id: ConversationId,
    },
}

/// The daemon's answer to one request
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerReply {
    /// Hello accepted
    Welcome {
        /// Raw connection ID assigned by the daemon
        connection_id: u64,
    },
    /// Conversation created
    ConversationCreated {
        /// The new conversation
        conversation: Conversation,
    },
    /// User message persisted; the reply is streaming
    MessageAccepted {
        /// Conversation being answered
        conversation_id: ConversationId,
        /// ID the streamed reply will carry
        message_id: MessageId,
    },
    /// Attach processed
    Attached {
        /// Conversation attached to
        conversation_id: ConversationId,
        /// Whether a stream was resident; if not, load the conversation
        streaming: bool,
    },
    /// Detach processed
    Detached {
        /// Conversation detached from
        conversation_id: ConversationId,
    },
    /// Merged conversation view
    ConversationLoaded {
        /// What to render
        view: ConversationView,
    },
    /// The request could not be served
    RequestFailed {
        /// Human-readable reason
        message: String,
    },
}

impl ServerReply {
    /// Failure reply from any displayable error
    pub fn failed(error: impl std::fmt::Display) -> Self {
        Self::RequestFailed {
            message: error.to_string(),
        }
    }
}

/// Anything written to a client
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    /// Answer to a request
    Reply(ServerReply),
    /// Streamed engine event
    Event(RelayMessage),
}

/// Encode one outbound line, newline included
pub fn encode_line(outbound: &Outbound) -> serde_json::Result<Vec<u8>> {
    let mut line = serde_json::to_vec(outbound)?;
    line.push(b'\n');
    Ok(line)
}

/// Decode one request line
pub fn decode_request(line: &str) -> serde_json::Result<ClientRequest> {
    serde_json::from_str(line.trim())
}
