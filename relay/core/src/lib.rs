//! Relay Core - Real-Time LLM Streaming Delivery
//!
//! This crate sits between a token generator and the live client connections
//! subscribed to a conversation. It decides when to flush generated content,
//! tracks which connections are attached to each in-flight reply, keeps the
//! persisted conversation status consistent with subscriber liveness,
//! interleaves tool execution into the stream, and merges durable history
//! with in-memory partial output for reconnecting clients.
//!
//! It never touches a socket: transports reach it through
//! [`StreamingEngine`] and are reached back through [`ConnectionHub`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Transport (daemon, tests)                    │
//! │        submit / attach / detach / closed / load_for_display      │
//! └───────────────────────────────┬─────────────────────────────────┘
//!                                 │
//! ┌───────────────────────────────┼─────────────────────────────────┐
//! │                        StreamingEngine                           │
//! │  ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────────┐ │
//! │  │  Stream   │  │ Batching  │  │ Delivery  │  │     Tool      │ │
//! │  │ Registry  │  │  Policy   │  │  Router   │  │  Coordinator  │ │
//! │  └───────────┘  └───────────┘  └─────┬─────┘  └───────────────┘ │
//! │  ┌───────────┐  ┌───────────┐        │                          │
//! │  │  Status   │  │Reconciler │        ▼                          │
//! │  │  Machine  │  │           │  ConnectionHub                     │
//! │  └─────┬─────┘  └─────┬─────┘                                    │
//! └────────┼──────────────┼──────────────────────────────────────────┘
//!          ▼              ▼
//!     ConversationStore          Generator (Ollama, scripted)
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use relay_core::{
//!     ConnectionRegistry, EngineConfig, InMemoryStore, ScriptedGenerator,
//!     SendMessage, StaticToolRegistry, StreamRegistry, StreamingEngine,
//! };
//!
//! let engine = StreamingEngine::new(
//!     EngineConfig::default(),
//!     Arc::new(StreamRegistry::default()),
//!     Arc::new(ConnectionRegistry::new()),
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(ScriptedGenerator::echo()),
//!     Arc::new(StaticToolRegistry::new()),
//! );
//! let ticket = engine.submit_user_message(SendMessage { /* ... */ }).await?;
//! let outcome = ticket.wait().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod batching;
pub mod config;
pub mod conversation;
pub mod delivery;
pub mod engine;
pub mod generator;
pub mod hub;
pub mod messages;
pub mod reconciler;
pub mod status;
pub mod store;
pub mod streaming;
pub mod tools;

pub use batching::{estimate_tokens, should_flush, BatchingPolicy, FlushCadence, DEFAULT_BATCH_SIZE};
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, GeneratorKind, RelayConfig,
};
pub use conversation::{
    Conversation, ConversationStatus, Message, MessageRole, ToolCall, ToolCallStatus,
};
pub use delivery::{DeliveryError, DeliveryReport, DeliveryRoute, DeliveryRouter};
pub use engine::{
    EngineConfig, EngineError, SendMessage, StreamOutcome, StreamTicket, StreamingEngine,
};
pub use generator::{
    Generator, GeneratorChunk, GeneratorError, GeneratorItem, GeneratorRequest, OllamaGenerator,
    ScriptedGenerator,
};
pub use hub::{BroadcastResult, ConnectionHandle, ConnectionHub, ConnectionId, ConnectionInfo, ConnectionRegistry};
pub use messages::{ConversationId, ErrorCode, MessageId, ProjectId, RelayMessage, TokenUsage, UserId};
pub use reconciler::{ConversationView, ReconcileError, Reconciler, StreamingInfo};
pub use status::StatusMachine;
pub use store::{ConversationStore, InMemoryStore, StoreError};
pub use streaming::{DetachOutcome, RegistryError, StreamRegistry, StreamSnapshot, StreamState};
pub use tools::{StaticToolRegistry, ToolCoordinator, ToolError, ToolRegistry};
