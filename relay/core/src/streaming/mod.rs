//! Streaming - Per-Conversation Stream Tracking
//!
//! - [`StreamState`]: one in-flight assistant response (content, token
//!   estimate, attached connections, tool calls)
//! - [`StreamRegistry`]: conversation ID → stream table with grace-period
//!   retention of completed streams
//!
//! # Locking
//!
//! ```text
//! StreamRegistry (RwLock: map membership)
//!        │
//!        ▼
//! StreamState   (Mutex: content, connections, tool calls)
//! ```
//!
//! Locks are always taken in that order and neither is held across an
//! `.await`.

mod registry;
mod state;

pub use registry::{RegistryError, StreamRegistry, DEFAULT_GRACE_PERIOD};
pub use state::{ChunkProgress, DeliveryTargets, DetachOutcome, StreamSnapshot, StreamState};
