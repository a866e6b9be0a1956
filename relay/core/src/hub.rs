//! Connection Hub - Live Connection Management
//!
//! The engine never talks to a socket. It reaches live connections through
//! the [`ConnectionHub`] trait, which exposes exactly three operations:
//! targeted send, project-room broadcast, and connection lookup.
//!
//! [`ConnectionRegistry`] is the in-process implementation: each connection
//! is an mpsc channel drained by its transport task, and a project room is
//! the set of connections registered under that project.
//!
//! # Architecture
//!
//! ```text
//!                    ConnectionRegistry
//!          ┌──────────────────────────────────────────┐
//!          │ HashMap<ConnectionId, ConnectionHandle>  │
//!          │   - wrapped in Arc<RwLock<>>             │
//!          └────────────────────┬─────────────────────┘
//!                               │
//!          ┌────────────────────┼────────────────────┐
//!          │                    │                    │
//!   ┌──────▼──────┐      ┌──────▼──────┐      ┌──────▼──────┐
//!   │  proj_a     │      │  proj_a     │      │  proj_b     │
//!   │  conn-1     │      │  conn-2     │      │  conn-3     │
//!   └─────────────┘      └─────────────┘      └─────────────┘
//! ```
//!
//! # Thread Safety
//!
//! Delivery uses `try_send` and never waits on a client. A connection whose
//! channel is full misses that event ([`DeliveryError::Backpressure`]) while
//! every other connection still receives it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::delivery::DeliveryError;
use crate::messages::{ProjectId, RelayMessage, UserId};

/// Unique identifier for a client connection
///
/// Assigned when the transport accepts the connection; stable for its lifetime.
/// A client that reconnects gets a new ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new unique connection ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Create a connection ID from a raw value
    #[must_use]
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What the hub knows about a live connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Connection identifier
    pub id: ConnectionId,
    /// Authenticated user
    pub user_id: UserId,
    /// Project room the connection belongs to
    pub project_id: ProjectId,
    /// When the connection was registered
    pub connected_at: DateTime<Utc>,
}

/// Result of a project-room broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastResult {
    /// Number of connections that accepted the message
    pub successful: usize,
    /// Number of connections that failed to accept the message
    pub failed: usize,
    /// IDs of connections that failed
    pub failed_ids: Vec<ConnectionId>,
}

impl BroadcastResult {
    /// Check if all recipients received the message
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    /// Check if nobody received the message
    #[must_use]
    pub fn none_delivered(&self) -> bool {
        self.successful == 0
    }
}

/// Transport surface used by the delivery router
#[async_trait]
pub trait ConnectionHub: Send + Sync {
    /// Send a message to one connection
    async fn send_to_connection(
        &self,
        id: ConnectionId,
        message: RelayMessage,
    ) -> Result<(), DeliveryError>;

    /// Send a message to every connection in a project room
    async fn broadcast_to_project(
        &self,
        project_id: &ProjectId,
        message: RelayMessage,
    ) -> BroadcastResult;

    /// Look up a live connection
    fn get_connection(&self, id: ConnectionId) -> Option<ConnectionInfo>;
}

/// A registered connection: its info plus the outbound channel
#[derive(Debug)]
pub struct ConnectionHandle {
    /// Connection metadata
    pub info: ConnectionInfo,
    /// Channel drained by the connection's transport task
    pub tx: mpsc::Sender<RelayMessage>,
}

impl ConnectionHandle {
    /// Create a handle for a freshly accepted connection
    #[must_use]
    pub fn new(
        id: ConnectionId,
        user_id: UserId,
        project_id: ProjectId,
        tx: mpsc::Sender<RelayMessage>,
    ) -> Self {
        Self {
            info: ConnectionInfo {
                id,
                user_id,
                project_id,
                connected_at: Utc::now(),
            },
            tx,
        }
    }

    /// Check if the transport side is still draining the channel
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// In-process connection hub
///
/// Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<ConnectionId, ConnectionHandle>>>,
}

impl ConnectionRegistry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, returning its ID
    pub fn register(&self, handle: ConnectionHandle) -> ConnectionId {
        let id = handle.info.id;
        let project_id = handle.info.project_id.clone();
        self.inner.write().insert(id, handle);
        tracing::info!(
            connection_id = %id,
            project_id = %project_id,
            "Connection registered"
        );
        id
    }

    /// Unregister a connection, returning its handle if it was registered
    pub fn unregister(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        let handle = self.inner.write().remove(&id);
        if handle.is_some() {
            tracing::info!(connection_id = %id, "Connection unregistered");
        }
        handle
    }

    /// Number of registered connections
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.read().len()
    }

    /// Check if a connection is registered
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.inner.read().contains_key(&id)
    }

    /// IDs of every connection in a project room
    #[must_use]
    pub fn project_members(&self, project_id: &ProjectId) -> Vec<ConnectionId> {
        self.inner
            .read()
            .values()
            .filter(|h| &h.info.project_id == project_id)
            .map(|h| h.info.id)
            .collect()
    }

    /// Remove connections whose transport side has gone away
    ///
    /// Returns the removed IDs so callers can detach them from streams.
    pub fn cleanup_disconnected(&self) -> Vec<ConnectionId> {
        let mut inner = self.inner.write();
        let mut removed = Vec::new();
        inner.retain(|id, handle| {
            let connected = handle.is_connected();
            if !connected {
                removed.push(*id);
            }
            connected
        });
        if !removed.is_empty() {
            tracing::info!(
                removed = removed.len(),
                remaining = inner.len(),
                "Cleaned up disconnected connections"
            );
        }
        removed
    }

    fn sender(&self, id: ConnectionId) -> Option<mpsc::Sender<RelayMessage>> {
        self.inner.read().get(&id).map(|h| h.tx.clone())
    }
}

#[async_trait]
impl ConnectionHub for ConnectionRegistry {
    async fn send_to_connection(
        &self,
        id: ConnectionId,
        message: RelayMessage,
    ) -> Result<(), DeliveryError> {
        let tx = self.sender(id).ok_or(DeliveryError::UnknownConnection(id))?;
        tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Backpressure(id),
            TrySendError::Closed(_) => DeliveryError::ConnectionClosed(id),
        })
    }

    async fn broadcast_to_project(
        &self,
        project_id: &ProjectId,
        message: RelayMessage,
    ) -> BroadcastResult {
        let inner = self.inner.read();
        let mut result = BroadcastResult::default();
        for handle in inner.values().filter(|h| &h.info.project_id == project_id) {
            if handle.tx.try_send(message.clone()).is_ok() {
                result.successful += 1;
            } else {
                result.failed += 1;
                result.failed_ids.push(handle.info.id);
            }
        }
        result
    }

    fn get_connection(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.inner.read().get(&id).map(|h| h.info.clone())
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("ConnectionRegistry")
            .field("connection_count", &inner.len())
            .field("connections", &inner.keys().collect::<Vec<_>>())
            .finish()
    }
}
