//! Delivery Router
//!
//! Resolves who should receive an event for a conversation and performs the
//! send through the [`ConnectionHub`].
//!
//! Routing, evaluated on a snapshot of the stream's connection sets:
//!
//! 1. attached connections exist: send to exactly those
//! 2. none attached, but some connection attached earlier: broadcast to the
//!    project room (covers a reconnect that arrived under a new ID)
//! 3. nobody ever attached: [`DeliveryError::NoSubscriber`]
//!
//! The stream lock is released before any send. Sends never wait on a
//! client, so a stalled connection cannot hold up the stream.

use std::sync::Arc;

use thiserror::Error;

use crate::hub::{ConnectionHub, ConnectionId};
use crate::messages::{ConversationId, RelayMessage};
use crate::streaming::{StreamRegistry, StreamState};

/// Delivery failures
///
/// None of these are fatal to a stream; the driver logs them and keeps
/// accumulating so the final message is still persisted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// No connection has ever subscribed to the conversation's stream
    #[error("no subscriber for conversation {0}")]
    NoSubscriber(ConversationId),

    /// The hub does not know the connection
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// The connection's outbound channel is closed
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    /// The connection's outbound channel is full; the event was dropped for it
    #[error("connection {0} is not keeping up, event dropped")]
    Backpressure(ConnectionId),
}

/// Which routing rule was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryRoute {
    /// Sent to the attached connections
    Targeted,
    /// Broadcast to the project room
    ProjectBroadcast,
}

/// Outcome of a successful routing decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Rule that was applied
    pub route: DeliveryRoute,
    /// Connections that accepted the event
    pub delivered: usize,
    /// Connections that failed to accept the event
    pub failed: Vec<ConnectionId>,
}

/// Routes relay events to live connections
#[derive(Clone)]
pub struct DeliveryRouter {
    hub: Arc<dyn ConnectionHub>,
    registry: Arc<StreamRegistry>,
}

impl DeliveryRouter {
    /// Create a router over a hub and a stream registry
    pub fn new(hub: Arc<dyn ConnectionHub>, registry: Arc<StreamRegistry>) -> Self {
        Self { hub, registry }
    }

    /// The underlying hub
    #[must_use]
    pub fn hub(&self) -> &Arc<dyn ConnectionHub> {
        &self.hub
    }

    /// Send an event for a conversation
    ///
    /// A conversation without a resident stream has no subscribers.
    pub async fn send(
        &self,
        conversation_id: &ConversationId,
        message: RelayMessage,
    ) -> Result<DeliveryReport, DeliveryError> {
        let state = self
            .registry
            .get(conversation_id)
            .ok_or_else(|| DeliveryError::NoSubscriber(conversation_id.clone()))?;
        self.send_to_stream(&state, message).await
    }

    /// Send an event to the subscribers of a known stream
    pub async fn send_to_stream(
        &self,
        state: &StreamState,
        message: RelayMessage,
    ) -> Result<DeliveryReport, DeliveryError> {
        let targets = state.delivery_targets();

        if !targets.active.is_empty() {
            let mut report = DeliveryReport {
                route: DeliveryRoute::Targeted,
                delivered: 0,
                failed: Vec::new(),
            };
            for conn in targets.active {
                match self.hub.send_to_connection(conn, message.clone()).await {
                    Ok(()) => report.delivered += 1,
                    Err(e) => {
                        tracing::warn!(
                            conversation_id = %state.conversation_id(),
                            connection_id = %conn,
                            event = message.kind(),
                            error = %e,
                            "Failed to deliver event to connection"
                        );
                        report.failed.push(conn);
                    }
                }
            }
            return Ok(report);
        }

        if targets.any_attached {
            let result = self
                .hub
                .broadcast_to_project(state.project_id(), message.clone())
                .await;
            tracing::debug!(
                conversation_id = %state.conversation_id(),
                project_id = %state.project_id(),
                event = message.kind(),
                successful = result.successful,
                failed = result.failed,
                "No attached connections, broadcast to project room"
            );
            return Ok(DeliveryReport {
                route: DeliveryRoute::ProjectBroadcast,
                delivered: result.successful,
                failed: result.failed_ids,
            });
        }

        Err(DeliveryError::NoSubscriber(state.conversation_id().clone()))
    }

    /// Send an event to a single connection, bypassing routing
    pub async fn send_to_connection(
        &self,
        conn: ConnectionId,
        message: RelayMessage,
    ) -> Result<(), DeliveryError> {
        self.hub.send_to_connection(conn, message).await
    }
}

impl std::fmt::Debug for DeliveryRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryRouter")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
