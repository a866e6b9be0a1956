//! Tool-Call Coordinator
//!
//! Executes the tool calls a generator surfaces on the in-flight assistant
//! message and interleaves their lifecycle events into the stream:
//!
//! ```text
//! pending ──► executing ──► completed   (tool_execution_completed)
//!    │            │
//!    │            └───────► failed      (tool_execution_failed)
//!    └─ tool_execution_started
//! ```
//!
//! A failing or hung tool only fails its own call. The stream and any
//! remaining calls carry on.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

use crate::conversation::{ToolCall, ToolCallStatus};
use crate::delivery::DeliveryRouter;
use crate::messages::RelayMessage;
use crate::streaming::StreamState;

/// Default bound on a single tool execution
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Tool execution errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    /// No tool registered under that name
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// Arguments were rejected by the tool
    #[error("invalid arguments for {tool_name}: {message}")]
    InvalidArguments {
        /// Tool that rejected the arguments
        tool_name: String,
        /// What was wrong
        message: String,
    },

    /// The tool ran and reported a failure
    #[error("tool {tool_name} failed: {message}")]
    Execution {
        /// Tool that failed
        tool_name: String,
        /// Failure description
        message: String,
    },

    /// The tool did not finish within its time bound
    #[error("tool {tool_name} timed out after {timeout_ms}ms")]
    Timeout {
        /// Tool that timed out
        tool_name: String,
        /// Bound that was exceeded
        timeout_ms: u64,
    },
}

impl ToolError {
    /// Execution failure helper
    pub fn execution(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    fn timeout(tool_name: &str, timeout: Duration) -> Self {
        Self::Timeout {
            tool_name: tool_name.to_string(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Something that can run named tools
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    /// Run `name` with `arguments`, giving up after `timeout`
    async fn execute(&self, name: &str, arguments: Value, timeout: Duration) -> Result<Value, ToolError>;
}

type ToolHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync>;

/// Tool registry backed by a fixed map of async handlers
#[derive(Clone, Default)]
pub struct StaticToolRegistry {
    handlers: HashMap<String, ToolHandler>,
}

impl StaticToolRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async handler under `name`
    #[must_use]
    pub fn with_tool<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        let handler: ToolHandler = Arc::new(move |args| Box::pin(handler(args)));
        self.handlers.insert(name.into(), handler);
        self
    }

    /// Names of registered tools
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ToolRegistry for StaticToolRegistry {
    async fn execute(&self, name: &str, arguments: Value, timeout: Duration) -> Result<Value, ToolError> {
        let handler = self
            .handlers
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        tokio::time::timeout(timeout, handler(arguments))
            .await
            .map_err(|_| ToolError::timeout(name, timeout))?
    }
}

impl std::fmt::Debug for StaticToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

/// Runs tool calls for a stream and reports their progress to subscribers
#[derive(Clone)]
pub struct ToolCoordinator {
    registry: Arc<dyn ToolRegistry>,
    timeout: Duration,
}

impl ToolCoordinator {
    /// Create a coordinator with a per-call time bound
    pub fn new(registry: Arc<dyn ToolRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// Per-call time bound
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute `calls` in order; returns each call in its terminal state
    ///
    /// Calls must already be registered on `state` (see
    /// [`StreamState::add_tool_calls`]).
    pub async fn run(&self, state: &StreamState, router: &DeliveryRouter, calls: Vec<ToolCall>) -> Vec<ToolCall> {
        let mut finished = Vec::with_capacity(calls.len());
        for call in calls {
            finished.push(self.run_one(state, router, call).await);
        }
        finished
    }

    async fn run_one(&self, state: &StreamState, router: &DeliveryRouter, call: ToolCall) -> ToolCall {
        let conversation_id = state.conversation_id().clone();
        let message_id = state.message_id().clone();

        state.update_tool_call(&call.id, ToolCallStatus::Executing, None, None);
        emit(
            router,
            state,
            RelayMessage::ToolExecutionStarted {
                conversation_id: conversation_id.clone(),
                message_id: message_id.clone(),
                tool_call_id: call.id.clone(),
                function_name: call.function_name.clone(),
            },
        )
        .await;

        tracing::debug!(
            conversation_id = %conversation_id,
            tool_call_id = %call.id,
            function = %call.function_name,
            "Executing tool call"
        );

        // The registry gets the bound too, but a registry that ignores it
        // must not stall the stream.
        let outcome = tokio::time::timeout(
            self.timeout,
            self.registry
                .execute(&call.function_name, call.arguments.clone(), self.timeout),
        )
        .await
        .unwrap_or_else(|_| Err(ToolError::timeout(&call.function_name, self.timeout)));

        match outcome {
            Ok(result) => {
                let updated = state.update_tool_call(
                    &call.id,
                    ToolCallStatus::Completed,
                    Some(result.clone()),
                    None,
                );
                emit(
                    router,
                    state,
                    RelayMessage::ToolExecutionCompleted {
                        conversation_id,
                        message_id,
                        tool_call_id: call.id.clone(),
                        function_name: call.function_name.clone(),
                        result: result.clone(),
                    },
                )
                .await;
                updated.unwrap_or(ToolCall {
                    status: ToolCallStatus::Completed,
                    result: Some(result),
                    ..call
                })
            }
            Err(e) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    tool_call_id = %call.id,
                    function = %call.function_name,
                    error = %e,
                    "Tool call failed"
                );
                let error = e.to_string();
                let updated = state.update_tool_call(
                    &call.id,
                    ToolCallStatus::Failed,
                    None,
                    Some(error.clone()),
                );
                emit(
                    router,
                    state,
                    RelayMessage::ToolExecutionFailed {
                        conversation_id,
                        message_id,
                        tool_call_id: call.id.clone(),
                        function_name: call.function_name.clone(),
                        error: error.clone(),
                    },
                )
                .await;
                updated.unwrap_or(ToolCall {
                    status: ToolCallStatus::Failed,
                    error: Some(error),
                    ..call
                })
            }
        }
    }
}

impl std::fmt::Debug for ToolCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolCoordinator")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

async fn emit(router: &DeliveryRouter, state: &StreamState, event: RelayMessage) {
    if let Err(e) = router.send_to_stream(state, event).await {
        tracing::debug!(
            conversation_id = %state.conversation_id(),
            error = %e,
            "Tool event not delivered"
        );
    }
}
