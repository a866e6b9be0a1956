//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use relay_core::{
    ConnectionHandle, ConnectionId, ConnectionRegistry, Conversation, ConversationStore,
    EngineConfig, Generator, GeneratorError, GeneratorItem, GeneratorRequest, InMemoryStore,
    ProjectId, RelayMessage, SendMessage, StaticToolRegistry, StreamRegistry, StreamTicket,
    StreamingEngine, ToolRegistry, UserId,
};

/// How long a test waits for an expected event
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// Generator whose items are pushed by the test through a sender
pub struct ManualGenerator {
    rx: Mutex<Option<mpsc::Receiver<GeneratorItem>>>,
}

impl ManualGenerator {
    pub fn new() -> (Arc<Self>, mpsc::Sender<GeneratorItem>) {
        let (tx, rx) = mpsc::channel(64);
        let generator = Arc::new(Self {
            rx: Mutex::new(Some(rx)),
        });
        (generator, tx)
    }
}

#[async_trait]
impl Generator for ManualGenerator {
    fn name(&self) -> &str {
        "manual"
    }

    async fn generate(
        &self,
        _request: &GeneratorRequest,
    ) -> Result<mpsc::Receiver<GeneratorItem>, GeneratorError> {
        self.rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| GeneratorError::Unavailable("manual generator already used".into()))
    }
}

pub struct Harness {
    pub engine: StreamingEngine,
    pub hub: ConnectionRegistry,
    pub store: Arc<dyn ConversationStore>,
    pub registry: Arc<StreamRegistry>,
    pub conversation: Conversation,
}

pub struct HarnessBuilder {
    config: EngineConfig,
    grace: Duration,
    store: Arc<dyn ConversationStore>,
    tools: Arc<dyn ToolRegistry>,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            grace: Duration::from_secs(30),
            store: Arc::new(InMemoryStore::new()),
            tools: Arc::new(StaticToolRegistry::new()),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = store;
        self
    }

    pub fn tools(mut self, tools: Arc<dyn ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub async fn build(self, generator: Arc<dyn Generator>) -> Harness {
        let hub = ConnectionRegistry::new();
        let registry = Arc::new(StreamRegistry::new(self.grace));
        let engine = StreamingEngine::new(
            self.config,
            Arc::clone(&registry),
            Arc::new(hub.clone()),
            Arc::clone(&self.store),
            generator,
            self.tools,
        );
        let conversation = engine
            .create_conversation(ProjectId::new(), UserId::new(), "test conversation")
            .await
            .unwrap();
        Harness {
            engine,
            hub,
            store: self.store,
            registry,
            conversation,
        }
    }
}

impl Harness {
    /// Register a live connection in the conversation's project room
    pub fn connect(&self) -> (ConnectionId, mpsc::Receiver<RelayMessage>) {
        self.connect_with_capacity(256)
    }

    /// Like [`Harness::connect`] with an outbound queue of `capacity` events
    pub fn connect_with_capacity(
        &self,
        capacity: usize,
    ) -> (ConnectionId, mpsc::Receiver<RelayMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        let id = self.hub.register(ConnectionHandle::new(
            ConnectionId::new(),
            self.conversation.user_id.clone(),
            self.conversation.project_id.clone(),
            tx,
        ));
        (id, rx)
    }

    pub async fn submit(&self, content: &str, origin: Option<ConnectionId>) -> StreamTicket {
        self.engine
            .submit_user_message(SendMessage {
                conversation_id: self.conversation.id.clone(),
                user_id: self.conversation.user_id.clone(),
                content: content.to_string(),
                origin,
            })
            .await
            .unwrap()
    }
}

/// Wait for the next `assistant_response`, skipping other events
pub async fn next_response(rx: &mut mpsc::Receiver<RelayMessage>) -> (String, bool) {
    loop {
        let event = tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for assistant_response")
            .expect("connection channel closed");
        if let RelayMessage::AssistantResponse { content, done, .. } = event {
            return (content, done);
        }
    }
}

/// Everything already queued on a connection
pub fn drain(rx: &mut mpsc::Receiver<RelayMessage>) -> Vec<RelayMessage> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// `(content, done)` of every `assistant_response` in `events`
pub fn responses(events: &[RelayMessage]) -> Vec<(String, bool)> {
    events
        .iter()
        .filter_map(|e| match e {
            RelayMessage::AssistantResponse { content, done, .. } => Some((content.clone(), *done)),
            _ => None,
        })
        .collect()
}

pub fn kinds(events: &[RelayMessage]) -> Vec<&'static str> {
    events.iter().map(RelayMessage::kind).collect()
}

/// A delta worth exactly `tokens` estimated tokens
pub fn delta_of(tokens: usize, fill: char) -> String {
    std::iter::repeat(fill).take(tokens * 4).collect()
}
