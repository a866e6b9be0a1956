//! Scripted Generator
//!
//! Plays back a fixed list of items, or echoes the last user message word by
//! word. Used by tests and by the daemon when no model server is configured.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Generator, GeneratorError, GeneratorItem, GeneratorRequest};

#[derive(Debug, Clone)]
enum Script {
    Fixed(Vec<GeneratorItem>),
    Echo,
}

/// Generator that replays a script
#[derive(Debug, Clone)]
pub struct ScriptedGenerator {
    script: Script,
    delay: Duration,
    start_error: Option<GeneratorError>,
}

impl ScriptedGenerator {
    /// Replay `items` exactly; a script without a terminal item ends abruptly
    #[must_use]
    pub fn new(items: Vec<GeneratorItem>) -> Self {
        Self {
            script: Script::Fixed(items),
            delay: Duration::ZERO,
            start_error: None,
        }
    }

    /// Text deltas followed by `Done`
    #[must_use]
    pub fn from_deltas(deltas: &[&str]) -> Self {
        let mut items: Vec<GeneratorItem> = deltas.iter().map(|d| GeneratorItem::text(*d)).collect();
        items.push(GeneratorItem::Done { usage: None });
        Self::new(items)
    }

    /// Echo the last user message back, one word per delta
    #[must_use]
    pub fn echo() -> Self {
        Self {
            script: Script::Echo,
            delay: Duration::ZERO,
            start_error: None,
        }
    }

    /// Fail in `generate` before any item is produced
    #[must_use]
    pub fn failing_to_start(error: GeneratorError) -> Self {
        Self {
            script: Script::Fixed(Vec::new()),
            delay: Duration::ZERO,
            start_error: Some(error),
        }
    }

    /// Pause before each item
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn items_for(&self, request: &GeneratorRequest) -> Vec<GeneratorItem> {
        match &self.script {
            Script::Fixed(items) => items.clone(),
            Script::Echo => {
                let text = request.last_user_content().unwrap_or_default();
                let mut items: Vec<GeneratorItem> = text
                    .split_inclusive(' ')
                    .map(GeneratorItem::text)
                    .collect();
                items.push(GeneratorItem::Done { usage: None });
                items
            }
        }
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        request: &GeneratorRequest,
    ) -> Result<mpsc::Receiver<GeneratorItem>, GeneratorError> {
        if let Some(error) = &self.start_error {
            return Err(error.clone());
        }

        let items = self.items_for(request);
        let delay = self.delay;
        let (tx, rx) = mpsc::channel(items.len().max(1));

        tokio::spawn(async move {
            for item in items {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(item).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{Message, MessageRole};
    use crate::messages::ConversationId;

    async fn collect(generator: &ScriptedGenerator, request: &GeneratorRequest) -> Vec<GeneratorItem> {
        let mut rx = generator.generate(request).await.unwrap();
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn test_from_deltas_ends_with_done() {
        let items = collect(
            &ScriptedGenerator::from_deltas(&["a", "b"]),
            &GeneratorRequest::default(),
        )
        .await;
        assert_eq!(
            items,
            vec![
                GeneratorItem::text("a"),
                GeneratorItem::text("b"),
                GeneratorItem::Done { usage: None },
            ]
        );
    }

    #[tokio::test]
    async fn test_echo_splits_words() {
        let conv = ConversationId::new();
        let request = GeneratorRequest {
            conversation_id: conv.clone(),
            history: vec![Message::new(conv, MessageRole::User, "hello there world")],
            ..GeneratorRequest::default()
        };
        let items = collect(&ScriptedGenerator::echo(), &request).await;
        assert_eq!(items.len(), 4);
        assert_eq!(items[0], GeneratorItem::text("hello "));
        assert_eq!(items[2], GeneratorItem::text("world"));
    }

    #[tokio::test]
    async fn test_failing_to_start() {
        let generator = ScriptedGenerator::failing_to_start(GeneratorError::Unavailable("down".into()));
        assert!(generator.generate(&GeneratorRequest::default()).await.is_err());
    }
}
