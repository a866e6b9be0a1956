//! Ollama Generator
//!
//! Streams chat completions from a local Ollama server.
//!
//! # Ollama API
//!
//! `POST /api/chat` with `"stream": true` answers with newline-delimited
//! JSON objects:
//!
//! ```text
//! {"message":{"role":"assistant","content":"Hel"},"done":false}
//! {"message":{"role":"assistant","content":"lo"},"done":false}
//! {"message":{"role":"assistant","content":""},"done":true,"prompt_eval_count":12,"eval_count":2}
//! ```
//!
//! Tool calls arrive under `message.tool_calls` without IDs; one is assigned
//! per call in arrival order. A line with an `error` field ends the stream.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{Generator, GeneratorChunk, GeneratorError, GeneratorItem, GeneratorRequest};
use crate::conversation::{MessageRole, ToolCall};
use crate::messages::TokenUsage;

/// Default Ollama endpoint
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Ollama chat generator
#[derive(Clone, Debug)]
pub struct OllamaGenerator {
    base_url: String,
    http_client: reqwest::Client,
}

impl OllamaGenerator {
    /// Create a generator for the server at `base_url`
    pub fn new(base_url: impl Into<String>) -> Result<Self, GeneratorError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GeneratorError::Unavailable(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    /// Create from `OLLAMA_HOST`/`OLLAMA_PORT`, defaulting to localhost:11434
    pub fn from_env() -> Result<Self, GeneratorError> {
        let host = std::env::var("OLLAMA_HOST").unwrap_or_else(|_| "localhost".to_string());
        let port: u16 = std::env::var("OLLAMA_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(11434);
        if host.starts_with("http://") || host.starts_with("https://") {
            Self::new(host)
        } else {
            Self::new(format!("http://{host}:{port}"))
        }
    }

    /// Server base URL
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    fn build_body(request: &GeneratorRequest) -> Value {
        let mut messages = Vec::with_capacity(request.history.len() + 1);
        if let Some(system) = &request.system {
            messages.push(serde_json::json!({ "role": "system", "content": system }));
        }
        for message in &request.history {
            let role = match message.role {
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
                MessageRole::System => "system",
            };
            messages.push(serde_json::json!({ "role": role, "content": message.content }));
        }

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "stream": true,
        });
        if request.max_tokens > 0 {
            body["options"] = serde_json::json!({ "num_predict": request.max_tokens });
        }
        body
    }
}

/// Parses NDJSON lines from the chat endpoint
#[derive(Debug, Default)]
struct ChatLineParser {
    next_call: u32,
}

impl ChatLineParser {
    /// Items for one line; empty when the line carries nothing
    fn parse(&mut self, line: &str) -> Vec<GeneratorItem> {
        let data: Value = match serde_json::from_str(line) {
            Ok(data) => data,
            Err(e) => {
                return vec![GeneratorItem::Error(GeneratorError::Protocol(format!(
                    "invalid JSON line: {e}"
                )))]
            }
        };

        if let Some(error) = data.get("error").and_then(Value::as_str) {
            return vec![GeneratorItem::Error(GeneratorError::Provider(error.to_string()))];
        }

        let mut items = Vec::new();
        let message = data.get("message");
        let content = message
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let tool_calls = message
            .and_then(|m| m.get("tool_calls"))
            .and_then(Value::as_array)
            .map(|calls| calls.iter().filter_map(|c| self.tool_call(c)).collect())
            .unwrap_or_default();

        let chunk = GeneratorChunk {
            content: content.to_string(),
            tool_calls,
        };
        if !chunk.content.is_empty() || !chunk.tool_calls.is_empty() {
            items.push(GeneratorItem::Delta(chunk));
        }

        if data.get("done").and_then(Value::as_bool).unwrap_or(false) {
            items.push(GeneratorItem::Done {
                usage: usage_from(&data),
            });
        }
        items
    }

    fn tool_call(&mut self, call: &Value) -> Option<ToolCall> {
        let function = call.get("function")?;
        let name = function.get("name")?.as_str()?;
        let arguments = function.get("arguments").cloned().unwrap_or(Value::Null);
        self.next_call += 1;
        let id = call
            .get("id")
            .and_then(Value::as_str)
            .map_or_else(|| format!("call_{}", self.next_call), str::to_string);
        Some(ToolCall::pending(id, name, arguments))
    }
}

fn usage_from(data: &Value) -> Option<TokenUsage> {
    let completion = data.get("eval_count").and_then(Value::as_u64)?;
    let completion = u32::try_from(completion).unwrap_or(u32::MAX);
    let prompt = data
        .get("prompt_eval_count")
        .and_then(Value::as_u64)
        .map(|p| u32::try_from(p).unwrap_or(u32::MAX));
    Some(TokenUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: completion.saturating_add(prompt.unwrap_or(0)),
    })
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(
        &self,
        request: &GeneratorRequest,
    ) -> Result<mpsc::Receiver<GeneratorItem>, GeneratorError> {
        let (tx, rx) = mpsc::channel(100);

        let response = self
            .http_client
            .post(self.chat_url())
            .json(&Self::build_body(request))
            .send()
            .await
            .map_err(|e| GeneratorError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GeneratorError::Provider(format!("Ollama returned {status}: {body}")));
        }

        let conversation_id = request.conversation_id.clone();
        let mut stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut buffer = String::new();
            let mut parser = ChatLineParser::default();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx
                            .send(GeneratorItem::Error(GeneratorError::Provider(e.to_string())))
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    if line.is_empty() {
                        continue;
                    }
                    for item in parser.parse(&line) {
                        let terminal = item.is_terminal();
                        if tx.send(item).await.is_err() {
                            tracing::debug!(
                                conversation_id = %conversation_id,
                                "Generator receiver dropped, stopping Ollama stream"
                            );
                            return;
                        }
                        if terminal {
                            return;
                        }
                    }
                }
            }

            // Some servers omit the trailing newline on the final object
            let tail = buffer.trim();
            if !tail.is_empty() {
                for item in parser.parse(tail) {
                    let terminal = item.is_terminal();
                    if tx.send(item).await.is_err() || terminal {
                        return;
                    }
                }
            }
            let _ = tx.send(GeneratorItem::Error(GeneratorError::UnexpectedEnd)).await;
        });

        Ok(rx)
    }
}
