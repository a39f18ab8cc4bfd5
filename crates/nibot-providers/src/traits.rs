//! The LLM provider capability.
//!
//! Every backend implements `chat`; streaming backends also implement
//! `chat_stream`. The default `chat_stream` derives a stream from `chat`:
//! one text fragment then the final response (or the final response alone
//! on the tool-call path), so callers can always consume the stream shape.

use async_trait::async_trait;
use tokio::sync::mpsc;

use nibot_core::types::{ChatMessage, LlmResponse, ToolDefinition};

/// Per-call knobs. `None` fields fall back to the provider's defaults.
#[derive(Clone, Debug, Default)]
pub struct ChatOptions {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

/// One item of a provider's chunk stream.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    /// A text fragment.
    Text(String),
    /// A partial tool call; `partial_args` is the argument string
    /// accumulated so far for the call at `index`.
    ToolCallDelta {
        index: usize,
        name: String,
        partial_args: String,
    },
    /// The terminal, complete response. Always the last event.
    Final(LlmResponse),
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// One chat-completion round. API failures come back as
    /// `LlmResponse::error(...)`, never as a panic.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        opts: &ChatOptions,
    ) -> LlmResponse;

    /// Streaming variant. The receiver yields zero or more `Text` /
    /// `ToolCallDelta` events followed by exactly one `Final`.
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        opts: &ChatOptions,
    ) -> mpsc::Receiver<StreamEvent> {
        let response = self.chat(messages, tools, opts).await;
        let (tx, rx) = mpsc::channel(4);
        if !response.has_tool_calls() {
            if let Some(content) = response.content.clone() {
                if !content.is_empty() {
                    let _ = tx.send(StreamEvent::Text(content)).await;
                }
            }
        }
        let _ = tx.send(StreamEvent::Final(response)).await;
        rx
    }

    /// The model used when `ChatOptions.model` is `None`.
    fn default_model(&self) -> &str;

    /// Display name for logging and events.
    fn display_name(&self) -> &str;
}
