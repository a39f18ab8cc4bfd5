//! Shared data model: envelopes crossing component boundaries, tool calls
//! and results, LLM responses, and the wire-format chat messages sent to
//! OpenAI-compatible APIs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// ─────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────

/// The universal message unit between channels and the agent core.
///
/// One type serves both directions; direction is implied by which queue the
/// envelope travels on. Envelopes are treated as immutable once published.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Source/destination front-end name (e.g. "telegram", "api", "cli").
    pub channel: String,
    /// Conversation identifier, opaque to the core.
    pub chat_id: String,
    /// Sender identifier within the channel.
    pub sender_id: String,
    /// Text content.
    pub content: String,
    /// Attached media file paths, in order. May be empty.
    #[serde(default)]
    pub media: Vec<String>,
    /// Open-ended metadata. Reserved keys: `response_key`, `stream_id`,
    /// `streaming`, `stream_seq`, `stream_done`, `has_tool_calls`,
    /// `progress`, `tool_name`, `iteration`, `max_iterations`, `elapsed`,
    /// `scheduled`, `job_id`.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Creation instant.
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Create an envelope with empty media and metadata.
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Envelope {
            channel: channel.into(),
            chat_id: chat_id.into(),
            sender_id: sender_id.into(),
            content: content.into(),
            media: Vec::new(),
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Composite session key: `channel:chat_id`.
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }

    /// Builder-style metadata insertion.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Metadata value as a string, empty when absent or not a string.
    pub fn meta_str(&self, key: &str) -> &str {
        self.metadata
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Metadata value as a bool, false when absent.
    pub fn meta_flag(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Build a reply envelope addressed back to this envelope's origin.
    ///
    /// Carries over `response_key` so synchronous API waiters resolve.
    pub fn reply(&self, content: impl Into<String>) -> Envelope {
        let mut out = Envelope::new(&self.channel, &self.chat_id, "assistant", content);
        if let Some(key) = self.metadata.get("response_key") {
            out.metadata.insert("response_key".into(), key.clone());
        }
        out
    }
}

// ─────────────────────────────────────────────
// Tool calls and results
// ─────────────────────────────────────────────

/// A tool invocation requested by the LLM.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id, echoed back in the result.
    pub id: String,
    /// Tool identifier.
    pub name: String,
    /// Parsed JSON arguments (an object in the common case).
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Outcome of one tool call. Errors are carried as content with
/// `is_error = true`, never as a panic or `Err` at the registry boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(call_id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        ToolResult {
            call_id: call_id.into(),
            name: name.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(call_id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        ToolResult {
            call_id: call_id.into(),
            name: name.into(),
            content: content.into(),
            is_error: true,
        }
    }
}

/// Per-invocation sidecar handed to a tool before `execute`. Not persisted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ToolContext {
    pub channel: String,
    pub chat_id: String,
    pub session_key: String,
    pub sender_id: String,
}

impl ToolContext {
    pub fn from_envelope(envelope: &Envelope) -> Self {
        ToolContext {
            channel: envelope.channel.clone(),
            chat_id: envelope.chat_id.clone(),
            session_key: envelope.session_key(),
            sender_id: envelope.sender_id.clone(),
        }
    }
}

// ─────────────────────────────────────────────
// LLM response
// ─────────────────────────────────────────────

/// Why the model stopped generating.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    #[default]
    Stop,
    ToolCalls,
    Error,
    Length,
}

/// Token usage for one provider round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// Outcome of one provider round.
#[derive(Clone, Debug, Default)]
pub struct LlmResponse {
    /// Assistant text, if any.
    pub content: Option<String>,
    /// Requested tool calls, in the model's listed order. Empty ⇒ terminal.
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
    /// Remaining-capacity hints derived from response headers
    /// (e.g. `x-ratelimit-remaining-requests`).
    pub ratelimit_info: HashMap<String, i64>,
}

impl LlmResponse {
    /// A plain text response.
    pub fn text(content: impl Into<String>) -> Self {
        LlmResponse {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    /// An error response: message as content, `finish_reason = Error`.
    pub fn error(msg: impl Into<String>) -> Self {
        LlmResponse {
            content: Some(msg.into()),
            finish_reason: FinishReason::Error,
            ..Default::default()
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn is_error(&self) -> bool {
        self.finish_reason == FinishReason::Error
    }
}

// ─────────────────────────────────────────────
// Wire-format chat messages
// ─────────────────────────────────────────────

/// Message role in the chat-completions format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// User content — plain text or multipart (text + images).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// The textual portion; multipart content yields its text parts joined.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// One part of a multipart user message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// Tool call in the wire format (arguments as a JSON string).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

impl From<&ToolCall> for ToolCallPayload {
    fn from(tc: &ToolCall) -> Self {
        ToolCallPayload {
            id: tc.id.clone(),
            call_type: "function".into(),
            function: FunctionCall {
                name: tc.name.clone(),
                arguments: serde_json::to_string(&tc.arguments).unwrap_or_else(|_| "{}".into()),
            },
        }
    }
}

impl ToolCallPayload {
    /// Parse back into the domain type. Unparseable argument strings are
    /// wrapped as `{"raw": "..."}` so the tool still sees something.
    pub fn into_tool_call(self) -> ToolCall {
        let arguments = serde_json::from_str(&self.function.arguments)
            .unwrap_or_else(|_| serde_json::json!({ "raw": self.function.arguments }));
        ToolCall {
            id: self.id,
            name: self.function.name,
            arguments,
        }
    }
}

/// A chat message in the OpenAI wire format.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallPayload>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::System,
            content: Some(MessageContent::Text(content.into())),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::User,
            content: Some(MessageContent::Text(content.into())),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        ChatMessage {
            role: Role::User,
            content: Some(MessageContent::Parts(parts)),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::Assistant,
            content: Some(MessageContent::Text(content.into())),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    /// Assistant turn carrying tool calls (content may be empty).
    pub fn assistant_tool_calls(content: Option<String>, calls: &[ToolCall]) -> Self {
        ChatMessage {
            role: Role::Assistant,
            content: content.map(MessageContent::Text),
            tool_calls: Some(calls.iter().map(ToolCallPayload::from).collect()),
            tool_call_id: None,
            name: None,
        }
    }

    /// `role=tool` result keyed by the originating call id.
    pub fn tool_result(call_id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::Tool,
            content: Some(MessageContent::Text(content.into())),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
            name: Some(name.into()),
        }
    }
}

// ─────────────────────────────────────────────
// Tool definitions (sent to the LLM)
// ─────────────────────────────────────────────

/// LLM-facing tool definition in the chat-completions format.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        ToolDefinition {
            tool_type: "function".into(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
