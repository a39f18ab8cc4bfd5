//! OpenAI-compatible HTTP provider.
//!
//! One client covers any `/chat/completions` backend: OpenAI, OpenRouter,
//! DeepSeek, Anthropic's compatibility endpoint, and local servers
//! (Ollama, vLLM). Transient transport failures and 5xx responses are
//! retried with exponential backoff and ±25 % jitter; 4xx responses —
//! including 429 — return immediately so the pool can fail over instead of
//! waiting.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use nibot_core::types::{
    ChatMessage, FinishReason, LlmResponse, ToolCallPayload, ToolDefinition, Usage,
};

use crate::traits::{ChatOptions, LlmProvider};

/// Response headers the quota layer calibrates from.
const RATELIMIT_HEADERS: &[&str] = &[
    "x-ratelimit-remaining-requests",
    "x-ratelimit-remaining-tokens",
    "anthropic-ratelimit-requests-remaining",
    "anthropic-ratelimit-tokens-remaining",
    "retry-after",
];

pub struct HttpProvider {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    default_model: String,
    display_name: String,
    max_retries: u32,
    retry_base_delay: f64,
    default_max_tokens: u32,
    default_temperature: f64,
}

impl HttpProvider {
    pub fn new(
        display_name: impl Into<String>,
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        default_model: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("failed to build HTTP client");
        HttpProvider {
            client,
            api_base: api_base.into(),
            api_key: api_key.into(),
            default_model: default_model.into(),
            display_name: display_name.into(),
            max_retries: 3,
            retry_base_delay: 1.0,
            default_max_tokens: 4096,
            default_temperature: 0.7,
        }
    }

    pub fn with_retry(mut self, max_retries: u32, base_delay: f64) -> Self {
        self.max_retries = max_retries;
        self.retry_base_delay = base_delay.max(0.0);
        self
    }

    pub fn with_defaults(mut self, max_tokens: u32, temperature: f64) -> Self {
        self.default_max_tokens = max_tokens;
        self.default_temperature = temperature;
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_base.trim_end_matches('/'))
    }

    /// Exponential backoff for `attempt` (0-based) with ±25 % jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.retry_base_delay * 2f64.powi(attempt as i32);
        Duration::from_secs_f64((base * jitter_factor()).max(0.0))
    }
}

/// A multiplier in [0.75, 1.25) derived from the clock — enough spread to
/// decorrelate concurrent retries without pulling in an RNG crate.
fn jitter_factor() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    0.75 + 0.5 * f64::from(nanos % 1000) / 1000.0
}

#[async_trait]
impl LlmProvider for HttpProvider {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        opts: &ChatOptions,
    ) -> LlmResponse {
        let model = opts.model.clone().unwrap_or_else(|| self.default_model.clone());
        let body = ChatCompletionRequest {
            model: model.clone(),
            messages: messages.to_vec(),
            tools: tools.map(<[ToolDefinition]>::to_vec),
            tool_choice: tools.map(|_| "auto".to_string()),
            max_tokens: Some(opts.max_tokens.unwrap_or(self.default_max_tokens)),
            temperature: Some(opts.temperature.unwrap_or(self.default_temperature)),
        };
        let url = self.completions_url();

        let mut attempt = 0;
        loop {
            debug!(
                provider = %self.display_name,
                model = %model,
                messages = messages.len(),
                attempt,
                "calling LLM"
            );

            let sent = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            let response = match sent {
                Ok(r) => r,
                Err(e) => {
                    if attempt < self.max_retries {
                        let delay = self.backoff(attempt);
                        warn!(provider = %self.display_name, error = %e, ?delay, "transport error, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    error!(provider = %self.display_name, error = %e, "LLM request failed");
                    return LlmResponse::error(format!("Error calling LLM: {e}"));
                }
            };

            let status = response.status();
            let ratelimit_info = extract_ratelimit_info(response.headers());

            if status.is_server_error() && attempt < self.max_retries {
                let delay = self.backoff(attempt);
                warn!(provider = %self.display_name, status = %status, ?delay, "server error, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            if !status.is_success() {
                let body_text = response.text().await.unwrap_or_default();
                error!(provider = %self.display_name, status = %status, body = %body_text, "API error");
                let mut resp = LlmResponse::error(format!(
                    "Error calling LLM: HTTP {} — {}",
                    status.as_u16(),
                    body_text
                ));
                resp.ratelimit_info = ratelimit_info;
                return resp;
            }

            return match response.json::<ChatCompletionResponse>().await {
                Ok(parsed) => {
                    let mut resp: LlmResponse = parsed.into();
                    resp.ratelimit_info = ratelimit_info;
                    resp
                }
                Err(e) => {
                    error!(provider = %self.display_name, error = %e, "failed to parse LLM response");
                    LlmResponse::error(format!("Error parsing LLM response: {e}"))
                }
            };
        }
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }
}

fn extract_ratelimit_info(headers: &reqwest::header::HeaderMap) -> std::collections::HashMap<String, i64> {
    let mut info = std::collections::HashMap::new();
    for name in RATELIMIT_HEADERS {
        if let Some(value) = headers.get(*name).and_then(|v| v.to_str().ok()) {
            if let Ok(n) = value.trim().parse::<i64>() {
                info.insert((*name).to_string(), n);
            }
        }
    }
    info
}

// ─────────────────────────────────────────────
// Wire structs
// ─────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallPayload>>,
}

impl From<ChatCompletionResponse> for LlmResponse {
    fn from(resp: ChatCompletionResponse) -> Self {
        let usage = resp.usage.unwrap_or_default();
        let Some(choice) = resp.choices.into_iter().next() else {
            return LlmResponse::error("No choices in response");
        };
        let tool_calls: Vec<_> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(ToolCallPayload::into_tool_call)
            .collect();
        let finish_reason = match choice.finish_reason.as_deref() {
            Some("length") => FinishReason::Length,
            Some("tool_calls") => FinishReason::ToolCalls,
            _ if !tool_calls.is_empty() => FinishReason::ToolCalls,
            _ => FinishReason::Stop,
        };
        LlmResponse {
            content: choice.message.content,
            tool_calls,
            finish_reason,
            usage,
            ratelimit_info: Default::default(),
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_for(server: &MockServer) -> HttpProvider {
        HttpProvider::new("test", server.uri(), "sk-test", "test-model")
            .with_retry(2, 0.01)
    }

    #[tokio::test]
    async fn test_chat_text_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {"content": "Hello!", "tool_calls": null},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 10, "completion_tokens": 3, "total_tokens": 13}
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let resp = provider
            .chat(&[ChatMessage::user("hi")], None, &ChatOptions::default())
            .await;

        assert_eq!(resp.content.as_deref(), Some("Hello!"));
        assert_eq!(resp.finish_reason, FinishReason::Stop);
        assert_eq!(resp.usage.total_tokens, 13);
    }

    #[tokio::test]
    async fn test_chat_tool_call_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {
                        "content": null,
                        "tool_calls": [{
                            "id": "call_42",
                            "type": "function",
                            "function": {"name": "exec", "arguments": "{\"command\": \"ls\"}"}
                        }]
                    },
                    "finish_reason": "tool_calls"
                }]
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let resp = provider
            .chat(&[ChatMessage::user("list files")], None, &ChatOptions::default())
            .await;

        assert!(resp.has_tool_calls());
        assert_eq!(resp.tool_calls[0].name, "exec");
        assert_eq!(resp.tool_calls[0].arguments["command"], "ls");
        assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
    }

    #[tokio::test]
    async fn test_429_is_not_retried_and_names_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "30")
                    .set_body_string("rate limited"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let resp = provider
            .chat(&[ChatMessage::user("hi")], None, &ChatOptions::default())
            .await;

        assert!(resp.is_error());
        assert!(resp.content.as_deref().unwrap().contains("HTTP 429"));
        assert_eq!(resp.ratelimit_info.get("retry-after"), Some(&30));
    }

    #[tokio::test]
    async fn test_5xx_retried_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "recovered"}, "finish_reason": "stop"}]
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let resp = provider
            .chat(&[ChatMessage::user("hi")], None, &ChatOptions::default())
            .await;
        assert_eq!(resp.content.as_deref(), Some("recovered"));
    }

    #[tokio::test]
    async fn test_ratelimit_headers_captured() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-ratelimit-remaining-requests", "41")
                    .insert_header("x-ratelimit-remaining-tokens", "39500")
                    .set_body_json(json!({
                        "choices": [{"message": {"content": "ok"}, "finish_reason": "stop"}]
                    })),
            )
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let resp = provider
            .chat(&[ChatMessage::user("hi")], None, &ChatOptions::default())
            .await;
        assert_eq!(resp.ratelimit_info["x-ratelimit-remaining-requests"], 41);
        assert_eq!(resp.ratelimit_info["x-ratelimit-remaining-tokens"], 39500);
    }

    #[tokio::test]
    async fn test_empty_choices_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let resp = provider
            .chat(&[ChatMessage::user("hi")], None, &ChatOptions::default())
            .await;
        assert!(resp.is_error());
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..100 {
            let f = jitter_factor();
            assert!((0.75..1.25).contains(&f));
        }
    }

    #[test]
    fn test_backoff_grows() {
        let p = HttpProvider::new("t", "http://localhost", "", "m").with_retry(3, 1.0);
        // Jitter keeps each delay within ±25 % of the exponential base.
        let d0 = p.backoff(0).as_secs_f64();
        let d2 = p.backoff(2).as_secs_f64();
        assert!((0.75..=1.25).contains(&d0));
        assert!((3.0..=5.0).contains(&d2));
    }
}
