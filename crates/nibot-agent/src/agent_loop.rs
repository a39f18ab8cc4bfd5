//! Agent loop — the single consumer of the inbound queue and the LLM +
//! tool iteration state machine.
//!
//! The pump never blocks on one message: every envelope gets its own
//! handler task, so distinct conversations run in parallel. Within one
//! session key, handlers serialize on `SessionStore::lock_for`, which
//! hands the lock out in FIFO order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use nibot_core::bus::MessageBus;
use nibot_core::config::AgentConfig;
use nibot_core::event_log::EventLog;
use nibot_core::rate_limiter::SlidingWindowRateLimiter;
use nibot_core::session::{MessageDraft, SessionStore};
use nibot_core::types::{ChatMessage, Envelope, LlmResponse, Role, ToolContext, ToolDefinition};
use nibot_providers::pool::ProviderPool;
use nibot_providers::traits::{ChatOptions, LlmProvider, StreamEvent};

use crate::compact::Compactor;
use crate::context::ContextBuilder;
use crate::tools::registry::ToolRegistry;

/// Poll granularity for the pump and content threshold for stream flushes.
const POLL: Duration = Duration::from_secs(1);
const STREAM_FLUSH_CHARS: usize = 30;

/// The reply used when the iteration cap is hit without a terminal
/// response.
const MAX_ITERATIONS_FALLBACK: &str = "Unable to complete this request (max_iterations reached).";

/// Handler failure. Only `kind()` is ever shown to the user — error
/// strings can carry keys or credentialed URLs.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to persist session: {0}")]
    SessionSave(String),
    #[error("failed to publish reply: {0}")]
    Publish(String),
}

impl AgentError {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::SessionSave(_) => "SessionSave",
            AgentError::Publish(_) => "Publish",
        }
    }
}

/// Loop tunables, lifted from the agent section of the config.
#[derive(Clone, Debug)]
pub struct AgentLoopConfig {
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f64,
    pub max_iterations: usize,
    pub fallback_chain: Vec<String>,
    /// Non-empty: the tool allow-list for end-user channels.
    pub gateway_tools: Vec<String>,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        AgentLoopConfig {
            model: None,
            max_tokens: 4096,
            temperature: 0.7,
            max_iterations: 20,
            fallback_chain: Vec::new(),
            gateway_tools: Vec::new(),
        }
    }
}

impl From<&AgentConfig> for AgentLoopConfig {
    fn from(agent: &AgentConfig) -> Self {
        AgentLoopConfig {
            model: Some(agent.model.clone()),
            max_tokens: agent.max_tokens,
            temperature: agent.temperature,
            max_iterations: agent.max_iterations,
            fallback_chain: agent.provider_fallback_chain.clone(),
            gateway_tools: agent.gateway_tools.clone(),
        }
    }
}

// ─────────────────────────────────────────────
// AgentLoop
// ─────────────────────────────────────────────

pub struct AgentLoop {
    bus: Arc<MessageBus>,
    provider: Arc<dyn LlmProvider>,
    pool: Arc<ProviderPool>,
    registry: Arc<ToolRegistry>,
    sessions: Arc<SessionStore>,
    context: Arc<ContextBuilder>,
    compactor: Arc<Compactor>,
    rate_limiter: Option<Arc<SlidingWindowRateLimiter>>,
    event_log: Arc<EventLog>,
    config: AgentLoopConfig,
    running: AtomicBool,
    handlers: StdMutex<Vec<JoinHandle<()>>>,
}

impl AgentLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<MessageBus>,
        provider: Arc<dyn LlmProvider>,
        pool: Arc<ProviderPool>,
        registry: Arc<ToolRegistry>,
        sessions: Arc<SessionStore>,
        context: Arc<ContextBuilder>,
        compactor: Arc<Compactor>,
        rate_limiter: Option<Arc<SlidingWindowRateLimiter>>,
        event_log: Arc<EventLog>,
        config: AgentLoopConfig,
    ) -> Arc<Self> {
        Arc::new(AgentLoop {
            bus,
            provider,
            pool,
            registry,
            sessions,
            context,
            compactor,
            rate_limiter,
            event_log,
            config,
            running: AtomicBool::new(false),
            handlers: StdMutex::new(Vec::new()),
        })
    }

    /// The pump: dequeue inbound envelopes and spawn one handler task per
    /// message. Polls with a bounded wait so `stop()` is observed promptly.
    pub async fn run(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        info!("agent loop started, waiting for messages");
        while self.running.load(Ordering::SeqCst) {
            let envelope = match tokio::time::timeout(POLL, self.bus.consume_inbound()).await {
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(envelope)) => envelope,
            };
            debug!(session = %envelope.session_key(), "received message");

            let this = self.clone();
            let handle = tokio::spawn(async move {
                this.handle_envelope(envelope).await;
            });
            let mut handlers = self.handlers.lock().unwrap();
            handlers.retain(|h| !h.is_finished());
            handlers.push(handle);
        }
        info!("agent loop exiting");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn active_handlers(&self) -> usize {
        self.handlers
            .lock()
            .unwrap()
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Await outstanding handlers up to `timeout`, then cancel the rest.
    pub async fn shutdown(&self, timeout: Duration) {
        self.stop();
        let handles: Vec<JoinHandle<()>> = {
            let mut handlers = self.handlers.lock().unwrap();
            handlers.drain(..).collect()
        };
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), "waiting for in-flight agent handlers");
        let deadline = tokio::time::Instant::now() + timeout;
        for mut handle in handles {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                warn!("timeout waiting for handler, cancelling");
                handle.abort();
            }
        }
    }

    // ────────────── handler ──────────────

    /// One envelope, admission through publication. Failures surface to
    /// the user by error kind only, and are always logged in full.
    async fn handle_envelope(self: Arc<Self>, envelope: Envelope) {
        if let Some(limiter) = &self.rate_limiter {
            if limiter.enabled() {
                let (allowed, reason) = limiter.check(&envelope.sender_id, &envelope.channel);
                if !allowed {
                    debug!(sender = %envelope.sender_id, "rate limited");
                    let _ = self.bus.publish_outbound(envelope.reply(reason)).await;
                    return;
                }
            }
        }

        let started = Instant::now();
        if let Err(e) = self.process(&envelope, started).await {
            error!(session = %envelope.session_key(), error = %e, "message processing error");
            let text = format!(
                "Something went wrong while processing your message ({}).",
                e.kind()
            );
            let _ = self.bus.publish_outbound(envelope.reply(text)).await;
        }
    }

    async fn process(&self, envelope: &Envelope, started: Instant) -> Result<(), AgentError> {
        let session_key = envelope.session_key();

        // Serial order per conversation: hold the key lock for the whole
        // turn. The lock is fair, so same-session envelopes process in
        // arrival order.
        let key_lock = self.sessions.lock_for(&session_key);
        let _guard = key_lock.lock().await;

        let session_handle = self.sessions.get_or_create(&session_key);
        let built = {
            let session = session_handle.lock().await;
            self.context.build(&session, envelope)
        };
        if built.needs_compaction {
            self.compactor.schedule(&session_key);
        }

        let stream_id = envelope.meta_str("stream_id").to_string();
        let tool_defs = self.visible_tools(&envelope.channel);
        let tool_defs_opt = (!tool_defs.is_empty()).then_some(tool_defs.as_slice());
        let ctx = ToolContext::from_envelope(envelope);
        let opts = ChatOptions {
            model: self.config.model.clone(),
            max_tokens: Some(self.config.max_tokens),
            temperature: Some(self.config.temperature),
        };

        let mut messages = built.messages;
        let mut drafts: Vec<MessageDraft> = vec![MessageDraft::new(Role::User, &envelope.content)];
        let mut final_content: Option<String> = None;
        let mut tool_count = 0usize;
        let mut total_tokens = 0u32;
        let mut stream_seq = 0u64;

        for iteration in 0..self.config.max_iterations {
            if !stream_id.is_empty() {
                self.publish_progress(
                    envelope,
                    &stream_id,
                    "thinking",
                    serde_json::json!({
                        "iteration": iteration,
                        "max_iterations": self.config.max_iterations,
                    }),
                )
                .await;
            }

            let response = if !stream_id.is_empty() && self.config.fallback_chain.is_empty() {
                self.stream_round(&messages, tool_defs_opt, &opts, envelope, &stream_id, &mut stream_seq)
                    .await
            } else if !self.config.fallback_chain.is_empty() {
                self.pool
                    .chat_with_fallback(&messages, tool_defs_opt, &self.config.fallback_chain, &opts)
                    .await
            } else {
                self.provider.chat(&messages, tool_defs_opt, &opts).await
            };
            total_tokens += response.usage.total_tokens;

            if !response.has_tool_calls() {
                // Terminal round. Provider errors arrive here too, already
                // sanitized to a message by the provider layer.
                final_content = Some(response.content.unwrap_or_default());
                break;
            }

            let calls = response.tool_calls.clone();
            messages.push(ChatMessage::assistant_tool_calls(response.content.clone(), &calls));
            drafts.push(
                MessageDraft::new(Role::Assistant, response.content.unwrap_or_default())
                    .with_tool_calls(calls.clone()),
            );

            for call in &calls {
                if !stream_id.is_empty() {
                    self.publish_progress(
                        envelope,
                        &stream_id,
                        "tool_start",
                        serde_json::json!({"tool_name": call.name, "iteration": iteration}),
                    )
                    .await;
                }
                let t0 = Instant::now();
                let result = self
                    .registry
                    .execute(&call.name, &call.arguments, &call.id, Some(&ctx))
                    .await;
                tool_count += 1;
                if !stream_id.is_empty() {
                    self.publish_progress(
                        envelope,
                        &stream_id,
                        "tool_done",
                        serde_json::json!({
                            "tool_name": call.name,
                            "elapsed": t0.elapsed().as_secs_f64(),
                        }),
                    )
                    .await;
                }
                messages.push(ChatMessage::tool_result(&call.id, &call.name, &result.content));
                drafts.push(
                    MessageDraft::new(Role::Tool, result.content).with_tool_result(&call.id, &call.name),
                );
            }
        }

        let final_content = final_content.unwrap_or_else(|| MAX_ITERATIONS_FALLBACK.to_string());
        drafts.push(MessageDraft::new(Role::Assistant, &final_content));

        // Persist the whole turn, then reply.
        {
            let mut session = session_handle.lock().await;
            for draft in drafts {
                session.push(draft);
            }
            self.sessions
                .save(&session)
                .map_err(|e| AgentError::SessionSave(e.to_string()))?;
        }

        self.bus
            .publish_outbound(envelope.reply(&final_content))
            .await
            .map_err(|e| AgentError::Publish(e.to_string()))?;

        let provider_label = self
            .config
            .fallback_chain
            .first()
            .cloned()
            .unwrap_or_else(|| self.provider.display_name().to_string());
        self.event_log.log_request(
            &envelope.channel,
            &session_key,
            started.elapsed().as_secs_f64() * 1000.0,
            tool_count,
            total_tokens,
            &provider_label,
        );
        Ok(())
    }

    /// Tool definitions visible on this channel. A non-empty gateway list
    /// restricts end-user channels; the operator-facing `cli` channel
    /// always sees everything.
    fn visible_tools(&self, channel: &str) -> Vec<ToolDefinition> {
        if !self.config.gateway_tools.is_empty() && channel != "cli" {
            self.registry
                .get_definitions_filtered(Some(&self.config.gateway_tools), &[])
        } else {
            self.registry.get_definitions()
        }
    }

    /// One streamed provider round: cumulative-content chunks while text
    /// arrives, a terminal flush with `stream_done` and `has_tool_calls`,
    /// and the final response returned to the iteration.
    async fn stream_round(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        opts: &ChatOptions,
        envelope: &Envelope,
        stream_id: &str,
        seq: &mut u64,
    ) -> LlmResponse {
        let mut rx = self.provider.chat_stream(messages, tools, opts).await;
        let mut accumulated = String::new();
        let mut flushed_len = 0usize;
        let mut final_response: Option<LlmResponse> = None;

        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Text(fragment) => {
                    accumulated.push_str(&fragment);
                    if accumulated.len() - flushed_len >= STREAM_FLUSH_CHARS {
                        flushed_len = accumulated.len();
                        *seq += 1;
                        let chunk = self
                            .stream_envelope(envelope, stream_id, accumulated.clone())
                            .with_meta("stream_seq", *seq);
                        let _ = self.bus.publish_outbound(chunk).await;
                    }
                }
                StreamEvent::ToolCallDelta { index, name, .. } => {
                    debug!(index, tool = %name, "tool call streaming");
                }
                StreamEvent::Final(response) => {
                    final_response = Some(response);
                }
            }
        }

        let response = final_response
            .unwrap_or_else(|| LlmResponse::error("stream ended without a final response"));

        *seq += 1;
        let content = if accumulated.is_empty() {
            response.content.clone().unwrap_or_default()
        } else {
            accumulated
        };
        let done = self
            .stream_envelope(envelope, stream_id, content)
            .with_meta("stream_seq", *seq)
            .with_meta("stream_done", true)
            .with_meta("has_tool_calls", response.has_tool_calls());
        let _ = self.bus.publish_outbound(done).await;

        response
    }

    /// Interim envelopes deliberately skip `response_key`: only the final
    /// reply may resolve a synchronous waiter.
    fn stream_envelope(&self, envelope: &Envelope, stream_id: &str, content: String) -> Envelope {
        Envelope::new(&envelope.channel, &envelope.chat_id, "assistant", content)
            .with_meta("streaming", true)
            .with_meta("stream_id", stream_id)
    }

    async fn publish_progress(
        &self,
        envelope: &Envelope,
        stream_id: &str,
        kind: &str,
        extra: serde_json::Value,
    ) {
        let mut out = Envelope::new(&envelope.channel, &envelope.chat_id, "assistant", "")
            .with_meta("progress", kind)
            .with_meta("stream_id", stream_id);
        if let Some(obj) = extra.as_object() {
            for (k, v) in obj {
                out.metadata.insert(k.clone(), v.clone());
            }
        }
        let _ = self.bus.publish_outbound(out).await;
    }
}

// ─────────────────────────────────────────────
// Tests — end-to-end scenarios through the bus
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nibot_core::rate_limiter::RateLimitConfig;
    use nibot_core::types::ToolCall;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    // ── Mock providers and tools ──

    struct MockProvider {
        responses: StdMutex<Vec<LlmResponse>>,
        fallback_text: String,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl MockProvider {
        /// Responses returned in listed order; afterwards, the fallback.
        fn scripted(responses: Vec<LlmResponse>) -> Arc<Self> {
            Arc::new(MockProvider {
                responses: StdMutex::new(responses),
                fallback_text: "(no more responses)".into(),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            })
        }

        /// Answers every call with the same text after `delay`.
        fn repeating_text(text: &str, delay: Duration) -> Arc<Self> {
            Arc::new(MockProvider {
                responses: StdMutex::new(vec![]),
                fallback_text: text.into(),
                calls: AtomicUsize::new(0),
                delay,
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmProvider for MockProvider {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _tools: Option<&[ToolDefinition]>,
            _opts: &ChatOptions,
        ) -> LlmResponse {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = {
                let mut responses = self.responses.lock().unwrap();
                if responses.is_empty() {
                    None
                } else {
                    Some(responses.remove(0))
                }
            };
            next.unwrap_or_else(|| LlmResponse::text(&self.fallback_text))
        }
        fn default_model(&self) -> &str {
            "mock-model"
        }
        fn display_name(&self) -> &str {
            "MockProvider"
        }
    }

    struct EchoTool;

    #[async_trait]
    impl crate::tools::base::Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the input"
        }
        fn parameters(&self) -> serde_json::Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]})
        }
        async fn execute(
            &self,
            params: HashMap<String, serde_json::Value>,
        ) -> anyhow::Result<String> {
            Ok(format!(
                "echo: {}",
                params.get("text").and_then(serde_json::Value::as_str).unwrap_or("")
            ))
        }
    }

    struct FailTool;

    #[async_trait]
    impl crate::tools::base::Tool for FailTool {
        fn name(&self) -> &str {
            "fail_tool"
        }
        fn description(&self) -> &str {
            "Always fails"
        }
        fn parameters(&self) -> serde_json::Value {
            json!({"type": "object", "properties": {}})
        }
        async fn execute(
            &self,
            _params: HashMap<String, serde_json::Value>,
        ) -> anyhow::Result<String> {
            anyhow::bail!("intentional failure")
        }
    }

    // ── Harness ──

    struct Harness {
        agent: Arc<AgentLoop>,
        bus: Arc<MessageBus>,
        sessions: Arc<SessionStore>,
        _dir: tempfile::TempDir,
    }

    fn make_harness(
        provider: Arc<dyn LlmProvider>,
        tools: Vec<Arc<dyn crate::tools::base::Tool>>,
        max_iterations: usize,
        rate: Option<RateLimitConfig>,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(MessageBus::new(0));
        let event_log = Arc::new(EventLog::disabled());
        let mut registry = ToolRegistry::new(event_log.clone());
        for tool in tools {
            registry.register(tool);
        }
        let sessions = Arc::new(SessionStore::new(dir.path().join("sessions")).unwrap());
        let context = Arc::new(ContextBuilder::new(dir.path(), "NiBot", 128_000, 4096));
        let compactor = Compactor::new(provider.clone(), sessions.clone());
        let pool = Arc::new(ProviderPool::new(
            Default::default(),
            provider.clone(),
            event_log.clone(),
        ));
        let rate_limiter = rate.map(|c| Arc::new(SlidingWindowRateLimiter::new(c)));

        let agent = AgentLoop::new(
            bus.clone(),
            provider,
            pool,
            Arc::new(registry),
            sessions.clone(),
            context,
            compactor,
            rate_limiter,
            event_log,
            AgentLoopConfig {
                max_iterations,
                ..Default::default()
            },
        );
        Harness {
            agent,
            bus,
            sessions,
            _dir: dir,
        }
    }

    async fn collect_outbound(bus: &MessageBus, n: usize, timeout: Duration) -> Vec<Envelope> {
        let mut out = Vec::new();
        let deadline = tokio::time::Instant::now() + timeout;
        while out.len() < n {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, bus.consume_outbound()).await {
                Ok(Some(envelope)) => out.push(envelope),
                _ => break,
            }
        }
        out
    }

    async fn run_pump(harness: &Harness) -> JoinHandle<()> {
        let agent = harness.agent.clone();
        tokio::spawn(agent.run())
    }

    async fn stop_pump(harness: &Harness, pump: JoinHandle<()>) {
        harness.agent.stop();
        let _ = tokio::time::timeout(Duration::from_secs(3), pump).await;
    }

    // ── Scenario 1: plain reply ──

    #[tokio::test]
    async fn test_plain_reply() {
        let provider = MockProvider::scripted(vec![LlmResponse::text("Hello back!")]);
        let harness = make_harness(provider.clone(), vec![], 20, None);
        let pump = run_pump(&harness).await;

        harness
            .bus
            .publish_inbound(Envelope::new("test", "c1", "u1", "Hello"))
            .await
            .unwrap();

        let out = collect_outbound(&harness.bus, 1, Duration::from_secs(3)).await;
        stop_pump(&harness, pump).await;

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].channel, "test");
        assert_eq!(out[0].content, "Hello back!");
        assert_eq!(provider.call_count(), 1);

        let handle = harness.sessions.get_or_create("test:c1");
        let session = handle.lock().await;
        let roles: Vec<Role> = session.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert_eq!(session.messages[1].content, "Hello back!");
    }

    // ── Scenario 2: single tool call ──

    #[tokio::test]
    async fn test_single_tool_call() {
        let provider = MockProvider::scripted(vec![
            LlmResponse {
                tool_calls: vec![ToolCall::new("tc1", "echo", json!({"text": "world"}))],
                ..Default::default()
            },
            LlmResponse::text("The echo returned: echo: world"),
        ]);
        let harness = make_harness(provider.clone(), vec![Arc::new(EchoTool)], 20, None);
        let pump = run_pump(&harness).await;

        harness
            .bus
            .publish_inbound(Envelope::new("test", "c1", "u1", "Echo test"))
            .await
            .unwrap();

        let out = collect_outbound(&harness.bus, 1, Duration::from_secs(3)).await;
        stop_pump(&harness, pump).await;

        assert_eq!(out.len(), 1);
        assert!(out[0].content.contains("echo: world"));
        assert_eq!(provider.call_count(), 2);

        // Full turn persisted: user, assistant+tool_calls, tool, assistant.
        let handle = harness.sessions.get_or_create("test:c1");
        let session = handle.lock().await;
        let roles: Vec<Role> = session.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        assert!(session.messages[1].tool_calls.is_some());
        assert_eq!(session.messages[2].tool_call_id.as_deref(), Some("tc1"));
        assert_eq!(session.messages[2].content, "echo: world");
    }

    // ── Scenario 3: tool failure recovery ──

    #[tokio::test]
    async fn test_tool_failure_recovery() {
        let provider = MockProvider::scripted(vec![
            LlmResponse {
                tool_calls: vec![ToolCall::new("tc1", "fail_tool", json!({}))],
                ..Default::default()
            },
            LlmResponse::text("Sorry, the tool failed. Let me try differently."),
        ]);
        let harness = make_harness(provider.clone(), vec![Arc::new(FailTool)], 20, None);
        let pump = run_pump(&harness).await;

        harness
            .bus
            .publish_inbound(Envelope::new("test", "c1", "u1", "Try the tool"))
            .await
            .unwrap();

        let out = collect_outbound(&harness.bus, 1, Duration::from_secs(3)).await;
        stop_pump(&harness, pump).await;

        assert_eq!(out.len(), 1);
        assert!(!out[0].content.is_empty());

        // The LLM saw the failure as tool content.
        let handle = harness.sessions.get_or_create("test:c1");
        let session = handle.lock().await;
        let tool_msg = session.messages.iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(tool_msg.content.contains("Error"));
    }

    // ── Scenario 4: iteration exhaustion ──

    #[tokio::test]
    async fn test_iteration_exhaustion() {
        let tool_response = || LlmResponse {
            tool_calls: vec![ToolCall::new("tc", "echo", json!({"text": "again"}))],
            ..Default::default()
        };
        let provider = MockProvider::scripted((0..10).map(|_| tool_response()).collect());
        let harness = make_harness(provider.clone(), vec![Arc::new(EchoTool)], 3, None);
        let pump = run_pump(&harness).await;

        harness
            .bus
            .publish_inbound(Envelope::new("test", "c1", "u1", "loop forever"))
            .await
            .unwrap();

        let out = collect_outbound(&harness.bus, 1, Duration::from_secs(3)).await;
        stop_pump(&harness, pump).await;

        assert_eq!(provider.call_count(), 3);
        assert_eq!(out.len(), 1);
        assert!(out[0].content.to_lowercase().contains("unable to complete"));
    }

    // ── Scenario 5: rate limit ──

    #[tokio::test]
    async fn test_rate_limit_rejection() {
        let provider = MockProvider::scripted(vec![
            LlmResponse::text("reply one"),
            LlmResponse::text("reply two"),
        ]);
        let harness = make_harness(
            provider,
            vec![],
            20,
            Some(RateLimitConfig {
                per_user_rpm: 2,
                per_channel_rpm: 100,
                enabled: true,
            }),
        );
        let pump = run_pump(&harness).await;

        for i in 0..3 {
            harness
                .bus
                .publish_inbound(Envelope::new("test", "c1", "u1", format!("msg {i}")))
                .await
                .unwrap();
        }

        let out = collect_outbound(&harness.bus, 3, Duration::from_secs(3)).await;
        stop_pump(&harness, pump).await;

        assert_eq!(out.len(), 3);
        assert!(out
            .iter()
            .any(|e| e.content.to_lowercase().contains("rate limit")));
    }

    // ── Scenario 6: parallel sessions ──

    #[tokio::test]
    async fn test_parallel_sessions_complete_concurrently() {
        let provider = MockProvider::repeating_text("done", Duration::from_millis(100));
        let harness = make_harness(provider, vec![], 20, None);
        let pump = run_pump(&harness).await;

        let started = Instant::now();
        for i in 0..5 {
            harness
                .bus
                .publish_inbound(Envelope::new("test", format!("chat_{i}"), "u1", "go"))
                .await
                .unwrap();
        }
        let out = collect_outbound(&harness.bus, 5, Duration::from_secs(3)).await;
        let elapsed = started.elapsed();
        stop_pump(&harness, pump).await;

        assert_eq!(out.len(), 5);
        // Parallel across sessions: five 100 ms calls well under serial time.
        assert!(elapsed < Duration::from_millis(350), "took {elapsed:?}");
    }

    // ── Property 2: serial within one session ──

    #[tokio::test]
    async fn test_same_session_serializes() {
        let provider = MockProvider::repeating_text("done", Duration::from_millis(100));
        let harness = make_harness(provider, vec![], 20, None);
        let pump = run_pump(&harness).await;

        let started = Instant::now();
        for i in 0..2 {
            harness
                .bus
                .publish_inbound(Envelope::new("test", "same_chat", "u1", format!("m{i}")))
                .await
                .unwrap();
        }
        let out = collect_outbound(&harness.bus, 2, Duration::from_secs(3)).await;
        let elapsed = started.elapsed();
        stop_pump(&harness, pump).await;

        assert_eq!(out.len(), 2);
        // Same key ⇒ handlers hold the same lock ⇒ at least 2×100 ms.
        assert!(elapsed >= Duration::from_millis(200), "took {elapsed:?}");

        // And the lock object is shared.
        let a = harness.sessions.lock_for("test:same_chat");
        let b = harness.sessions.lock_for("test:same_chat");
        assert!(Arc::ptr_eq(&a, &b));
    }

    // ── Streaming and progress ──

    #[tokio::test]
    async fn test_streaming_chunks_and_progress() {
        let long_text = "This reply is comfortably longer than the flush threshold of thirty characters.";
        let provider = MockProvider::scripted(vec![LlmResponse::text(long_text)]);
        let harness = make_harness(provider, vec![], 20, None);
        let pump = run_pump(&harness).await;

        harness
            .bus
            .publish_inbound(
                Envelope::new("web", "c1", "u1", "stream please").with_meta("stream_id", "s-1"),
            )
            .await
            .unwrap();

        // thinking + interim chunk + done chunk + final reply
        let out = collect_outbound(&harness.bus, 4, Duration::from_secs(3)).await;
        stop_pump(&harness, pump).await;

        let thinking: Vec<&Envelope> = out.iter().filter(|e| e.meta_str("progress") == "thinking").collect();
        assert!(!thinking.is_empty());
        assert_eq!(thinking[0].meta_str("stream_id"), "s-1");

        let chunks: Vec<&Envelope> = out.iter().filter(|e| e.meta_flag("streaming")).collect();
        assert!(!chunks.is_empty());
        // stream_seq strictly increasing.
        let seqs: Vec<i64> = chunks
            .iter()
            .filter_map(|e| e.metadata.get("stream_seq").and_then(serde_json::Value::as_i64))
            .collect();
        for pair in seqs.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        // Exactly one stream_done, carrying has_tool_calls=false.
        let done: Vec<&&Envelope> = chunks.iter().filter(|e| e.meta_flag("stream_done")).collect();
        assert_eq!(done.len(), 1);
        assert!(!done[0].meta_flag("has_tool_calls"));
        assert_eq!(done[0].content, long_text);

        // The final, non-streaming reply still goes out.
        assert!(out
            .iter()
            .any(|e| !e.meta_flag("streaming") && e.content == long_text));
    }

    // ── Synchronous waiter key ──

    #[tokio::test]
    async fn test_response_key_preserved() {
        let provider = MockProvider::scripted(vec![LlmResponse::text("pong")]);
        let harness = make_harness(provider, vec![], 20, None);
        let pump = run_pump(&harness).await;

        harness
            .bus
            .publish_inbound(
                Envelope::new("api", "c1", "u1", "ping").with_meta("response_key", "_response_k1"),
            )
            .await
            .unwrap();

        let out = collect_outbound(&harness.bus, 1, Duration::from_secs(3)).await;
        stop_pump(&harness, pump).await;

        assert_eq!(out[0].meta_str("response_key"), "_response_k1");
    }

    // ── Handler failure surfaces kind only ──

    #[cfg(unix)]
    #[tokio::test]
    async fn test_save_failure_names_error_kind_only() {
        let provider = MockProvider::scripted(vec![LlmResponse::text("hello")]);
        let harness = make_harness(provider, vec![], 20, None);

        // Break the sessions directory: replace it with a plain file so
        // every save fails.
        let sessions_dir = harness._dir.path().join("sessions");
        std::fs::remove_dir_all(&sessions_dir).unwrap();
        std::fs::write(&sessions_dir, "not a directory").unwrap();

        let pump = run_pump(&harness).await;
        harness
            .bus
            .publish_inbound(Envelope::new("test", "c1", "u1", "hi"))
            .await
            .unwrap();

        let out = collect_outbound(&harness.bus, 1, Duration::from_secs(3)).await;
        stop_pump(&harness, pump).await;

        assert_eq!(out.len(), 1);
        assert!(out[0].content.contains("(SessionSave)"));
        // No raw error text in the user-visible reply.
        assert!(!out[0].content.contains("not a directory"));
        assert!(!out[0].content.to_lowercase().contains("permission"));
    }

    // ── Stop semantics ──

    #[tokio::test]
    async fn test_stop_exits_pump() {
        let provider = MockProvider::scripted(vec![]);
        let harness = make_harness(provider, vec![], 20, None);
        let pump = run_pump(&harness).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(harness.agent.is_running());
        harness.agent.stop();
        tokio::time::timeout(Duration::from_secs(3), pump)
            .await
            .expect("pump should exit after stop")
            .unwrap();
    }
}
