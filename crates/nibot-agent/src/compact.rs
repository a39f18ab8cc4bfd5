//! Automatic history compaction — summarize old conversation into the
//! session's `compacted_summary` with a lightweight LLM call.
//!
//! Compaction runs fire-and-forget, at most once per session at a time.
//! The stored transcript is never destroyed; the context builder simply
//! substitutes the summary for history older than its window.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use tracing::{debug, warn};

use nibot_core::session::{MessageRecord, SessionStore};
use nibot_core::types::ChatMessage;
use nibot_providers::traits::{ChatOptions, LlmProvider};

const COMPACT_PROMPT: &str = "Summarize the following conversation in 200-300 words. \
                              Preserve: key decisions, user preferences, task context, \
                              code/file references. Omit: greetings, acknowledgments, \
                              tool call details.";

/// Messages newer than this stay verbatim; older ones feed the summary.
const KEEP_RECENT: usize = 20;

/// Summarize messages into a short text. Failures are logged and come back
/// as an empty summary — compaction must never take down a turn.
pub async fn summarize_messages(
    messages: &[MessageRecord],
    provider: &dyn LlmProvider,
    max_tokens: u32,
) -> String {
    let text = messages
        .iter()
        .filter(|m| !m.content.is_empty())
        .map(|m| {
            let role = format!("{:?}", m.role).to_lowercase();
            let clipped: String = m.content.chars().take(500).collect();
            format!("[{role}]: {clipped}")
        })
        .collect::<Vec<_>>()
        .join("\n");
    if text.trim().is_empty() {
        return String::new();
    }

    let request = vec![ChatMessage::system(COMPACT_PROMPT), ChatMessage::user(text)];
    let opts = ChatOptions {
        max_tokens: Some(max_tokens),
        ..Default::default()
    };
    let response = provider.chat(&request, None, &opts).await;
    if response.is_error() {
        warn!("compaction summarization failed");
        return String::new();
    }
    response.content.unwrap_or_default().trim().to_string()
}

/// Schedules and runs deduplicated compaction tasks.
pub struct Compactor {
    provider: Arc<dyn LlmProvider>,
    sessions: Arc<SessionStore>,
    /// Sessions with a compaction currently in flight.
    in_flight: StdMutex<HashSet<String>>,
}

impl Compactor {
    pub fn new(provider: Arc<dyn LlmProvider>, sessions: Arc<SessionStore>) -> Arc<Self> {
        Arc::new(Compactor {
            provider,
            sessions,
            in_flight: StdMutex::new(HashSet::new()),
        })
    }

    /// Fire-and-forget a compaction for `session_key`. A second schedule
    /// for the same session while one is in flight is a no-op.
    pub fn schedule(self: &Arc<Self>, session_key: &str) {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if !in_flight.insert(session_key.to_string()) {
                debug!(session = %session_key, "compaction already in flight");
                return;
            }
        }

        let this = self.clone();
        let key = session_key.to_string();
        tokio::spawn(async move {
            this.run(&key).await;
            this.in_flight.lock().unwrap().remove(&key);
        });
    }

    async fn run(&self, key: &str) {
        // Snapshot the old messages under the session's key lock, release
        // it for the LLM call, re-acquire to write the summary back.
        let old: Vec<MessageRecord> = {
            let lock = self.sessions.lock_for(key);
            let _guard = lock.lock().await;
            let handle = self.sessions.get_or_create(key);
            let session = handle.lock().await;
            if session.messages.len() <= KEEP_RECENT {
                return;
            }
            let cut = session.messages.len() - KEEP_RECENT;
            session.messages[..cut].to_vec()
        };

        let summary = summarize_messages(&old, self.provider.as_ref(), 1024).await;
        if summary.is_empty() {
            return;
        }

        let lock = self.sessions.lock_for(key);
        let _guard = lock.lock().await;
        let handle = self.sessions.get_or_create(key);
        let mut session = handle.lock().await;
        session.compacted_summary = summary;
        if let Err(e) = self.sessions.save(&session) {
            warn!(session = %key, error = %e, "failed to persist compacted summary");
        } else {
            debug!(session = %key, "compacted summary written");
        }
    }

    #[cfg(test)]
    pub(crate) fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nibot_core::types::{LlmResponse, Role, ToolDefinition};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct SummaryProvider {
        calls: AtomicUsize,
        delay_ms: u64,
    }

    #[async_trait]
    impl LlmProvider for SummaryProvider {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _tools: Option<&[ToolDefinition]>,
            _opts: &ChatOptions,
        ) -> LlmResponse {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            LlmResponse::text("A tidy summary of what came before.")
        }
        fn default_model(&self) -> &str {
            "summary-model"
        }
        fn display_name(&self) -> &str {
            "SummaryProvider"
        }
    }

    struct ErrorProvider;

    #[async_trait]
    impl LlmProvider for ErrorProvider {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _tools: Option<&[ToolDefinition]>,
            _opts: &ChatOptions,
        ) -> LlmResponse {
            LlmResponse::error("boom")
        }
        fn default_model(&self) -> &str {
            "error-model"
        }
        fn display_name(&self) -> &str {
            "ErrorProvider"
        }
    }

    fn record(role: Role, content: &str) -> MessageRecord {
        MessageRecord {
            role,
            content: content.into(),
            timestamp: chrono::Utc::now(),
            id: String::new(),
            parent_id: String::new(),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    #[tokio::test]
    async fn test_summarize_empty_input_short_circuits() {
        let provider = SummaryProvider {
            calls: AtomicUsize::new(0),
            delay_ms: 0,
        };
        let summary = summarize_messages(&[], &provider, 1024).await;
        assert!(summary.is_empty());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_summarize_failure_swallowed() {
        let messages = vec![record(Role::User, "hello"), record(Role::Assistant, "hi")];
        let summary = summarize_messages(&messages, &ErrorProvider, 1024).await;
        assert!(summary.is_empty());
    }

    #[tokio::test]
    async fn test_compaction_writes_summary() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionStore::new(dir.path().join("sessions")).unwrap());
        {
            let handle = sessions.get_or_create("t:1");
            let mut s = handle.lock().await;
            for i in 0..30 {
                s.add_message(Role::User, format!("message {i}"));
            }
            sessions.save(&s).unwrap();
        }

        let compactor = Compactor::new(
            Arc::new(SummaryProvider {
                calls: AtomicUsize::new(0),
                delay_ms: 0,
            }),
            sessions.clone(),
        );
        compactor.schedule("t:1");

        // Wait for the background task to land.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if compactor.in_flight_count() == 0 {
                break;
            }
        }

        let handle = sessions.get_or_create("t:1");
        let s = handle.lock().await;
        assert_eq!(s.compacted_summary, "A tidy summary of what came before.");
        // Transcript intact.
        assert_eq!(s.messages.len(), 30);
    }

    #[tokio::test]
    async fn test_short_sessions_not_compacted() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionStore::new(dir.path().join("sessions")).unwrap());
        {
            let handle = sessions.get_or_create("t:1");
            let mut s = handle.lock().await;
            s.add_message(Role::User, "just one");
            sessions.save(&s).unwrap();
        }

        let provider = Arc::new(SummaryProvider {
            calls: AtomicUsize::new(0),
            delay_ms: 0,
        });
        let compactor = Compactor::new(provider.clone(), sessions.clone());
        compactor.schedule("t:1");

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if compactor.in_flight_count() == 0 {
                break;
            }
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_schedule_deduplicates_per_session() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionStore::new(dir.path().join("sessions")).unwrap());
        {
            let handle = sessions.get_or_create("t:1");
            let mut s = handle.lock().await;
            for i in 0..30 {
                s.add_message(Role::User, format!("m{i}"));
            }
            sessions.save(&s).unwrap();
        }

        let provider = Arc::new(SummaryProvider {
            calls: AtomicUsize::new(0),
            delay_ms: 100,
        });
        let compactor = Compactor::new(provider.clone(), sessions);

        compactor.schedule("t:1");
        compactor.schedule("t:1");
        compactor.schedule("t:1");

        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if compactor.in_flight_count() == 0 {
                break;
            }
        }
        // Only the first schedule ran; the rest were deduplicated.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }
}
