//! Context builder — assembles the LLM message list for one turn.
//!
//! Composition: system prompt (identity, bootstrap files, runtime context,
//! memory notes) → compacted-history summary, if any → recent session
//! history → the current user turn (multimodal when media is attached).
//!
//! Before returning, the builder estimates total tokens against
//! `context_window - context_reserve`; over budget it drops oldest history
//! messages and signals that a compaction task should run. Building is
//! side-effect-free — the caller owns scheduling.

use std::path::PathBuf;

use chrono::Utc;
use tracing::debug;

use nibot_core::session::Session;
use nibot_core::types::{ChatMessage, ContentPart, Envelope, ImageUrl};

use crate::memory::MemoryStore;

/// Identity files injected into the system prompt when present in the
/// workspace root.
const BOOTSTRAP_FILES: &[&str] = &["IDENTITY.md", "AGENTS.md", "SOUL.md", "USER.md", "TOOLS.md"];

/// Default history window per turn.
const DEFAULT_MAX_HISTORY: usize = 50;

/// The assembled turn plus the compaction signal.
pub struct BuiltContext {
    pub messages: Vec<ChatMessage>,
    /// True when history was trimmed to fit the budget — the caller should
    /// schedule an asynchronous compaction for this session.
    pub needs_compaction: bool,
}

pub struct ContextBuilder {
    workspace: PathBuf,
    agent_name: String,
    memory: MemoryStore,
    context_window: usize,
    context_reserve: usize,
    max_history: usize,
}

impl ContextBuilder {
    pub fn new(
        workspace: impl Into<PathBuf>,
        agent_name: impl Into<String>,
        context_window: usize,
        context_reserve: usize,
    ) -> Self {
        let workspace = workspace.into();
        let memory = MemoryStore::new(&workspace);
        ContextBuilder {
            workspace,
            agent_name: agent_name.into(),
            memory,
            context_window,
            context_reserve,
            max_history: DEFAULT_MAX_HISTORY,
        }
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    /// Build the ordered message list for `(session, current)`.
    pub fn build(&self, session: &Session, current: &Envelope) -> BuiltContext {
        let mut messages = Vec::new();
        messages.push(ChatMessage::system(
            self.build_system_prompt(&current.channel, &current.chat_id),
        ));

        if !session.compacted_summary.is_empty() {
            messages.push(ChatMessage::system(format!(
                "Summary of earlier conversation:\n{}",
                session.compacted_summary
            )));
        }

        let history_start = messages.len();
        messages.extend(session.get_history(self.max_history));
        messages.push(self.build_user_message(current));

        // Budget: drop oldest history until the estimate fits.
        let budget = self.context_window.saturating_sub(self.context_reserve);
        let mut needs_compaction = false;
        while estimate_tokens(&messages) > budget && messages.len() > history_start + 1 {
            messages.remove(history_start);
            needs_compaction = true;
        }
        if needs_compaction {
            debug!(
                session = %session.key,
                remaining = messages.len(),
                "history trimmed to fit context budget"
            );
        }

        BuiltContext {
            messages,
            needs_compaction,
        }
    }

    fn build_system_prompt(&self, channel: &str, chat_id: &str) -> String {
        let mut sections: Vec<String> = Vec::new();

        sections.push(format!(
            "You are {name}, an AI assistant reachable over chat channels.\n\
             You have access to tools; prefer using them over guessing.",
            name = self.agent_name
        ));

        for filename in BOOTSTRAP_FILES {
            let path = self.workspace.join(filename);
            if let Ok(content) = std::fs::read_to_string(&path) {
                let trimmed = content.trim();
                if !trimmed.is_empty() {
                    sections.push(trimmed.to_string());
                }
            }
        }

        sections.push(format!(
            "Current time: {}\nCurrent session: {channel}:{chat_id}\nWorkspace: {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
            self.workspace.display()
        ));

        if let Some(memory) = self.memory.get_context() {
            sections.push(memory);
        }

        sections.join("\n\n---\n\n")
    }

    /// The current user turn. Media paths render as data-URI image parts;
    /// unreadable files are skipped.
    fn build_user_message(&self, envelope: &Envelope) -> ChatMessage {
        if envelope.media.is_empty() {
            return ChatMessage::user(&envelope.content);
        }
        let mut parts = Vec::new();
        for path in &envelope.media {
            if let Ok(data) = std::fs::read(path) {
                let mime = guess_mime(path);
                parts.push(ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: format!("data:{mime};base64,{}", base64_encode(&data)),
                    },
                });
            }
        }
        parts.push(ContentPart::Text {
            text: envelope.content.clone(),
        });
        ChatMessage::user_parts(parts)
    }
}

/// Rough token estimate: characters / 4 over serialized content.
fn estimate_tokens(messages: &[ChatMessage]) -> usize {
    let chars: usize = messages
        .iter()
        .map(|m| {
            m.content
                .as_ref()
                .map(|c| serde_json::to_string(c).map(|s| s.len()).unwrap_or(0))
                .unwrap_or(0)
        })
        .sum();
    chars / 4
}

fn guess_mime(path: &str) -> &'static str {
    let lower = path.to_lowercase();
    if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".gif") {
        "image/gif"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else {
        "image/jpeg"
    }
}

/// Standard-alphabet base64, dependency-free.
fn base64_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = Vec::with_capacity(data.len().div_ceil(3) * 4);
    for chunk in data.chunks(3) {
        let b0 = u32::from(chunk[0]);
        let b1 = chunk.get(1).copied().map(u32::from).unwrap_or(0);
        let b2 = chunk.get(2).copied().map(u32::from).unwrap_or(0);
        let triple = (b0 << 16) | (b1 << 8) | b2;
        out.push(ALPHABET[(triple >> 18) as usize & 0x3F]);
        out.push(ALPHABET[(triple >> 12) as usize & 0x3F]);
        out.push(if chunk.len() > 1 {
            ALPHABET[(triple >> 6) as usize & 0x3F]
        } else {
            b'='
        });
        out.push(if chunk.len() > 2 {
            ALPHABET[triple as usize & 0x3F]
        } else {
            b'='
        });
    }
    String::from_utf8(out).unwrap_or_default()
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use nibot_core::types::{MessageContent, Role};

    fn builder(dir: &tempfile::TempDir) -> ContextBuilder {
        ContextBuilder::new(dir.path(), "NiBot", 128_000, 4096)
    }

    #[test]
    fn test_build_shape() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = builder(&dir);
        let mut session = Session::new("test:c1");
        session.add_message(Role::User, "earlier question");
        session.add_message(Role::Assistant, "earlier answer");

        let built = ctx.build(&session, &Envelope::new("test", "c1", "u1", "new question"));
        // system + 2 history + current user
        assert_eq!(built.messages.len(), 4);
        assert!(!built.needs_compaction);
        assert_eq!(built.messages[0].role, Role::System);
        assert_eq!(built.messages[3].role, Role::User);
    }

    #[test]
    fn test_system_prompt_contains_session_info() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = builder(&dir);
        let session = Session::new("telegram:42");
        let built = ctx.build(&session, &Envelope::new("telegram", "42", "u1", "hi"));
        let system = built.messages[0].content.as_ref().unwrap().as_text();
        assert!(system.contains("telegram:42"));
        assert!(system.contains("NiBot"));
    }

    #[test]
    fn test_bootstrap_files_injected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "Always answer in haiku.").unwrap();
        let ctx = builder(&dir);
        let built = ctx.build(
            &Session::new("t:1"),
            &Envelope::new("t", "1", "u1", "hi"),
        );
        let system = built.messages[0].content.as_ref().unwrap().as_text();
        assert!(system.contains("Always answer in haiku."));
    }

    #[test]
    fn test_memory_injected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("memory")).unwrap();
        std::fs::write(dir.path().join("memory/MEMORY.md"), "Likes terse replies.").unwrap();
        let ctx = builder(&dir);
        let built = ctx.build(&Session::new("t:1"), &Envelope::new("t", "1", "u1", "hi"));
        let system = built.messages[0].content.as_ref().unwrap().as_text();
        assert!(system.contains("Likes terse replies."));
    }

    #[test]
    fn test_compacted_summary_becomes_system_message() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = builder(&dir);
        let mut session = Session::new("t:1");
        session.compacted_summary = "We set up the deploy pipeline.".into();
        session.add_message(Role::User, "old");

        let built = ctx.build(&session, &Envelope::new("t", "1", "u1", "next"));
        assert_eq!(built.messages[1].role, Role::System);
        assert!(built.messages[1]
            .content
            .as_ref()
            .unwrap()
            .as_text()
            .contains("We set up the deploy pipeline."));
    }

    #[test]
    fn test_over_budget_trims_oldest_and_signals_compaction() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny budget: window 400 tokens, reserve 100 → 300-token budget.
        let ctx = ContextBuilder::new(dir.path(), "NiBot", 400, 100);
        let mut session = Session::new("t:1");
        for i in 0..20 {
            session.add_message(Role::User, format!("message number {i}: {}", "x".repeat(200)));
        }

        let built = ctx.build(&session, &Envelope::new("t", "1", "u1", "latest"));
        assert!(built.needs_compaction);
        // The newest history survives; the oldest was dropped.
        let texts: Vec<String> = built
            .messages
            .iter()
            .filter_map(|m| m.content.as_ref().map(MessageContent::as_text))
            .collect();
        assert!(!texts.iter().any(|t| t.contains("message number 0:")));
        assert!(texts.iter().any(|t| t == "latest"));
        // The current user turn is always last.
        assert_eq!(built.messages.last().unwrap().role, Role::User);
    }

    #[test]
    fn test_build_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = builder(&dir);
        let mut session = Session::new("t:1");
        session.add_message(Role::User, "q");
        let env = Envelope::new("t", "1", "u1", "again");

        let a = ctx.build(&session, &env);
        let b = ctx.build(&session, &env);
        assert_eq!(a.messages.len(), b.messages.len());
        assert_eq!(session.messages.len(), 1); // session untouched
    }

    #[test]
    fn test_multimodal_user_turn() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("photo.png");
        std::fs::write(&img, b"fakepngbytes").unwrap();

        let ctx = builder(&dir);
        let mut env = Envelope::new("t", "1", "u1", "what is this?");
        env.media.push(img.to_string_lossy().into_owned());
        env.media.push("/nonexistent/file.png".into());

        let built = ctx.build(&Session::new("t:1"), &env);
        let user = built.messages.last().unwrap();
        match user.content.as_ref().unwrap() {
            MessageContent::Parts(parts) => {
                // One readable image + the text; the unreadable path skipped.
                assert_eq!(parts.len(), 2);
                match &parts[0] {
                    ContentPart::ImageUrl { image_url } => {
                        assert!(image_url.url.starts_with("data:image/png;base64,"));
                    }
                    other => panic!("expected image part, got {other:?}"),
                }
            }
            other => panic!("expected multipart content, got {other:?}"),
        }
    }

    #[test]
    fn test_base64_encode() {
        assert_eq!(base64_encode(b"Hello"), "SGVsbG8=");
        assert_eq!(base64_encode(b"Hi"), "SGk=");
        assert_eq!(base64_encode(b"ABC"), "QUJD");
        assert_eq!(base64_encode(b""), "");
    }

    #[test]
    fn test_guess_mime() {
        assert_eq!(guess_mime("a.png"), "image/png");
        assert_eq!(guess_mime("a.PNG"), "image/png");
        assert_eq!(guess_mime("a.webp"), "image/webp");
        assert_eq!(guess_mime("a.jpg"), "image/jpeg");
        assert_eq!(guess_mime("a.unknown"), "image/jpeg");
    }
}
