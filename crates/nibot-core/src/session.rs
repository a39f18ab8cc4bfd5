//! Session persistence — append-only JSONL transcripts with a bounded
//! in-memory cache, eviction write-back, and per-key locks.
//!
//! File format, one file per session key under the sessions directory:
//! - Line 1: `{"_type":"metadata","key":...,"created_at":...,"updated_at":...}`
//! - Line 2+: message records in order
//!
//! Key-to-path mapping sanitizes `:`, `/`, `\` to `_`. Archived sessions
//! move to an `archive/` subdirectory and are excluded from cache, search,
//! and iteration.

use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{ChatMessage, Role, ToolCall};
use crate::utils::{gen_hex_id, safe_filename, truncate};

/// Default bound on the in-memory session cache.
pub const DEFAULT_MAX_CACHE_SIZE: usize = 200;

// ─────────────────────────────────────────────
// Message records
// ─────────────────────────────────────────────

/// One persisted message. Ids, once assigned, never change; `parent_id`
/// points at an earlier message in the same session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub role: Role,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Fields for a message about to be appended. `parent_id = None` links to
/// the previous message automatically.
#[derive(Clone, Debug)]
pub struct MessageDraft {
    pub role: Role,
    pub content: String,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_call_id: Option<String>,
    pub name: Option<String>,
    pub parent_id: Option<String>,
}

impl MessageDraft {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        MessageDraft {
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            name: None,
            parent_id: None,
        }
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = Some(calls);
        self
    }

    pub fn with_tool_result(mut self, call_id: impl Into<String>, name: impl Into<String>) -> Self {
        self.tool_call_id = Some(call_id.into());
        self.name = Some(name.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

// ─────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────

/// One conversation, keyed `channel:chat_id`. Messages are append-only
/// within a turn and form a tree via `parent_id` links.
#[derive(Clone, Debug)]
pub struct Session {
    pub key: String,
    pub messages: Vec<MessageRecord>,
    /// LLM-produced summary of compacted-away history. Empty until
    /// automatic compaction fires.
    pub compacted_summary: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(key: impl Into<String>) -> Self {
        let now = Utc::now();
        Session {
            key: key.into(),
            messages: Vec::new(),
            compacted_summary: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a plain message; returns its new 12-hex id.
    pub fn add_message(&mut self, role: Role, content: impl Into<String>) -> String {
        self.push(MessageDraft::new(role, content))
    }

    /// Append a drafted message, assigning an id and linking `parent_id`
    /// to the previous message when not supplied. Messages predating ids
    /// get a `_legacy_`-prefixed id backfilled so ancestry stays traceable.
    pub fn push(&mut self, draft: MessageDraft) -> String {
        let parent_id = match draft.parent_id {
            Some(explicit) => explicit,
            None => match self.messages.last_mut() {
                Some(prev) => {
                    if prev.id.is_empty() {
                        prev.id = format!("_legacy_{}", gen_hex_id(12));
                    }
                    prev.id.clone()
                }
                None => String::new(),
            },
        };

        let id = gen_hex_id(12);
        self.messages.push(MessageRecord {
            role: draft.role,
            content: draft.content,
            timestamp: Utc::now(),
            id: id.clone(),
            parent_id,
            tool_calls: draft.tool_calls,
            tool_call_id: draft.tool_call_id,
            name: draft.name,
        });
        self.updated_at = Utc::now();
        id
    }

    /// The most recent `max_messages` in wire format (role + content only).
    pub fn get_history(&self, max_messages: usize) -> Vec<ChatMessage> {
        let start = self.messages.len().saturating_sub(max_messages);
        self.messages[start..]
            .iter()
            .map(|m| ChatMessage {
                role: m.role,
                content: Some(crate::types::MessageContent::Text(m.content.clone())),
                tool_calls: None,
                tool_call_id: None,
                name: None,
            })
            .collect()
    }

    /// The root-to-leaf path ending at `leaf_id`. Falls back to the full
    /// linear history when no such leaf is identifiable.
    pub fn get_branch(&self, leaf_id: &str) -> Vec<MessageRecord> {
        let by_id: HashMap<&str, &MessageRecord> = self
            .messages
            .iter()
            .filter(|m| !m.id.is_empty())
            .map(|m| (m.id.as_str(), m))
            .collect();

        let mut cursor = match by_id.get(leaf_id) {
            Some(leaf) => *leaf,
            None => return self.messages.clone(),
        };

        let mut path = vec![cursor.clone()];
        while !cursor.parent_id.is_empty() {
            match by_id.get(cursor.parent_id.as_str()) {
                Some(parent) => {
                    path.push((*parent).clone());
                    cursor = parent;
                }
                None => break,
            }
        }
        path.reverse();
        path
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.compacted_summary.clear();
        self.updated_at = Utc::now();
    }
}

// ─────────────────────────────────────────────
// On-disk metadata record
// ─────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct SessionMetadata {
    #[serde(rename = "_type")]
    record_type: String,
    key: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    compacted_summary: String,
}

/// Short session description for listings; built without populating the
/// cache.
#[derive(Clone, Debug)]
pub struct SessionSummary {
    pub key: String,
    pub message_count: usize,
    pub last_user_preview: String,
    pub updated_at: DateTime<Utc>,
}

/// One `search` match.
#[derive(Clone, Debug)]
pub struct SearchHit {
    pub session_key: String,
    pub role: Role,
    pub timestamp: DateTime<Utc>,
    pub content_preview: String,
}

// ─────────────────────────────────────────────
// SessionStore
// ─────────────────────────────────────────────

struct CacheInner {
    cache: HashMap<String, Arc<tokio::sync::Mutex<Session>>>,
    /// LRU order, least-recently-used at the front.
    order: VecDeque<String>,
}

/// Bounded write-back cache over per-session JSONL files.
///
/// At most one writer per key: callers acquire `lock_for(key)` for the
/// duration of a message's processing. Locks survive cache eviction.
pub struct SessionStore {
    sessions_dir: PathBuf,
    max_cache_size: usize,
    inner: StdMutex<CacheInner>,
    locks: StdMutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(sessions_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        Self::with_cache_size(sessions_dir, DEFAULT_MAX_CACHE_SIZE)
    }

    pub fn with_cache_size(sessions_dir: impl Into<PathBuf>, max_cache_size: usize) -> std::io::Result<Self> {
        let dir = sessions_dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(SessionStore {
            sessions_dir: dir,
            max_cache_size: max_cache_size.max(1),
            inner: StdMutex::new(CacheInner {
                cache: HashMap::new(),
                order: VecDeque::new(),
            }),
            locks: StdMutex::new(HashMap::new()),
        })
    }

    /// The persistent per-key mutex. Constructed on first use and never
    /// evicted, so serialization holds across cache churn.
    pub fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Fetch the cached session, load it from disk, or create it empty.
    /// The returned handle stays valid even if the cache entry is evicted.
    pub fn get_or_create(&self, key: &str) -> Arc<tokio::sync::Mutex<Session>> {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(session) = inner.cache.get(key).cloned() {
                Self::touch(&mut inner.order, key);
                return session;
            }
        }

        let session = self
            .load_from_disk(key)
            .unwrap_or_else(|| Session::new(key));
        let handle = Arc::new(tokio::sync::Mutex::new(session));

        let evicted = {
            let mut inner = self.inner.lock().unwrap();
            // Another task may have raced us here; keep the existing entry.
            if let Some(existing) = inner.cache.get(key).cloned() {
                Self::touch(&mut inner.order, key);
                return existing;
            }
            inner.cache.insert(key.to_string(), handle.clone());
            inner.order.push_back(key.to_string());

            let mut evicted = Vec::new();
            while inner.order.len() > self.max_cache_size {
                if let Some(lru_key) = inner.order.pop_front() {
                    if let Some(lru) = inner.cache.remove(&lru_key) {
                        evicted.push(lru);
                    }
                }
            }
            evicted
        };

        // Eviction write-back: unsaved in-memory mutations must reach disk.
        // A session whose mutex is currently held is being processed — its
        // holder saves it at the end of the turn.
        for lru in evicted {
            if let Ok(session) = lru.try_lock() {
                if let Err(e) = self.write_to_disk(&session) {
                    warn!(key = %session.key, error = %e, "eviction write-back failed");
                }
            }
        }

        handle
    }

    /// Persist a session. The caller holds the session's data (and usually
    /// its key lock).
    pub fn save(&self, session: &Session) -> anyhow::Result<()> {
        self.write_to_disk(session)?;
        Ok(())
    }

    /// Remove a session from cache and disk. Returns whether a file existed.
    pub fn delete(&self, key: &str) -> bool {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.cache.remove(key);
            inner.order.retain(|k| k != key);
        }
        let path = self.path_for(key);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(key = %key, error = %e, "failed to delete session file");
                return false;
            }
            true
        } else {
            false
        }
    }

    /// Move a session file into `archive/`. Archived sessions disappear
    /// from cache, search, and iteration.
    pub fn archive(&self, key: &str) -> anyhow::Result<bool> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.cache.remove(key);
            inner.order.retain(|k| k != key);
        }
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(false);
        }
        let archive_dir = self.sessions_dir.join("archive");
        std::fs::create_dir_all(&archive_dir)?;
        let target = archive_dir.join(path.file_name().unwrap_or_default());
        std::fs::rename(&path, &target)?;
        debug!(key = %key, "archived session");
        Ok(true)
    }

    /// Archive every session whose `updated_at` is older than `days`.
    /// Returns the number archived.
    pub fn archive_old(&self, days: i64) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let mut archived = 0;
        for summary in self.query_recent(usize::MAX) {
            if summary.updated_at < cutoff && matches!(self.archive(&summary.key), Ok(true)) {
                archived += 1;
            }
        }
        archived
    }

    /// Short summaries of the most recently updated sessions, newest first.
    /// Reads from disk without populating the cache.
    pub fn query_recent(&self, limit: usize) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .session_files()
            .into_iter()
            .filter_map(|path| self.read_file(&path))
            .map(|session| {
                let last_user_preview = session
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| truncate(&m.content, 80))
                    .unwrap_or_default();
                SessionSummary {
                    key: session.key,
                    message_count: session.messages.len(),
                    last_user_preview,
                    updated_at: session.updated_at,
                }
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries.truncate(limit);
        summaries
    }

    /// Full sessions, newest first, without cache pollution.
    pub fn iter_recent_from_disk(&self, limit: usize) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .session_files()
            .into_iter()
            .filter_map(|path| self.read_file(&path))
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions.truncate(limit);
        sessions
    }

    pub fn iter_all_from_disk(&self) -> Vec<Session> {
        self.iter_recent_from_disk(usize::MAX)
    }

    /// Case-insensitive substring scan across all session files.
    pub fn search(&self, query: &str, max_results: usize) -> Vec<SearchHit> {
        let needle = query.to_lowercase();
        let mut hits = Vec::new();
        if needle.is_empty() {
            return hits;
        }
        'files: for path in self.session_files() {
            let Some(session) = self.read_file(&path) else {
                continue;
            };
            for m in &session.messages {
                if m.content.to_lowercase().contains(&needle) {
                    hits.push(SearchHit {
                        session_key: session.key.clone(),
                        role: m.role,
                        timestamp: m.timestamp,
                        content_preview: truncate(&m.content, 120),
                    });
                    if hits.len() >= max_results {
                        break 'files;
                    }
                }
            }
        }
        hits
    }

    /// Number of cached sessions (health reporting).
    pub fn cached_len(&self) -> usize {
        self.inner.lock().unwrap().cache.len()
    }

    #[cfg(test)]
    pub(crate) fn is_cached(&self, key: &str) -> bool {
        self.inner.lock().unwrap().cache.contains_key(key)
    }

    // ────────────── disk I/O ──────────────

    fn path_for(&self, key: &str) -> PathBuf {
        self.sessions_dir.join(format!("{}.jsonl", safe_filename(key)))
    }

    fn session_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.sessions_dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "jsonl"))
            .collect()
    }

    fn load_from_disk(&self, key: &str) -> Option<Session> {
        let path = self.path_for(key);
        if !path.exists() {
            return None;
        }
        self.read_file(&path)
    }

    /// Parse a JSONL session file. A malformed line makes the whole file
    /// count as corrupt: warn and return `None` so the caller starts fresh.
    fn read_file(&self, path: &PathBuf) -> Option<Session> {
        let file = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to open session file");
                return None;
            }
        };

        let mut session: Option<Session> = None;
        let mut messages = Vec::new();
        for line in std::io::BufReader::new(file).lines() {
            let line = line.ok()?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(meta) = serde_json::from_str::<SessionMetadata>(&line) {
                if meta.record_type == "metadata" {
                    let mut s = Session::new(meta.key);
                    s.created_at = meta.created_at;
                    s.updated_at = meta.updated_at;
                    s.compacted_summary = meta.compacted_summary;
                    session = Some(s);
                    continue;
                }
            }
            match serde_json::from_str::<MessageRecord>(&line) {
                Ok(msg) => messages.push(msg),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt session file");
                    return None;
                }
            }
        }

        let mut session = session?;
        session.messages = messages;
        Some(session)
    }

    fn write_to_disk(&self, session: &Session) -> std::io::Result<()> {
        let path = self.path_for(&session.key);
        let mut file = std::fs::File::create(&path)?;

        let meta = SessionMetadata {
            record_type: "metadata".into(),
            key: session.key.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
            compacted_summary: session.compacted_summary.clone(),
        };
        writeln!(file, "{}", serde_json::to_string(&meta)?)?;
        for msg in &session.messages {
            writeln!(file, "{}", serde_json::to_string(msg)?)?;
        }
        debug!(key = %session.key, messages = session.messages.len(), "saved session");
        Ok(())
    }

    fn touch(order: &mut VecDeque<String>, key: &str) {
        if let Some(pos) = order.iter().position(|k| k == key) {
            order.remove(pos);
            order.push_back(key.to_string());
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
