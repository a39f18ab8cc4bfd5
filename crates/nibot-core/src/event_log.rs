//! Structured event log — append-only JSONL operational trace.
//!
//! Four event types:
//!   `llm_call`        — per-provider API call (tokens, latency, success)
//!   `tool_call`       — tool execution (duration, success)
//!   `provider_switch` — provider selection decision (chain, skipped)
//!   `request`         — end-to-end request processing
//!
//! Writes are best-effort: the hot path never aborts because of a disk
//! error. Each record goes out as one `O_APPEND` write, which keeps
//! concurrent appenders line-atomic without a blocking lock.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use tracing::debug;

pub struct EventLog {
    path: PathBuf,
    enabled: bool,
    // First-failure marker so a broken disk surfaces once in debug logs
    // instead of as a warning burst.
    write_failed: AtomicBool,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, enabled: bool) -> Self {
        EventLog {
            path: path.into(),
            enabled,
            write_failed: AtomicBool::new(false),
        }
    }

    /// A disabled log that discards everything (tests, minimal deployments).
    pub fn disabled() -> Self {
        EventLog::new(PathBuf::from("/dev/null"), false)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_llm_call(
        &self,
        provider: &str,
        model: &str,
        input_tokens: u32,
        output_tokens: u32,
        latency_ms: f64,
        success: bool,
        error: &str,
    ) {
        let mut data = json!({
            "provider": provider,
            "model": model,
            "input_tokens": input_tokens,
            "output_tokens": output_tokens,
            "latency_ms": round1(latency_ms),
            "success": success,
        });
        if !error.is_empty() {
            data["error"] = json!(error);
        }
        self.append("llm_call", data);
    }

    pub fn log_tool_call(&self, tool: &str, duration_ms: f64, success: bool, error: &str) {
        let mut data = json!({
            "tool": tool,
            "duration_ms": round1(duration_ms),
            "success": success,
        });
        if !error.is_empty() {
            data["error"] = json!(error);
        }
        self.append("tool_call", data);
    }

    pub fn log_provider_switch(&self, chain: &[String], selected: &str, skipped: &[String], reason: &str) {
        self.append(
            "provider_switch",
            json!({
                "chain": chain,
                "selected": selected,
                "skipped": skipped,
                "reason": reason,
            }),
        );
    }

    pub fn log_request(
        &self,
        channel: &str,
        session_key: &str,
        latency_ms: f64,
        tool_count: usize,
        total_tokens: u32,
        provider: &str,
    ) {
        self.append(
            "request",
            json!({
                "channel": channel,
                "session_key": session_key,
                "latency_ms": round1(latency_ms),
                "tool_count": tool_count,
                "total_tokens": total_tokens,
                "provider": provider,
            }),
        );
    }

    fn append(&self, event_type: &str, data: Value) {
        if !self.enabled {
            return;
        }
        let mut record = json!({
            "ts": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            "type": event_type,
        });
        if let (Some(obj), Some(extra)) = (record.as_object_mut(), data.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }

        if let Err(e) = self.try_write(&record) {
            if !self.write_failed.swap(true, Ordering::Relaxed) {
                debug!(path = %self.path.display(), error = %e, "event log write failed");
            }
        }
    }

    fn try_write(&self, record: &Value) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        file.write_all(line.as_bytes())
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
