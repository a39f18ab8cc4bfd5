//! Configuration schema.
//!
//! JSON on disk uses **camelCase** keys; Rust uses snake_case.
//! `#[serde(rename_all = "camelCase", default)]` handles the conversion and
//! keeps every field optional in the file.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::rate_limiter::RateLimitConfig;

// ─────────────────────────────────────────────
// Root
// ─────────────────────────────────────────────

/// Root configuration — loaded from `~/.nibot/config.json`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NiBotConfig {
    pub agent: AgentConfig,
    pub providers: ProvidersConfig,
    pub rate_limit: RateLimitConfig,
    pub event_log: EventLogConfig,
    pub health: HealthConfig,
    pub log: LogConfig,
    /// Declared subagent types, keyed by type name.
    pub agents: HashMap<String, AgentTypeConfig>,
    /// Scheduled jobs. The config file is their durable home; the scheduler
    /// holds live copies.
    pub schedules: Vec<ScheduledJob>,
}

// ─────────────────────────────────────────────
// Agent
// ─────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    pub name: String,
    /// Default model identifier.
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    /// Maximum LLM ↔ tool iterations per message.
    pub max_iterations: usize,
    pub workspace: String,
    pub context_window: usize,
    /// Tokens reserved for the response when budgeting context.
    pub context_reserve: usize,
    pub llm_max_retries: u32,
    pub llm_retry_base_delay: f64,
    /// Bus queue capacity. 0 = unbounded.
    pub bus_queue_maxsize: usize,
    /// When non-empty, the tool allow-list advertised on end-user channels.
    pub gateway_tools: Vec<String>,
    /// Ordered provider names to try before giving up. Empty = default
    /// provider only.
    pub provider_fallback_chain: Vec<String>,
    /// Bound on the in-memory session cache.
    pub session_cache_size: usize,
    /// Bound on retained completed-subagent records.
    pub task_history_size: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            name: "NiBot".into(),
            model: "anthropic/claude-sonnet-4-5".into(),
            max_tokens: 4096,
            temperature: 0.7,
            max_iterations: 20,
            workspace: "~/.nibot/workspace".into(),
            context_window: 128_000,
            context_reserve: 4096,
            llm_max_retries: 3,
            llm_retry_base_delay: 1.0,
            bus_queue_maxsize: 0,
            gateway_tools: Vec::new(),
            provider_fallback_chain: Vec::new(),
            session_cache_size: crate::session::DEFAULT_MAX_CACHE_SIZE,
            task_history_size: 50,
        }
    }
}

// ─────────────────────────────────────────────
// Subagent types
// ─────────────────────────────────────────────

/// A declared subagent type: tool whitelist, model/provider overrides,
/// system prompt, workspace mode, and wall-clock timeout.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentTypeConfig {
    /// `Some(list)` is a strict whitelist (an explicit empty list means no
    /// tools at all); `None` falls back to the default deny list.
    pub tools: Option<Vec<String>>,
    pub model: String,
    pub max_iterations: usize,
    pub system_prompt: String,
    /// Named provider override; empty = default.
    pub provider: String,
    /// Fallback chain override; takes precedence over `provider`.
    pub fallback_chain: Vec<String>,
    /// `"worktree"` runs the task in an isolated git worktree.
    pub workspace_mode: String,
    /// Wall-clock deadline for the whole task.
    pub timeout_seconds: u64,
}

impl Default for AgentTypeConfig {
    fn default() -> Self {
        AgentTypeConfig {
            tools: None,
            model: String::new(),
            max_iterations: 15,
            system_prompt: String::new(),
            provider: String::new(),
            fallback_chain: Vec::new(),
            workspace_mode: String::new(),
            timeout_seconds: 1800,
        }
    }
}

/// Built-in subagent types, used when the config declares none.
pub fn default_agent_types() -> HashMap<String, AgentTypeConfig> {
    let mut types = HashMap::new();
    types.insert(
        "researcher".into(),
        AgentTypeConfig {
            tools: Some(vec![
                "web_search".into(),
                "web_fetch".into(),
                "read_file".into(),
                "write_file".into(),
            ]),
            max_iterations: 15,
            ..Default::default()
        },
    );
    types.insert(
        "coder".into(),
        AgentTypeConfig {
            tools: Some(vec![
                "read_file".into(),
                "write_file".into(),
                "edit_file".into(),
                "list_dir".into(),
                "exec".into(),
                "git".into(),
            ]),
            max_iterations: 25,
            workspace_mode: "worktree".into(),
            system_prompt: "You are a coding agent. Work in your isolated git worktree. \
                            Read existing code first, make minimal changes, test before declaring done."
                .into(),
            ..Default::default()
        },
    );
    types.insert(
        "system".into(),
        AgentTypeConfig {
            tools: Some(vec!["exec".into(), "read_file".into(), "list_dir".into()]),
            max_iterations: 10,
            ..Default::default()
        },
    );
    types
}

// ─────────────────────────────────────────────
// Scheduling
// ─────────────────────────────────────────────

/// A cron-triggered prompt. Fired envelopes carry
/// `metadata = {scheduled: true, job_id}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScheduledJob {
    pub id: String,
    /// Standard five-field cron expression.
    pub cron: String,
    pub prompt: String,
    pub channel: String,
    pub chat_id: String,
    pub enabled: bool,
}

impl Default for ScheduledJob {
    fn default() -> Self {
        ScheduledJob {
            id: String::new(),
            cron: String::new(),
            prompt: String::new(),
            channel: "scheduler".into(),
            chat_id: String::new(),
            enabled: true,
        }
    }
}

// ─────────────────────────────────────────────
// Providers
// ─────────────────────────────────────────────

/// Per-provider self-declared quota. 0 = unlimited.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuotaConfig {
    pub rpm: u32,
    pub tpm: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    pub api_key: String,
    /// Custom API base URL; also how local providers (Ollama, vLLM) are
    /// configured, with no key.
    pub api_base: String,
    /// Model override for this provider; empty = the agent default.
    pub model: String,
    pub quota: QuotaConfig,
}

impl ProviderConfig {
    /// Configured means usable: an API key, or a local base URL.
    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty() || !self.api_base.is_empty()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvidersConfig {
    pub anthropic: ProviderConfig,
    pub openai: ProviderConfig,
    pub openrouter: ProviderConfig,
    pub deepseek: ProviderConfig,
    /// Additional named providers beyond the built-in four.
    pub extras: HashMap<String, ProviderConfig>,
}

impl ProvidersConfig {
    /// Lookup by name: built-in fields first, then extras.
    pub fn get(&self, name: &str) -> Option<&ProviderConfig> {
        match name {
            "anthropic" => Some(&self.anthropic),
            "openai" => Some(&self.openai),
            "openrouter" => Some(&self.openrouter),
            "deepseek" => Some(&self.deepseek),
            other => self.extras.get(other),
        }
    }

    /// All named providers with their configs, built-ins first.
    pub fn iter_named(&self) -> Vec<(String, &ProviderConfig)> {
        let mut named: Vec<(String, &ProviderConfig)> = vec![
            ("anthropic".into(), &self.anthropic),
            ("openai".into(), &self.openai),
            ("openrouter".into(), &self.openrouter),
            ("deepseek".into(), &self.deepseek),
        ];
        for (name, pc) in &self.extras {
            named.push((name.clone(), pc));
        }
        named
    }

    pub fn any_configured(&self) -> bool {
        self.iter_named().iter().any(|(_, pc)| pc.is_configured())
    }
}

// ─────────────────────────────────────────────
// Ops
// ─────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventLogConfig {
    pub enabled: bool,
    /// Log file path; empty = `<workspace>/events.jsonl`.
    pub file: String,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        EventLogConfig {
            enabled: true,
            file: String::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            enabled: false,
            host: "127.0.0.1".into(),
            port: 9100,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    /// tracing env-filter directive (e.g. `"info"`, `"nibot=debug"`).
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".into(),
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
