//! Subagent manager — typed, tool-restricted background task execution.
//!
//! A subagent cannot see the top-level conversation: its message list is
//! just its type's system prompt plus the task. Results return as outbound
//! envelopes addressed to the originating channel and chat. Every task
//! runs under its own wall-clock deadline.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use nibot_core::bus::MessageBus;
use nibot_core::config::AgentTypeConfig;
use nibot_core::types::{ChatMessage, Envelope, ToolContext};
use nibot_core::utils::{gen_hex_id, truncate};
use nibot_providers::pool::ProviderPool;
use nibot_providers::traits::{ChatOptions, LlmProvider};

use crate::tools::base::Tool;
use crate::tools::registry::ToolRegistry;
use crate::worktree::WorktreeManager;

/// Tools a subagent never gets by default: the top-level orchestration
/// surface.
const SUBAGENT_TOOL_DENY: &[&str] = &["message", "delegate"];

/// Builds worktree-scoped replacements for file-family tools. Installed by
/// the composition root; absent, worktree mode still isolates via the
/// dedicated checkout and branch recorded on the task.
pub type ToolOverlayFn = Arc<dyn Fn(&Path, &str) -> Vec<Arc<dyn Tool>> + Send + Sync>;

/// Invoked once when a task reaches a terminal state.
pub type CompletionCallback = Arc<dyn Fn(&TaskInfo) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Completed,
    Error,
}

#[derive(Clone, Debug)]
pub struct TaskInfo {
    pub id: String,
    pub label: String,
    pub agent_type: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Short preview of the final result (or the error text).
    pub result: String,
    pub worktree_branch: Option<String>,
}

/// Inputs to `spawn`.
pub struct SpawnRequest {
    pub task: String,
    pub label: String,
    pub origin_channel: String,
    pub origin_chat_id: String,
    pub agent_type: String,
    /// Overrides the declared type config when set.
    pub agent_config: Option<AgentTypeConfig>,
    pub callback: Option<CompletionCallback>,
}

impl SpawnRequest {
    pub fn new(
        task: impl Into<String>,
        label: impl Into<String>,
        origin_channel: impl Into<String>,
        origin_chat_id: impl Into<String>,
        agent_type: impl Into<String>,
    ) -> Self {
        SpawnRequest {
            task: task.into(),
            label: label.into(),
            origin_channel: origin_channel.into(),
            origin_chat_id: origin_chat_id.into(),
            agent_type: agent_type.into(),
            agent_config: None,
            callback: None,
        }
    }

    pub fn with_config(mut self, config: AgentTypeConfig) -> Self {
        self.agent_config = Some(config);
        self
    }

    pub fn with_callback(mut self, callback: CompletionCallback) -> Self {
        self.callback = Some(callback);
        self
    }
}

// ─────────────────────────────────────────────
// SubagentManager
// ─────────────────────────────────────────────

pub struct SubagentManager {
    default_provider: Arc<dyn LlmProvider>,
    pool: Arc<ProviderPool>,
    registry: Arc<ToolRegistry>,
    bus: Arc<MessageBus>,
    worktrees: Arc<WorktreeManager>,
    agent_types: HashMap<String, AgentTypeConfig>,
    /// Bound on retained completed-task records.
    max_history: usize,
    tool_overlay: Option<ToolOverlayFn>,
    tasks: StdMutex<HashMap<String, JoinHandle<()>>>,
    task_info: StdMutex<HashMap<String, TaskInfo>>,
}

impl SubagentManager {
    pub fn new(
        default_provider: Arc<dyn LlmProvider>,
        pool: Arc<ProviderPool>,
        registry: Arc<ToolRegistry>,
        bus: Arc<MessageBus>,
        worktrees: Arc<WorktreeManager>,
        agent_types: HashMap<String, AgentTypeConfig>,
        max_history: usize,
    ) -> Self {
        SubagentManager {
            default_provider,
            pool,
            registry,
            bus,
            worktrees,
            agent_types,
            max_history: max_history.max(1),
            tool_overlay: None,
            tasks: StdMutex::new(HashMap::new()),
            task_info: StdMutex::new(HashMap::new()),
        }
    }

    /// Install the worktree file-tool overlay (composition root).
    pub fn with_tool_overlay(mut self, overlay: ToolOverlayFn) -> Self {
        self.tool_overlay = Some(overlay);
        self
    }

    /// Launch a background task; returns its 8-hex id immediately.
    pub async fn spawn(self: &Arc<Self>, request: SpawnRequest) -> String {
        let task_id = gen_hex_id(8);
        let config = request
            .agent_config
            .clone()
            .or_else(|| self.agent_types.get(&request.agent_type).cloned())
            .unwrap_or_default();

        let info = TaskInfo {
            id: task_id.clone(),
            label: request.label.clone(),
            agent_type: request.agent_type.clone(),
            status: TaskStatus::Running,
            created_at: Utc::now(),
            finished_at: None,
            result: String::new(),
            worktree_branch: None,
        };
        self.task_info.lock().unwrap().insert(task_id.clone(), info);

        let this = Arc::clone(self);
        let id = task_id.clone();
        let handle = tokio::spawn(async move {
            this.drive(&id, request, config).await;
            // Done-callback: detach the handle entry so shutdown only waits
            // on live work.
            this.tasks.lock().unwrap().remove(&id);
        });
        self.tasks.lock().unwrap().insert(task_id.clone(), handle);

        info!(task_id = %task_id, "subagent spawned");
        task_id
    }

    /// Run the task under its deadline, record the outcome, announce it.
    async fn drive(self: &Arc<Self>, task_id: &str, request: SpawnRequest, config: AgentTypeConfig) {
        let timeout = Duration::from_secs(config.timeout_seconds.max(1));
        let outcome = tokio::time::timeout(timeout, self.run_subagent(task_id, &request, &config)).await;

        let (status, result) = match outcome {
            Ok(Ok(text)) => (TaskStatus::Completed, text),
            Ok(Err(e)) => {
                error!(task_id, error = %e, "subagent task failed");
                (TaskStatus::Error, format!("Subagent error: {e}"))
            }
            Err(_) => {
                warn!(task_id, timeout_secs = config.timeout_seconds, "subagent timed out");
                (
                    TaskStatus::Error,
                    format!("Task timed out after {}s", config.timeout_seconds),
                )
            }
        };

        let info = {
            let mut infos = self.task_info.lock().unwrap();
            if let Some(info) = infos.get_mut(task_id) {
                info.status = status;
                info.finished_at = Some(Utc::now());
                info.result = truncate(&result, 500);
                info.clone()
            } else {
                return;
            }
        };

        let verdict = match status {
            TaskStatus::Completed => "completed",
            _ => "failed",
        };
        let content = format!("[Subagent '{}' {verdict}]\nResult: {result}", request.label);
        let envelope = Envelope::new(&request.origin_channel, &request.origin_chat_id, "subagent", content);
        if let Err(e) = self.bus.publish_outbound(envelope).await {
            error!(task_id, error = %e, "failed to announce subagent result");
        }

        if let Some(callback) = &request.callback {
            callback(&info);
        }
        self.prune_completed();
    }

    /// The subagent's own LLM + tool iteration, isolated from the
    /// top-level conversation.
    async fn run_subagent(
        &self,
        task_id: &str,
        request: &SpawnRequest,
        config: &AgentTypeConfig,
    ) -> anyhow::Result<String> {
        // Restricted tool view: an explicit whitelist wins (empty list
        // means no tools); otherwise the default deny list applies.
        let deny: Vec<String> = SUBAGENT_TOOL_DENY.iter().map(|s| (*s).to_string()).collect();
        let mut registry = match &config.tools {
            Some(allow) => self.registry.fork_filtered(Some(allow), &[]),
            None => self.registry.fork_filtered(None, &deny),
        };

        // Worktree mode: provision an isolated checkout, record the branch,
        // and let the installed overlay scope file tools to it.
        let mut workspace_note = String::new();
        if config.workspace_mode == "worktree" {
            match self.worktrees.create(task_id).await {
                Ok(wt) => {
                    if let Some(overlay) = &self.tool_overlay {
                        for tool in overlay(&wt.path, task_id) {
                            registry.register(tool);
                        }
                    }
                    workspace_note = format!(
                        "\nYour isolated workspace is at: {} (branch {})",
                        wt.path.display(),
                        wt.branch
                    );
                    if let Some(info) = self.task_info.lock().unwrap().get_mut(task_id) {
                        info.worktree_branch = Some(wt.branch);
                    }
                }
                Err(e) => {
                    warn!(task_id, error = %e, "worktree creation failed, running in place");
                }
            }
        }

        let system_prompt = if config.system_prompt.is_empty() {
            format!(
                "You are a subagent. Task ID: {task_id}.\n\
                 Stay focused on the assigned task; your final response is \
                 reported back to the requesting conversation.{workspace_note}"
            )
        } else {
            format!("{}{workspace_note}", config.system_prompt)
        };

        let mut messages = vec![ChatMessage::system(system_prompt), ChatMessage::user(&request.task)];
        let tool_defs = registry.get_definitions();
        let tool_defs_opt = (!tool_defs.is_empty()).then_some(tool_defs.as_slice());

        let opts = ChatOptions {
            model: (!config.model.is_empty()).then(|| config.model.clone()),
            ..Default::default()
        };
        let ctx = ToolContext {
            channel: request.origin_channel.clone(),
            chat_id: request.origin_chat_id.clone(),
            session_key: format!("{}:{}", request.origin_channel, request.origin_chat_id),
            sender_id: "subagent".into(),
        };

        let mut final_content: Option<String> = None;
        for iteration in 0..config.max_iterations.max(1) {
            debug!(task_id, iteration, "subagent LLM call");

            let response = if !config.fallback_chain.is_empty() {
                self.pool
                    .chat_with_fallback(&messages, tool_defs_opt, &config.fallback_chain, &opts)
                    .await
            } else if !config.provider.is_empty() {
                self.pool.get(&config.provider).chat(&messages, tool_defs_opt, &opts).await
            } else {
                self.default_provider.chat(&messages, tool_defs_opt, &opts).await
            };

            if !response.has_tool_calls() {
                final_content = response.content;
                break;
            }

            let calls = response.tool_calls.clone();
            messages.push(ChatMessage::assistant_tool_calls(response.content, &calls));
            for call in &calls {
                debug!(task_id, tool = %call.name, "subagent executing tool");
                let result = registry.execute(&call.name, &call.arguments, &call.id, Some(&ctx)).await;
                messages.push(ChatMessage::tool_result(&call.id, &call.name, result.content));
            }
        }

        Ok(final_content.unwrap_or_else(|| "Subagent completed processing but produced no output.".into()))
    }

    /// Keep at most `max_history` completed records; evict by oldest
    /// `finished_at`. Running tasks are never evicted.
    fn prune_completed(&self) {
        let mut infos = self.task_info.lock().unwrap();
        let mut completed: Vec<(String, DateTime<Utc>)> = infos
            .values()
            .filter(|i| i.status != TaskStatus::Running)
            .map(|i| (i.id.clone(), i.finished_at.unwrap_or(i.created_at)))
            .collect();
        if completed.len() <= self.max_history {
            return;
        }
        completed.sort_by_key(|(_, finished)| *finished);
        let excess = completed.len() - self.max_history;
        for (id, _) in completed.into_iter().take(excess) {
            infos.remove(&id);
        }
    }

    pub fn get_task_info(&self, task_id: &str) -> Option<TaskInfo> {
        self.task_info.lock().unwrap().get(task_id).cloned()
    }

    /// Ids of currently running tasks.
    pub fn list_active(&self) -> Vec<String> {
        self.task_info
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.status == TaskStatus::Running)
            .map(|i| i.id.clone())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.list_active().len()
    }

    /// Await outstanding tasks up to `timeout`, then cancel the rest.
    pub async fn shutdown(&self, timeout: Duration) {
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.drain().map(|(_, h)| h).collect()
        };
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), "waiting for subagent tasks");
        let deadline = tokio::time::Instant::now() + timeout;
        for mut handle in handles {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                warn!("timeout waiting for subagent task, cancelling");
                handle.abort();
            }
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
