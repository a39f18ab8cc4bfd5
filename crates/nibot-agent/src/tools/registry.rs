//! Tool registry — registration, LLM-facing definitions with allow/deny
//! filtering, and error-absorbing execution.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, warn};

use nibot_core::event_log::EventLog;
use nibot_core::types::{ToolContext, ToolDefinition, ToolResult};

use super::base::Tool;

/// Stores tools keyed by name and dispatches LLM tool-call requests.
///
/// The handler never observes a raw tool failure: every outcome is a
/// `ToolResult`, with errors flagged and stringified.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    event_log: Arc<EventLog>,
}

impl ToolRegistry {
    pub fn new(event_log: Arc<EventLog>) -> Self {
        ToolRegistry {
            tools: HashMap::new(),
            event_log,
        }
    }

    /// Register a tool. Overwrites any previous tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        debug!(tool = tool.name(), "registered tool");
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn unregister(&mut self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// All registered names, sorted for determinism.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Definitions for every registered tool.
    pub fn get_definitions(&self) -> Vec<ToolDefinition> {
        self.get_definitions_filtered(None, &[])
    }

    /// Definitions with visibility filtering. An `allow` list (whitelist)
    /// takes priority over `deny`; an explicit empty whitelist means no
    /// tools at all.
    pub fn get_definitions_filtered(&self, allow: Option<&[String]>, deny: &[String]) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = match allow {
            Some(allowed) => self
                .tools
                .values()
                .filter(|t| allowed.iter().any(|a| a == t.name()))
                .map(|t| t.to_definition())
                .collect(),
            None => self
                .tools
                .values()
                .filter(|t| !deny.iter().any(|d| d == t.name()))
                .map(|t| t.to_definition())
                .collect(),
        };
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    /// A new registry sharing this one's event log, containing the tools
    /// that pass the filter. Subagents build their restricted view here.
    pub fn fork_filtered(&self, allow: Option<&[String]>, deny: &[String]) -> ToolRegistry {
        let mut fork = ToolRegistry::new(self.event_log.clone());
        for tool in self.tools.values() {
            let keep = match allow {
                Some(allowed) => allowed.iter().any(|a| a == tool.name()),
                None => !deny.iter().any(|d| d == tool.name()),
            };
            if keep {
                fork.register(tool.clone());
            }
        }
        fork
    }

    /// Execute a tool call. Duration and success are logged as a
    /// `tool_call` event; any failure is folded into the result.
    pub async fn execute(
        &self,
        name: &str,
        arguments: &Value,
        call_id: &str,
        ctx: Option<&ToolContext>,
    ) -> ToolResult {
        let Some(tool) = self.tools.get(name) else {
            warn!(tool = name, "tool not found");
            return ToolResult::error(call_id, name, format!("Unknown tool: {name}"));
        };

        let params: HashMap<String, Value> = arguments
            .as_object()
            .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        if let Some(ctx) = ctx {
            tool.receive_context(ctx);
        }

        let t0 = Instant::now();
        match tool.execute(params).await {
            Ok(content) => {
                let duration_ms = t0.elapsed().as_secs_f64() * 1000.0;
                self.event_log.log_tool_call(name, duration_ms, true, "");
                ToolResult::ok(call_id, name, content)
            }
            Err(e) => {
                let duration_ms = t0.elapsed().as_secs_f64() * 1000.0;
                let message = e.to_string();
                warn!(tool = name, error = %message, "tool execution failed");
                let clipped: String = message.chars().take(200).collect();
                self.event_log.log_tool_call(name, duration_ms, false, &clipped);
                ToolResult::error(call_id, name, format!("Error: {message}"))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
