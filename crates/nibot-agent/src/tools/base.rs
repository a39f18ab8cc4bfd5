//! Tool trait — the capability every agent tool implements.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use nibot_core::types::{ToolContext, ToolDefinition};

/// An agent capability. The loop discovers tools via `name()`, advertises
/// their schemas via `to_definition()`, and dispatches calls via
/// `execute()`.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name the LLM uses to call this tool (e.g. `"read_file"`).
    fn name(&self) -> &str;

    /// Description shown to the LLM.
    fn description(&self) -> &str;

    /// JSON Schema of the parameters:
    /// `{"type": "object", "properties": {...}, "required": [...]}`.
    fn parameters(&self) -> Value;

    /// Called with the request's context before each `execute`. Tools that
    /// route by conversation (messaging, delegation) override this.
    fn receive_context(&self, _ctx: &ToolContext) {}

    /// Run the tool. Return `Err` on failure — the registry converts it to
    /// an error-flagged `ToolResult` so the LLM sees it as tool content.
    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String>;

    /// LLM-facing definition. The default is right for almost every tool.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description(), self.parameters())
    }
}

// ─────────────────────────────────────────────
// Param helpers
// ─────────────────────────────────────────────

/// Extract a required string param with a readable error.
pub fn require_string(params: &HashMap<String, Value>, key: &str) -> anyhow::Result<String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("Missing required parameter: {key}"))
}

pub fn optional_string(params: &HashMap<String, Value>, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(str::to_string)
}

pub fn optional_i64(params: &HashMap<String, Value>, key: &str) -> Option<i64> {
    params.get(key).and_then(Value::as_i64)
}

pub fn optional_bool(params: &HashMap<String, Value>, key: &str) -> bool {
    params.get(key).and_then(Value::as_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_require_string() {
        let mut params = HashMap::new();
        params.insert("path".to_string(), json!("/tmp/foo.txt"));
        assert_eq!(require_string(&params, "path").unwrap(), "/tmp/foo.txt");
        assert!(require_string(&params, "missing").is_err());

        params.insert("count".to_string(), json!(42));
        assert!(require_string(&params, "count").is_err());
    }

    #[test]
    fn test_optional_helpers() {
        let mut params = HashMap::new();
        params.insert("mode".to_string(), json!("fast"));
        params.insert("count".to_string(), json!(5));
        params.insert("force".to_string(), json!(true));

        assert_eq!(optional_string(&params, "mode"), Some("fast".into()));
        assert_eq!(optional_string(&params, "nope"), None);
        assert_eq!(optional_i64(&params, "count"), Some(5));
        assert!(optional_bool(&params, "force"));
        assert!(!optional_bool(&params, "nope"));
    }

    #[test]
    fn test_default_to_definition() {
        struct Dummy;

        #[async_trait]
        impl Tool for Dummy {
            fn name(&self) -> &str {
                "dummy"
            }
            fn description(&self) -> &str {
                "A test tool"
            }
            fn parameters(&self) -> Value {
                json!({"type": "object", "properties": {}, "required": []})
            }
            async fn execute(&self, _params: HashMap<String, Value>) -> anyhow::Result<String> {
                Ok("ok".into())
            }
        }

        let def = Dummy.to_definition();
        assert_eq!(def.tool_type, "function");
        assert_eq!(def.function.name, "dummy");
        assert_eq!(def.function.description, "A test tool");
    }
}
