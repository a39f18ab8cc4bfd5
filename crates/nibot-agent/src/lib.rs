//! The agent core: tool registry, context building with compaction, the
//! LLM + tool iteration loop, and the subagent manager.

pub mod agent_loop;
pub mod compact;
pub mod context;
pub mod memory;
pub mod subagent;
pub mod tools;
pub mod worktree;

pub use agent_loop::{AgentLoop, AgentLoopConfig};
pub use compact::Compactor;
pub use context::ContextBuilder;
pub use subagent::{SpawnRequest, SubagentManager, TaskInfo, TaskStatus};
pub use tools::base::Tool;
pub use tools::registry::ToolRegistry;
