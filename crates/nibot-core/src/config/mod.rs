//! Configuration — typed schema, JSON loader, startup validation.

mod loader;
mod schema;

pub use loader::{default_config_path, load_config, startup_errors, ConfigError};
pub use schema::{
    default_agent_types, AgentConfig, AgentTypeConfig, EventLogConfig, HealthConfig, LogConfig,
    NiBotConfig, ProviderConfig, ProvidersConfig, QuotaConfig, ScheduledJob,
};
