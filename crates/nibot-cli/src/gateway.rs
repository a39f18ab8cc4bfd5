//! Composition root — wire every component leaves-first, run the loops,
//! shut down in order.
//!
//! Construction order: event log → sessions/registry/provider → pool →
//! context/compactor → agent loop → subagents → scheduler. No singletons;
//! shared pieces are handed out as `Arc`s.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{info, warn};

use nibot_agent::agent_loop::{AgentLoop, AgentLoopConfig};
use nibot_agent::compact::Compactor;
use nibot_agent::context::ContextBuilder;
use nibot_agent::subagent::SubagentManager;
use nibot_agent::tools::base::Tool;
use nibot_agent::tools::registry::ToolRegistry;
use nibot_agent::worktree::WorktreeManager;
use nibot_core::bus::MessageBus;
use nibot_core::channel::Channel;
use nibot_core::config::{default_agent_types, startup_errors, ConfigError, NiBotConfig};
use nibot_core::event_log::EventLog;
use nibot_core::rate_limiter::SlidingWindowRateLimiter;
use nibot_core::session::SessionStore;
use nibot_core::utils::expand_home;
use nibot_cron::SchedulerManager;
use nibot_providers::http_provider::HttpProvider;
use nibot_providers::pool::{default_api_base, ProviderPool};
use nibot_providers::traits::LlmProvider;

use crate::health::{start_health_server, SnapshotFn};

/// How long shutdown waits for in-flight agent handlers and subagents.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(30);

pub struct App {
    config: NiBotConfig,
    workspace: PathBuf,
    bus: Arc<MessageBus>,
    event_log: Arc<EventLog>,
    sessions: Arc<SessionStore>,
    registry: ToolRegistry,
    channels: Vec<Arc<dyn Channel>>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("workspace", &self.workspace)
            .field("channels", &self.channels.len())
            .finish()
    }
}

impl App {
    /// Validate the config (every problem reported in one error) and build
    /// the leaf components.
    pub fn new(config: NiBotConfig) -> Result<Self> {
        let mut errors = startup_errors(&config);
        errors.extend(nibot_cron::schedule_errors(&config.schedules));
        if !errors.is_empty() {
            return Err(ConfigError(errors).into());
        }

        let workspace = expand_home(&config.agent.workspace);
        std::fs::create_dir_all(&workspace)?;

        let event_log_path = if config.event_log.file.is_empty() {
            workspace.join("events.jsonl")
        } else {
            expand_home(&config.event_log.file)
        };
        let event_log = Arc::new(EventLog::new(event_log_path, config.event_log.enabled));

        let bus = Arc::new(MessageBus::new(config.agent.bus_queue_maxsize));
        let sessions = Arc::new(SessionStore::with_cache_size(
            workspace.join("sessions"),
            config.agent.session_cache_size,
        )?);
        let registry = ToolRegistry::new(event_log.clone());

        Ok(App {
            config,
            workspace,
            bus,
            event_log,
            sessions,
            registry,
            channels: Vec::new(),
        })
    }

    pub fn add_tool(&mut self, tool: Arc<dyn Tool>) -> &mut Self {
        self.registry.register(tool);
        self
    }

    /// Register a channel: its `send` becomes the outbound subscriber for
    /// its name, and it is started/stopped with the app.
    pub fn add_channel(&mut self, channel: Arc<dyn Channel>) -> &mut Self {
        let subscriber_channel = channel.clone();
        self.bus.subscribe_outbound(
            channel.name().to_string(),
            Arc::new(move |envelope| {
                let ch = subscriber_channel.clone();
                Box::pin(async move { ch.send(&envelope).await })
            }),
        );
        self.channels.push(channel);
        self
    }

    pub fn bus(&self) -> Arc<MessageBus> {
        self.bus.clone()
    }

    /// Run until SIGINT/SIGTERM.
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `shutdown` resolves, then perform the ordered shutdown:
    /// servers, loop stops, bounded waits for handlers and subagents,
    /// cancellation of the top-level tasks.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let App {
            config,
            workspace,
            bus,
            event_log,
            sessions,
            registry,
            channels,
        } = self;
        let agent_cfg = &config.agent;

        let provider: Arc<dyn LlmProvider> = Arc::new(build_default_provider(&config));
        let pool = Arc::new(ProviderPool::new(
            config.providers.clone(),
            provider.clone(),
            event_log.clone(),
        ));
        let registry = Arc::new(registry);
        let context = Arc::new(ContextBuilder::new(
            &workspace,
            &agent_cfg.name,
            agent_cfg.context_window,
            agent_cfg.context_reserve,
        ));
        let compactor = Compactor::new(provider.clone(), sessions.clone());
        let rate_limiter = Arc::new(SlidingWindowRateLimiter::new(config.rate_limit));

        let agent = AgentLoop::new(
            bus.clone(),
            provider.clone(),
            pool.clone(),
            registry.clone(),
            sessions.clone(),
            context,
            compactor,
            Some(rate_limiter),
            event_log.clone(),
            AgentLoopConfig::from(agent_cfg),
        );

        let agent_types = if config.agents.is_empty() {
            default_agent_types()
        } else {
            config.agents.clone()
        };
        let subagents = Arc::new(SubagentManager::new(
            provider.clone(),
            pool.clone(),
            registry.clone(),
            bus.clone(),
            Arc::new(WorktreeManager::new(&workspace)),
            agent_types,
            agent_cfg.task_history_size,
        ));
        let scheduler = Arc::new(SchedulerManager::new(bus.clone(), config.schedules.clone()));

        for channel in &channels {
            channel.start().await?;
        }

        let started = Instant::now();
        let health_handle = if config.health.enabled {
            let snapshot = build_snapshot_fn(
                agent.clone(),
                sessions.clone(),
                subagents.clone(),
                scheduler.clone(),
                pool.clone(),
                channels.iter().map(|c| c.name().to_string()).collect(),
                agent_cfg.model.clone(),
                started,
            );
            let (_, handle) =
                start_health_server(&config.health.host, config.health.port, snapshot).await?;
            Some(handle)
        } else {
            None
        };

        info!(
            model = %agent_cfg.model,
            workspace = %workspace.display(),
            channels = channels.len(),
            "NiBot starting"
        );

        let agent_task = tokio::spawn(agent.clone().run());
        let dispatch_task = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.dispatch_outbound().await })
        };
        let scheduler_task = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run().await })
        };

        shutdown.await;
        info!("shutdown signal received, stopping gracefully");

        // 1. Servers first, so no new work arrives over HTTP.
        if let Some(handle) = health_handle {
            handle.abort();
        }

        // 2. Stop every loop and channel.
        agent.stop();
        bus.stop();
        scheduler.stop();
        for channel in &channels {
            if let Err(e) = channel.stop().await {
                warn!(channel = channel.name(), error = %e, "channel stop error");
            }
        }

        // 3–4. Bounded waits: in-flight handlers, then subagents.
        agent.shutdown(SHUTDOWN_WAIT).await;
        subagents.shutdown(SHUTDOWN_WAIT).await;

        // 5. Cancel the top-level tasks and gather.
        for mut task in [agent_task, dispatch_task, scheduler_task] {
            if tokio::time::timeout(Duration::from_secs(2), &mut task).await.is_err() {
                task.abort();
            }
        }

        info!("NiBot shutdown complete");
        Ok(())
    }
}

/// Resolve the default provider from the model name's vendor prefix,
/// falling back to the first configured provider.
fn build_default_provider(config: &NiBotConfig) -> HttpProvider {
    let model = &config.agent.model;
    let preferred = provider_name_for_model(model);

    let (name, pc) = match config.providers.get(preferred).filter(|pc| pc.is_configured()) {
        Some(pc) => (preferred.to_string(), pc.clone()),
        None => config
            .providers
            .iter_named()
            .into_iter()
            .find(|(_, pc)| pc.is_configured())
            .map(|(n, pc)| (n, pc.clone()))
            .unwrap_or_else(|| (preferred.to_string(), Default::default())),
    };

    let api_base = if pc.api_base.is_empty() {
        default_api_base(&name).to_string()
    } else {
        pc.api_base.clone()
    };

    HttpProvider::new(name, api_base, pc.api_key, model)
        .with_retry(config.agent.llm_max_retries, config.agent.llm_retry_base_delay)
        .with_defaults(config.agent.max_tokens, config.agent.temperature)
}

fn provider_name_for_model(model: &str) -> &'static str {
    let lower = model.to_lowercase();
    if lower.contains("claude") || lower.contains("anthropic") {
        "anthropic"
    } else if lower.contains("deepseek") {
        "deepseek"
    } else if lower.starts_with("openrouter/") {
        "openrouter"
    } else {
        "openai"
    }
}

#[allow(clippy::too_many_arguments)]
fn build_snapshot_fn(
    agent: Arc<AgentLoop>,
    sessions: Arc<SessionStore>,
    subagents: Arc<SubagentManager>,
    scheduler: Arc<SchedulerManager>,
    pool: Arc<ProviderPool>,
    channel_names: Vec<String>,
    model: String,
    started: Instant,
) -> SnapshotFn {
    Arc::new(move || {
        let status = if agent.is_running() { "ok" } else { "degraded" };
        let mut providers = serde_json::Map::new();
        for (name, available, rpm_limit) in pool.availability() {
            providers.insert(
                name,
                serde_json::json!({"available": available, "rpm_limit": rpm_limit}),
            );
        }
        serde_json::json!({
            "status": status,
            "uptime_seconds": (started.elapsed().as_secs_f64() * 10.0).round() / 10.0,
            "model": model,
            "channels": channel_names,
            "active_sessions": sessions.cached_len(),
            "active_tasks": subagents.active_count(),
            "scheduler_jobs": scheduler.job_count(),
            "providers": serde_json::Value::Object(providers),
        })
    })
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use nibot_core::config::{ProviderConfig, ScheduledJob};

    fn test_config(dir: &tempfile::TempDir) -> NiBotConfig {
        let mut config = NiBotConfig::default();
        config.agent.workspace = dir.path().join("ws").to_string_lossy().into_owned();
        // A local base URL counts as configured — no key needed.
        config.providers.extras.insert(
            "local".into(),
            ProviderConfig {
                api_base: "http://127.0.0.1:9/v1".into(),
                ..Default::default()
            },
        );
        config.event_log.enabled = false;
        config
    }

    #[test]
    fn test_new_rejects_bad_config_with_all_errors() {
        let mut config = NiBotConfig::default();
        config.schedules.push(ScheduledJob {
            id: "bad".into(),
            cron: "not a cron".into(),
            prompt: "p".into(),
            ..Default::default()
        });

        let err = App::new(config).unwrap_err().to_string();
        // Both the missing provider and the bad cron are reported at once.
        assert!(err.contains("no provider configured"));
        assert!(err.contains("bad"));
    }

    #[test]
    fn test_new_creates_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let app = App::new(config).unwrap();
        assert!(dir.path().join("ws").exists());
        assert!(dir.path().join("ws/sessions").exists());
        drop(app);
    }

    #[test]
    fn test_provider_name_for_model() {
        assert_eq!(provider_name_for_model("claude-sonnet-4-5"), "anthropic");
        assert_eq!(provider_name_for_model("anthropic/claude-opus"), "anthropic");
        assert_eq!(provider_name_for_model("deepseek-chat"), "deepseek");
        assert_eq!(provider_name_for_model("openrouter/meta/llama-3"), "openrouter");
        assert_eq!(provider_name_for_model("gpt-4o"), "openai");
    }

    #[tokio::test]
    async fn test_run_until_boots_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let app = App::new(config).unwrap();

        // A short-lived "signal": the app must come up and tear down clean.
        app.run_until(async {
            tokio::time::sleep(Duration::from_millis(200)).await;
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_health_endpoint_reports_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.health.enabled = true;
        config.health.port = 0; // ephemeral — snapshot only checked via fn
        config.schedules.push(ScheduledJob {
            id: "daily".into(),
            cron: "0 9 * * *".into(),
            prompt: "report".into(),
            ..Default::default()
        });

        let app = App::new(config).unwrap();
        app.run_until(async {
            tokio::time::sleep(Duration::from_millis(300)).await;
        })
        .await
        .unwrap();
    }
}
