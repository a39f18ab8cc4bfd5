//! `nibot` — run the gateway or inspect local state.

mod gateway;
mod health;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use nibot_core::config::{default_config_path, load_config};
use nibot_core::session::SessionStore;
use nibot_core::utils::expand_home;

#[derive(Parser)]
#[command(name = "nibot", version, about = "Multi-channel AI agent gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway: agent loop, bus dispatch, scheduler, health.
    Gateway {
        /// Config file path (default: ~/.nibot/config.json).
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Show configuration and recent sessions.
    Status {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Gateway { config } => {
            let config = load_config(config.as_deref())?;
            init_tracing(&config.log.level);
            let app = gateway::App::new(config)?;
            app.run().await
        }
        Commands::Status { config } => {
            init_tracing("warn");
            status(config)
        }
    }
}

/// The logger is the only process-wide state in the binary.
fn init_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn status(config_path: Option<PathBuf>) -> Result<()> {
    let path = config_path.clone().unwrap_or_else(default_config_path);
    let config = load_config(config_path.as_deref())?;

    println!("NiBot status");
    println!("  config:    {}", path.display());
    println!("  model:     {}", config.agent.model);
    println!("  workspace: {}", config.agent.workspace);

    let configured: Vec<String> = config
        .providers
        .iter_named()
        .into_iter()
        .filter(|(_, pc)| pc.is_configured())
        .map(|(name, _)| name)
        .collect();
    println!(
        "  providers: {}",
        if configured.is_empty() {
            "(none configured)".to_string()
        } else {
            configured.join(", ")
        }
    );
    println!("  schedules: {}", config.schedules.len());

    let sessions_dir = expand_home(&config.agent.workspace).join("sessions");
    if sessions_dir.exists() {
        let store = SessionStore::new(&sessions_dir)?;
        let recent = store.query_recent(10);
        println!("  sessions:  {} recent", recent.len());
        for summary in recent {
            println!(
                "    {:30} {:4} msgs  {}",
                summary.key,
                summary.message_count,
                summary.updated_at.format("%Y-%m-%d %H:%M")
            );
        }
    } else {
        println!("  sessions:  (none yet)");
    }
    Ok(())
}
