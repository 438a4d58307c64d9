//! Tempo daemon — wires the scheduler engine to its collaborators and
//! runs until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tempo_core::config::TempoConfig;
use tempo_core::traits::Agent;
use tempo_scheduler::{CronClock, SchedulerEngine, SqliteStore};

#[derive(Parser)]
#[command(name = "tempo", version, about = "Autonomous task scheduling daemon for AI agents")]
struct Cli {
    /// Config file path (default: ~/.tempo/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the scheduler database path
    #[arg(long)]
    db: Option<PathBuf>,

    /// Override the sweep cadence in milliseconds
    #[arg(long)]
    check_interval_ms: Option<u64>,
}

/// Stand-in agent that logs whatever it is asked to do. Real
/// deployments inject their own implementation via `set_agent`.
struct ConsoleAgent;

#[async_trait::async_trait]
impl Agent for ConsoleAgent {
    async fn process_user_message(&self, message: &str, images: &[String]) -> tempo_core::Result<()> {
        info!("🤖 Agent message: {message} ({} images)", images.len());
        Ok(())
    }

    async fn execute_tool(&self, name: &str, args: &serde_json::Value) -> tempo_core::Result<String> {
        info!("🔧 Agent tool call: {name} {args}");
        Ok(format!("{name}: ok"))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => TempoConfig::load_from(path)?,
        None => TempoConfig::load()?,
    };
    if let Some(ms) = cli.check_interval_ms {
        config.scheduler.check_interval_ms = ms;
    }
    let db_path = cli.db.unwrap_or_else(|| config.db_path());

    let store = Arc::new(SqliteStore::open(&db_path)?);
    let engine = SchedulerEngine::new(
        store,
        Arc::new(CronClock::new()),
        config.scheduler.clone(),
    );
    engine.set_agent(Arc::new(ConsoleAgent));
    engine.start().await?;
    info!("Tempo running, db at {} — press ctrl-c to stop", db_path.display());

    tokio::signal::ctrl_c().await?;
    engine.cleanup();
    Ok(())
}
