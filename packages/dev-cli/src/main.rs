//! Operator CLI for the windlass engine.
//!
//! Every command maps 1:1 onto an engine operation over the same store the
//! server uses — identical validation, identical transactional boundaries.
//! The CLI cannot bypass the PENDING check any more than the HTTP plane can.

mod cmd;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use windlass::{EngineConfig, Store};

#[derive(Parser)]
#[command(name = "windlass", about = "Durable workflow engine operator CLI", version)]
struct Cli {
    /// Storage directory (defaults to WINDLASS_STORAGE_DIR or ./windlass-data)
    #[arg(long, global = true)]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect and resolve durable promises
    Awakeable {
        #[command(subcommand)]
        command: cmd::awakeable::AwakeableCommand,
    },
    /// Inspect and manage jobs
    Job {
        #[command(subcommand)]
        command: cmd::job::JobCommand,
    },
    /// Timer maintenance
    Timeout {
        #[command(subcommand)]
        command: cmd::timeout::TimeoutCommand,
    },
    /// Show lifecycle events
    Events(cmd::events::EventsArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = EngineConfig::from_env().context("failed to load configuration")?;
    if let Some(dir) = cli.storage_dir {
        config.storage_dir = dir;
    }
    let store = Store::open(&config.storage_dir)
        .await
        .with_context(|| format!("failed to open store at {}", config.storage_dir.display()))?;

    match cli.command {
        Command::Awakeable { command } => cmd::awakeable::run(command, &store).await,
        Command::Job { command } => cmd::job::run(command, &store).await,
        Command::Timeout { command } => cmd::timeout::run(command, &store).await,
        Command::Events(args) => cmd::events::run(args, &store).await,
    }
}
