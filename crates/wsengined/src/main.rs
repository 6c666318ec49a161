//! wsengined — the workspace engine daemon.
//!
//! Loads one workspace from its redb database, then applies event batches:
//! - `run`: batches from stdin, plus a periodic `workspace.tick`
//! - `replay`: every batch of a file, then a JSON summary on stdout
//! - `plan`: the conflict groups of every batch of a file, nothing executed
//!
//! # Usage
//!
//! ```text
//! wsengined --config /etc/wsengine.toml run < events.ndjson
//! wsengined --in-memory replay seed.ndjson
//! wsengined plan seed.ndjson
//! ```

mod batch;
mod daemon;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use wsengine_core::EngineConfig;
use wsengine_core::config::LoggingSection;
use wsengine_events::{Workspace, WorkspaceOptions};
use wsengine_persist::RedbSink;
use wsengine_store::PersistenceSink;

#[derive(Parser)]
#[command(name = "wsengined", about = "Workspace engine daemon", version)]
struct Cli {
    /// Path to a wsengine.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    workspace_id: Option<String>,

    /// Directory holding the redb database.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Keep state in memory only.
    #[arg(long, global = true)]
    in_memory: bool,

    /// Handlers running concurrently within one group.
    #[arg(long, global = true)]
    parallelism: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply batches read from stdin until EOF or Ctrl-C.
    Run {
        /// Seconds between `workspace.tick` events.
        #[arg(long)]
        tick_interval: Option<u64>,
    },
    /// Apply every batch of a file and print a summary.
    Replay { file: PathBuf },
    /// Print the execution groups of every batch of a file.
    Plan { file: PathBuf },
}

impl Cli {
    fn config(&self) -> anyhow::Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_file(path)?,
            None => EngineConfig::default(),
        };
        if let Some(id) = &self.workspace_id {
            config.engine.workspace_id = id.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.storage.data_dir = dir.clone();
        }
        if self.in_memory {
            config.storage.in_memory = true;
        }
        if let Some(parallelism) = self.parallelism {
            config.engine.parallelism = parallelism;
        }
        if let Command::Run {
            tick_interval: Some(secs),
        } = &self.command
        {
            config.engine.tick_interval_secs = *secs;
        }
        Ok(config)
    }
}

fn init_tracing(logging: &LoggingSection) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.config()?;
    init_tracing(&config.logging);

    match cli.command {
        Command::Run { .. } => {
            let workspace = open_workspace(&config).await?;
            daemon::run(Arc::new(workspace), &config).await
        }
        Command::Replay { file } => replay(&config, &file).await,
        Command::Plan { file } => plan(&config, &file),
    }
}

async fn open_workspace(config: &EngineConfig) -> anyhow::Result<Workspace> {
    let sink = if config.storage.in_memory {
        info!("using in-memory storage");
        RedbSink::open_in_memory()?
    } else {
        std::fs::create_dir_all(&config.storage.data_dir)?;
        let path = config.storage.db_path();
        let sink = RedbSink::open(&path)?;
        info!(path = ?path, "database opened");
        sink
    };
    let sink: Arc<dyn PersistenceSink> = Arc::new(sink);
    let options = WorkspaceOptions {
        parallelism: config.engine.parallelism,
        ..WorkspaceOptions::default()
    };
    Ok(Workspace::load(sink, config.engine.workspace_id.clone(), options).await?)
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReplaySummary {
    batches: usize,
    groups: usize,
    events: usize,
    release_targets: usize,
    releases: usize,
    jobs: usize,
}

async fn replay(config: &EngineConfig, file: &std::path::Path) -> anyhow::Result<()> {
    let batches = batch::read_file(file, &config.engine.workspace_id)?;
    let workspace = open_workspace(config).await?;

    let mut summary = ReplaySummary::default();
    for (line, events) in batches {
        let dispatched = workspace
            .dispatch(events)
            .await
            .map_err(|e| anyhow::anyhow!("{}:{line}: {e}", file.display()))?;
        summary.batches += 1;
        summary.groups += dispatched.groups;
        summary.events += dispatched.events;
    }

    let store = workspace.store();
    summary.release_targets = store.release_targets()?.len();
    summary.releases = store.releases.len();
    summary.jobs = store.jobs.len();
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn plan(config: &EngineConfig, file: &std::path::Path) -> anyhow::Result<()> {
    for (line, events) in batch::read_file(file, &config.engine.workspace_id)? {
        println!("{}", serde_json::to_string(&batch::plan(line, &events))?);
    }
    Ok(())
}
