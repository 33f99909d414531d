use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fim_core::config::FimConfig;
use fim_core::event::ChangeEvent;
use fim_core::paths::{default_database_path, log_dir};
use fim_core::sink::{EventSink, JsonLineSink};
use fim_service::{Components, EngineOptions, FimEngine};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "File integrity monitoring agent", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the monitoring agent until interrupted
    Run {
        #[arg(long)]
        config: PathBuf,
    },
    /// Run a single scheduled pass and print the resulting events
    Scan {
        #[arg(long)]
        config: PathBuf,
    },
    /// Load and validate a configuration file
    Check {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run_command(&config).await,
        Commands::Scan { config } => scan_command(&config).await,
        Commands::Check { config } => check_command(&config),
    }
}

fn load_config(path: &Path) -> Result<FimConfig> {
    let mut config = FimConfig::load(path)
        .with_context(|| format!("cannot load configuration {}", path.display()))?;
    if config.database.is_none() {
        config.database = Some(default_database_path()?);
    }
    Ok(config)
}

async fn run_command(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let log_path = match &config.event_log.path {
        Some(path) => path.clone(),
        None => log_dir()?.join("events.log"),
    };
    let sink = JsonLineSink::new(&log_path, config.event_log.max_bytes)
        .with_context(|| format!("cannot open event log {}", log_path.display()))?;
    info!(events = %log_path.display(), "event log ready");

    let engine = FimEngine::start(Arc::new(config), Arc::new(sink), EngineOptions::platform())?;
    info!("agent started");
    signal::ctrl_c().await?;
    info!("agent stopping");
    engine.shutdown().await;
    Ok(())
}

/// Prints each event as one JSON line on stdout.
struct StdoutSink;

impl EventSink for StdoutSink {
    fn emit(&self, event: &ChangeEvent) {
        let record = event.to_record(chrono::Utc::now());
        match serde_json::to_string(&record) {
            Ok(line) => println!("{line}"),
            Err(err) => tracing::warn!(error = %err, "cannot serialize event"),
        }
    }
}

async fn scan_command(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let components = Components::build(&config, Arc::new(StdoutSink), None, None)?;
    components.register_all(&config);
    let scanner = components.scanner.clone();
    let summary = tokio::task::spawn_blocking(move || scanner.scan())
        .await?
        .context("scan already running")?;
    info!(
        files = summary.files,
        added = summary.added,
        modified = summary.modified,
        deleted = summary.deleted,
        errors = summary.errors,
        "scan complete"
    );
    Ok(())
}

fn check_command(config_path: &Path) -> Result<()> {
    let config = FimConfig::load(config_path)
        .with_context(|| format!("invalid configuration {}", config_path.display()))?;
    println!(
        "{}: {} watched path(s), scan every {}s",
        config_path.display(),
        config.directories.len(),
        config.scan_interval_secs
    );
    Ok(())
}
