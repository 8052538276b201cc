// thermo_media - media processing service
// Supervisor, worker and one-shot CLI in a single binary

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use thermo_media::card::ServiceCard;
use thermo_media::config::ServiceConfig;
use thermo_media::reaper::Reaper;
use thermo_media::supervisor::{ExecSpawner, Supervisor};
use thermo_media::{worker, InputFormat, RequestLifecycle, RequestOptions, StageRegistry, Storage, Upload};

#[derive(Parser)]
#[command(name = "thermo_media", version, about = "Thermo Media - fixed-capacity upload processing service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the supervisor and its worker pool (default)
    Serve {
        #[command(flatten)]
        config: ServiceConfig,
    },

    /// Internal: one worker process, spawned by `serve`
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        index: usize,
    },

    /// Run one file through the pipeline in-process and print the receipt
    Process {
        file: PathBuf,

        /// Declared content type; guessed from the extension when omitted
        #[arg(long = "type")]
        content_type: Option<String>,

        /// Stage plan, e.g. `grayscale,heatmap:25`
        #[arg(long)]
        stages: Option<String>,

        /// Target format (png, jpeg, webp, bmp, mp4)
        #[arg(long)]
        format: Option<String>,

        #[command(flatten)]
        config: ServiceConfig,
    },

    /// One orphan sweep of the uploads and partial artifact areas
    Reap {
        /// Minimum age of a removable file; request timeout + grace when omitted
        #[arg(long)]
        max_age_secs: Option<u64>,

        #[command(flatten)]
        config: ServiceConfig,
    },
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let command = match Cli::parse().command {
        Some(command) => command,
        None => match Cli::parse_from(["thermo_media", "serve"]).command {
            Some(command) => command,
            None => bail!("no command"),
        },
    };

    match command {
        Command::Serve { config } => serve(config),
        Command::Worker { index } => run_worker(index),
        Command::Process {
            file,
            content_type,
            stages,
            format,
            config,
        } => process(config, file, content_type, RequestOptions { stages, format }),
        Command::Reap { max_age_secs, config } => reap(config, max_age_secs),
    }
}

/// Human readable by default, JSON with `LOG_FORMAT=json`. Always stderr:
/// worker stdout carries slot events and `process` prints its receipt there.
fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .with(env_filter)
            .init();
    }
}

fn serve(config: ServiceConfig) -> Result<()> {
    config.validate()?;
    let config = Arc::new(config);

    info!("🎬 Starting Thermo Media v{}", env!("CARGO_PKG_VERSION"));
    info!("   Address: {}", config.bind_addr());
    info!("   Uploads: {}", config.uploads_dir.display());
    info!("   Data: {}", config.data_dir.display());
    info!("   Max upload: {} bytes", config.max_upload_bytes);

    let card = ServiceCard::describe(&config, &StageRegistry::builtin());
    info!("   📦 Stages:");
    for stage in &card.stages {
        info!("      • {} - {}", stage.name, stage.description);
    }
    let accepted = card.inputs.iter().filter(|f| f.accepted == Some(true)).count();
    info!("   ✅ {} input types accepted, {} output formats", accepted, card.outputs.len());

    let spawner = ExecSpawner::current(&config)?;
    let supervisor = Supervisor::new(Arc::clone(&config), Box::new(spawner));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .build()
        .context("Failed to build runtime")?;
    runtime.block_on(supervisor.run(shutdown_signal()))?;

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
    info!("Received shutdown signal");
}

fn run_worker(index: usize) -> Result<()> {
    let config = Arc::new(ServiceConfig::from_worker_env()?);
    let runtime = worker::runtime(&config).context("Failed to build worker runtime")?;
    runtime.block_on(worker::run(config, index))
}

fn process(config: ServiceConfig, file: PathBuf, content_type: Option<String>, options: RequestOptions) -> Result<()> {
    config.validate()?;

    let content_type = match content_type {
        Some(t) => t,
        None => file
            .extension()
            .and_then(|e| e.to_str())
            .and_then(InputFormat::from_extension)
            .map(|f| f.mime().to_string())
            .with_context(|| format!("Cannot guess a content type for {}; pass --type", file.display()))?,
    };
    let bytes = std::fs::read(&file).with_context(|| format!("Failed to read {}", file.display()))?;
    let mut upload = Upload::new(bytes, content_type);
    if let Some(name) = file.file_name().and_then(|n| n.to_str()) {
        upload = upload.with_filename(name);
    }

    let lifecycle = RequestLifecycle::from_config(Arc::new(config))?;
    let receipt = lifecycle.process(Uuid::new_v4(), upload, &options)?;
    println!("{}", serde_json::to_string_pretty(&receipt)?);
    Ok(())
}

fn reap(config: ServiceConfig, max_age_secs: Option<u64>) -> Result<()> {
    let max_age = max_age_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.orphan_age());
    let storage = Storage::open(&config.uploads_dir, &config.data_dir)?;

    let report = Reaper::new(storage, max_age, config.reap_interval()).sweep();
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
