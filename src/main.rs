//! Argus — multi-channel video recorder
//!
//! Usage:
//!   argus run    --config config.toml        # record all channels + HTTP API
//!   argus status --config config.toml        # print status
//!   argus list   --config config.toml --channel cam1

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use argus::api::{start_server, AppState};
use argus::config::Config;
use argus::procs::ProcessRegistry;
use argus::recorder::RecorderDeps;
use argus::retrieval::RetrievalEngine;
use argus::schedule::spawn_scheduler;
use argus::storage::eviction;
use argus::storage::index::SegmentIndex;

#[derive(Parser)]
#[command(name = "argus", about = "Multi-channel video recorder", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record all configured channels and serve the HTTP API.
    Run {
        /// Path to the TOML configuration file.
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Print a brief status snapshot and exit.
    Status {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// List recording dates and segment counts for a channel.
    List {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
        /// Channel ID to list.
        #[arg(long)]
        channel: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => {
            run(config).await;
        }
        Command::Status { config } => {
            run_status(config);
        }
        Command::List { config, channel } => {
            run_list(config, &channel);
        }
    }
}

fn load_config(path: &PathBuf) -> Config {
    match Config::from_file(path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to load config");
            std::process::exit(1);
        }
    }
}

async fn run(config_path: PathBuf) {
    let cfg = load_config(&config_path);

    for dir in [cfg.capture_dir(), cfg.scratch_dir(), cfg.evidence_dir()] {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            error!(dir = %dir.display(), error = %e, "Cannot create storage directory");
            std::process::exit(1);
        }
    }

    info!(
        channels = cfg.channels.len(),
        base_path = ?cfg.storage.base_path,
        segment_secs = cfg.storage.segment_duration_secs,
        max_storage_percent = cfg.storage.max_storage_percent,
        "Starting recorder"
    );

    let index = match SegmentIndex::open(&cfg.index_path()) {
        Ok(i) => i,
        Err(e) => {
            error!(error = %e, "Failed to open segment index");
            std::process::exit(1);
        }
    };
    let registry = ProcessRegistry::new();

    let (nudge_tx, nudge_rx) = mpsc::channel(8);
    eviction::spawn_monitor(
        cfg.capture_dir(),
        index.clone(),
        cfg.storage.max_storage_percent,
        Duration::from_secs(cfg.storage.eviction_poll_secs),
        nudge_rx,
    );

    let deps = RecorderDeps {
        registry: registry.clone(),
        index: index.clone(),
        capture_root: cfg.capture_dir(),
        segment_secs: cfg.storage.segment_duration_secs,
        eviction_nudge: nudge_tx,
    };
    let scheduler = spawn_scheduler(
        cfg.channels.clone(),
        cfg.schedule.clone(),
        cfg.scratch_dir(),
        deps,
    );

    let engine =
        match RetrievalEngine::new(registry.clone(), index.clone(), scheduler.clone(), &cfg) {
            Ok(e) => e,
            Err(e) => {
                error!(error = %e, "Failed to initialize retrieval engine");
                std::process::exit(1);
            }
        };

    if cfg.api.enabled {
        let state = Arc::new(AppState {
            scheduler: scheduler.clone(),
            engine,
            index,
            registry,
            base_path: cfg.storage.base_path.clone(),
        });
        tokio::spawn(start_server(state, cfg.api.port));
    }

    // Wait for CTRL+C.
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Received CTRL+C, shutting down…");
        }
        Err(e) => {
            error!(error = %e, "Signal error");
        }
    }

    scheduler.shutdown().await;
}

fn run_status(config_path: PathBuf) {
    let cfg = load_config(&config_path);

    let usage = eviction::disk_usage_percent(&cfg.storage.base_path)
        .map(|p| format!("{p:.1}%"))
        .unwrap_or_else(|e| format!("unavailable ({e})"));

    println!("=== Recorder Status ===");
    println!("Base path   : {}", cfg.storage.base_path.display());
    println!("Disk usage  : {usage}");
    println!(
        "Window      : {:02}:{:02}–{:02}:{:02} UTC",
        cfg.schedule.start_hour,
        cfg.schedule.start_minute,
        cfg.schedule.stop_hour,
        cfg.schedule.stop_minute
    );
    println!("Channels    : {}", cfg.channels.len());

    match SegmentIndex::open(&cfg.index_path()) {
        Ok(index) => {
            for ch in &cfg.channels {
                let count = index.count_for_channel(&ch.id).unwrap_or(0);
                println!("  {} ({}): {} segments — {}", ch.id, ch.name, count, ch.url);
            }
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

fn run_list(config_path: PathBuf, channel_id: &str) {
    let cfg = load_config(&config_path);
    if cfg.channel(channel_id).is_none() {
        eprintln!("Error: unknown channel '{channel_id}'");
        std::process::exit(1);
    }

    let index = match SegmentIndex::open(&cfg.index_path()) {
        Ok(i) => i,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    match index.list_dates(channel_id) {
        Ok(dates) if dates.is_empty() => {
            println!("Channel {channel_id}: no finalized segments.");
        }
        Ok(dates) => {
            let total = index.count_for_channel(channel_id).unwrap_or(0);
            println!("Channel {channel_id}: {total} segments on {} dates", dates.len());
            for date in dates {
                println!("  {date}");
            }
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
