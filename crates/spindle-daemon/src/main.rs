//! spindle-daemon entry point.
//!
//! Loads the JSON configuration, registers clients and declared plugins,
//! starts the connection server, and runs until `SIGINT`/`SIGTERM`
//! initiates graceful shutdown. Fatal startup errors exit non-zero.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use spindle_core::config::AppConfig;
use spindle_core::plugin::PluginRegistry;
use spindle_daemon::Server;
use spindle_daemon::builtin;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// spindle daemon - authenticated TCP plugin host
#[derive(Parser, Debug)]
#[command(name = "spindle-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to a file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    let config = AppConfig::from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {:?}", args.config))?;

    let registry = Arc::new(PluginRegistry::new(&config.server.config_dir));
    let mut server =
        Server::new(config.server.clone(), Arc::clone(&registry)).context("failed to create server")?;

    for client in config.clients {
        let id = client.id.clone();
        if let Err(e) = server.register_client(client) {
            warn!(client = %id, error = %e, "failed to register client");
        }
    }

    let loaded = builtin::load_declared_plugins(&config.server.plugins_dir, &registry)
        .await
        .context("failed to load declared plugins")?;
    info!(loaded, plugins_dir = ?config.server.plugins_dir, "plugins loaded");

    let addr = server.start().await.context("failed to start server")?;
    info!(%addr, pid = std::process::id(), "spindle daemon running");

    // Wait for a termination signal, then drain gracefully.
    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    info!("shutting down");
    server.stop().await;
    info!("shutdown complete");
    Ok(())
}
