use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use flowmeter::config::Config;
use flowmeter::engine::capture::create_sources;
use flowmeter::engine::{open_sink, ClockSource, SinkConfig};
use flowmeter::FlowEngine;

#[derive(Parser)]
#[command(name = "flowmeter")]
#[command(author, version, about = "Bidirectional network flow feature extractor")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Extract flows until the source is exhausted or interrupted
    Run {
        /// Replay a pcap file (expiry follows packet time)
        #[arg(short, long)]
        pcap: Option<PathBuf>,

        /// Append JSON-lines records to this file instead of the configured sink
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Write it to this file instead
        #[arg(short, long)]
        write: Option<PathBuf>,
    },
}

pub async fn run_command(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    match cli.command {
        Commands::Run { pcap, output } => cmd_run(config, pcap, output).await,
        Commands::Config { write } => cmd_config(config, write),
    }
}

async fn cmd_run(mut config: Config, pcap: Option<PathBuf>, output: Option<PathBuf>) -> Result<()> {
    if let Some(path) = pcap {
        config.capture.pcap_file = Some(path);
        config.engine.clock = ClockSource::Packet;
    }
    if let Some(path) = output {
        config.sink = SinkConfig::File { path };
    }
    config.validate()?;

    let sources = create_sources(&config.capture).context("Failed to open packet source")?;
    let sink = open_sink(&config.sink).context("Failed to open record sink")?;

    let mut engine = FlowEngine::new(config, sink)?;
    engine.start(sources)?;

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Interrupted, shutting down...");
        }
        _ = engine.wait_for_sources() => {
            info!("All sources exhausted");
        }
    }

    let stats = engine.shutdown().await?;
    info!(
        "{} flows finalized from {} packets",
        stats.flows_finalized(),
        stats.packets_processed
    );
    Ok(())
}

fn cmd_config(config: Config, write: Option<PathBuf>) -> Result<()> {
    match write {
        Some(path) => {
            config.save(&path)?;
            info!("Configuration written to {}", path.display());
        }
        None => print!("{}", config.to_toml_string()?),
    }
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
