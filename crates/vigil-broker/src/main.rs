// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Vigil broker CLI
//!
//! # Usage
//!
//! ```bash
//! # Defaults: 0.0.0.0:7450, plaintext, in-memory sink
//! vigil-broker
//!
//! # From a configuration file
//! vigil-broker --config broker.toml run
//!
//! # Overload drill: every publish gets RETRY
//! vigil-broker --config broker.toml --overload
//!
//! vigil-broker gen-config --output broker.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use vigil::Shutdown;
use vigil_broker::{BrokerConfig, BrokerServer};

/// Vigil telemetry broker
#[derive(Parser, Debug)]
#[command(name = "vigil-broker")]
#[command(about = "Vigil broker - admission-controlled envelope ingest")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Start in overload drill mode
    #[arg(long)]
    overload: bool,

    /// JSON-lines file for accepted envelopes (overrides config)
    #[arg(long)]
    sink: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the broker (default)
    Run,

    /// Generate a default configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "broker.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match &args.command {
        Some(Commands::GenConfig { output }) => cmd_gen_config(output),
        Some(Commands::Run) | None => cmd_run(&args).await,
    }
}

fn load_config(args: &Args) -> Result<BrokerConfig> {
    let mut config = match &args.config {
        Some(path) => BrokerConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => BrokerConfig::default(),
    };

    if let Some(bind) = &args.bind {
        config.bind_address = bind.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.overload {
        config.overload = true;
    }
    if let Some(sink) = &args.sink {
        config.sink_path = sink.clone();
    }

    config.validate()?;
    Ok(config)
}

async fn cmd_run(args: &Args) -> Result<()> {
    let config = load_config(args)?;

    tracing::info!("Vigil broker v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "  admission: max_inflight={} hard_max={} backoff={}..={}ms",
        config.max_inflight,
        config.hard_max,
        config.backoff_min_ms,
        config.backoff_max_ms
    );
    tracing::info!(
        "  trusted keys: {}  max age: {}",
        config.trusted_keys.len(),
        match config.max_envelope_age_secs {
            0 => "unlimited".to_string(),
            secs => format!("{secs}s"),
        }
    );

    let server = BrokerServer::new(config).context("broker startup failed")?;
    let shutdown = Shutdown::new();

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received, stopping broker...");
            signal.trigger();
        }
    });

    server.run(shutdown).await?;
    Ok(())
}

fn cmd_gen_config(output: &Path) -> Result<()> {
    let body = BrokerConfig::default().to_toml()?;
    let content = format!(
        "# Vigil broker configuration\n# Generated by vigil-broker gen-config\n\n{}",
        body
    );
    std::fs::write(output, content).with_context(|| format!("writing {}", output.display()))?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}
