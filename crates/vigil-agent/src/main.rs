// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Vigil agent CLI
//!
//! # Usage
//!
//! ```bash
//! # Create a signing key and a config file
//! vigil-agent keygen --output agent.key
//! vigil-agent gen-config --output agent.toml
//!
//! # Pipe detector events (JSON lines) into the agent
//! detector | vigil-agent --config agent.toml run
//!
//! # Inspect the local backlog
//! vigil-agent --config agent.toml queue stats
//! vigil-agent --config agent.toml queue list --limit 20
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use vigil::{EnvelopeSigner, Shutdown};
use vigil_agent::{Agent, AgentConfig};
use vigil_queue::DurableQueue;

/// Vigil telemetry agent
#[derive(Parser, Debug)]
#[command(name = "vigil-agent")]
#[command(about = "Vigil agent - signed, durable telemetry delivery")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Broker address (overrides config)
    #[arg(long, global = true)]
    broker: Option<String>,

    /// Queue database path (overrides config)
    #[arg(long, global = true)]
    queue_path: Option<PathBuf>,

    /// Envelopes per second, 0 = unlimited (overrides config)
    #[arg(long)]
    send_rate: Option<u32>,

    /// Enable mutual TLS (overrides config)
    #[arg(long)]
    tls: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent, reading detector events from stdin (default)
    Run,

    /// Generate an Ed25519 signing key
    Keygen {
        /// Seed file; the public key goes to `<output>.pub`
        #[arg(short, long, default_value = "agent.key")]
        output: PathBuf,

        /// Overwrite an existing key
        #[arg(long)]
        force: bool,
    },

    /// Generate a default configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "agent.toml")]
        output: PathBuf,
    },

    /// Inspect or reset the durable queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand, Debug)]
enum QueueAction {
    /// Show depth and counters
    Stats,

    /// List the oldest queued records
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Delete every queued record
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match &args.command {
        Some(Commands::Keygen { output, force }) => cmd_keygen(output, *force),
        Some(Commands::GenConfig { output }) => cmd_gen_config(output),
        Some(Commands::Queue { action }) => cmd_queue(&args, action),
        Some(Commands::Run) | None => cmd_run(&args).await,
    }
}

fn load_config(args: &Args) -> Result<AgentConfig> {
    let mut config = match &args.config {
        Some(path) => AgentConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AgentConfig::default(),
    };

    if let Some(broker) = &args.broker {
        config.broker_address = broker.clone();
    }
    if let Some(path) = &args.queue_path {
        config.queue_path = path.clone();
    }
    if let Some(rate) = args.send_rate {
        config.send_rate = rate;
    }
    if args.tls {
        config.tls = true;
    }

    config.validate()?;
    Ok(config)
}

async fn cmd_run(args: &Args) -> Result<()> {
    let config = load_config(args)?;
    let shutdown = Shutdown::new();

    let agent = Agent::new(config, shutdown.clone()).context("agent startup failed")?;

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            signal.trigger();
        }
    });

    agent.run().await?;
    Ok(())
}

fn cmd_keygen(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            output.display()
        );
    }
    let signer = EnvelopeSigner::generate();
    let pub_path = signer.save(output)?;
    println!("Signing key:  {}", output.display());
    println!("Public key:   {}", pub_path.display());
    println!("              {}", signer.public_key_hex());
    Ok(())
}

fn cmd_gen_config(output: &Path) -> Result<()> {
    let body = AgentConfig::default().to_toml()?;
    let content = format!(
        "# Vigil agent configuration\n# Generated by vigil-agent gen-config\n\n{}",
        body
    );
    std::fs::write(output, content).with_context(|| format!("writing {}", output.display()))?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_queue(args: &Args, action: &QueueAction) -> Result<()> {
    let config = load_config(args)?;
    let queue = DurableQueue::open(&config.queue_path, config.queue_config())
        .with_context(|| format!("opening queue {}", config.queue_path.display()))?;

    match action {
        QueueAction::Stats => {
            let stats = queue.stats();
            println!("Queue: {}", config.queue_path.display());
            println!("  depth:          {}", stats.depth);
            println!(
                "  backlog:        {} / {} bytes",
                stats.backlog_bytes,
                queue.config().max_bytes
            );
            println!("  max retries:    {}", queue.config().max_retries);
        }
        QueueAction::List { limit } => {
            let records = queue.peek(*limit)?;
            if records.is_empty() {
                println!("Queue is empty");
            }
            for record in records {
                println!(
                    "#{:<8} {:<66} {:>8} B  retries={}  enqueued_at={}",
                    record.sequence_id,
                    record.idempotency_key,
                    record.len(),
                    record.retry_count,
                    record.enqueued_at_ns
                );
            }
        }
        QueueAction::Clear => {
            let removed = queue.clear()?;
            println!("Removed {} queued envelope(s)", removed);
        }
    }
    Ok(())
}
