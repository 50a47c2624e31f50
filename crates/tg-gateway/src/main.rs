//! ttygate daemon
//!
//! Listens for SSH connections, checks passwords against the credential
//! backend and runs the configured application for each authenticated user
//! in a process of its own.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tg_core::config::GatewayConfig;
use tg_gateway::{load_or_generate_host_key, ConnectionContext, Supervisor};

#[derive(Parser)]
#[command(name = "ttygate")]
#[command(about = "SSH gateway that runs an application per authenticated user")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("ttygate starting...");

    let mut config = GatewayConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    config.validate().context("Invalid configuration")?;

    let host_key = load_or_generate_host_key(&config.host_key_path)?;
    tracing::info!("Credential backend at {}", config.broker.address);

    let ctx = ConnectionContext::new(&config, host_key);
    let supervisor = Supervisor::bind(&config.bind_address, config.reap_interval, ctx)
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;

    // Only a forked connection process gets past this point
    let process = supervisor.run()?;
    std::process::exit(process.run());
}
