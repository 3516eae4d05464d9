//! Tatbeeb Link relay - CLI entry point
//!
//! Exposes on-premise SQL servers to the cloud through agent-originated
//! tunnels. Loads a JSON config, terminates TLS on the control port, and
//! runs until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use link_relay::{Relay, RelayConfig};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SYSTEM_CONFIG_PATH: &str = "/etc/tatbeeb-link/config.production.json";
const LOCAL_CONFIG_PATH: &str = "config.production.json";

/// Tatbeeb Link - relay SQL clients to agents behind NAT
#[derive(Parser, Debug)]
#[command(name = "tatbeeb-link")]
#[command(about = "Tatbeeb Link relay server")]
#[command(version)]
struct Cli {
    /// Path to the JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// System-wide config when present, local file otherwise
fn default_config_path() -> PathBuf {
    let system = PathBuf::from(SYSTEM_CONFIG_PATH);
    if system.exists() {
        system
    } else {
        PathBuf::from(LOCAL_CONFIG_PATH)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config_path = cli.config.unwrap_or_else(default_config_path);
    info!("Loading configuration from {:?}", config_path);

    let config = RelayConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {:?}", config_path))?;

    info!("Configuration loaded");
    info!("  Registration mode: {:?}", config.registration_mode);
    if let Some(his) = &config.his {
        info!("  HIS backend: {}", his.backend_url);
    } else {
        warn!("  HIS backend: not configured, directory notifications disabled");
    }

    let relay = Relay::new(config).context("failed to initialise relay")?;
    relay.run().await.context("relay terminated with an error")?;

    Ok(())
}
