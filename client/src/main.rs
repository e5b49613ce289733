use std::path::PathBuf;

use anyhow::Result;
use backhaul::config::{AgentConfig, ConfigOverrides};
use backhaul::multi::AgentManager;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "backhaul")]
#[command(author = "Backhaul Team")]
#[command(version = "0.1.0")]
#[command(about = "Expose a local service through a backhaul relay", long_about = None)]
struct Cli {
    #[command(flatten)]
    overrides: ConfigOverrides,

    /// YAML config file (defaults to backhaul.yml in the current or home directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "backhaul=debug,backhaul_shared=debug"
    } else {
        "backhaul=info,backhaul_shared=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let path = match cli.config {
        Some(path) => Some(path),
        None if cli.overrides.client_id.is_none() => AgentConfig::find_config(),
        None => None,
    };
    let file = match &path {
        Some(path) => {
            info!("Using config {}", path.display());
            Some(AgentConfig::load(path)?)
        }
        None => None,
    };
    let config = AgentConfig::resolve(file, cli.overrides)?;

    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║  Backhaul Agent                                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Relay:       {:<46} ║", config.remote_url);
    println!("║  Local:       {:<46} ║", config.local_url);
    println!("║  Connections: {:<46} ║", config.connection_ids().join(", "));
    println!("╚══════════════════════════════════════════════════════════════╝\n");
    println!("Press Ctrl+C to stop\n");

    let mut manager = AgentManager::new(config);
    manager.start_all()?;
    manager.wait_for_shutdown().await;
    Ok(())
}
