use anyhow::{Context, Result};
use backhaul_relay::{config::RelayConfig, serve, AppState};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("backhaul_relay=info,backhaul_shared=info")),
        )
        .init();

    let config = RelayConfig::parse();
    let state = AppState::new(&config);

    let addr = config.listen_addr();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(
        "Backhaul relay on {} (agent token: {}, public auth: {})",
        addr,
        if config.conn_token.is_some() { "on" } else { "off" },
        if config.auth_token.is_some() { "on" } else { "off" },
    );

    serve(listener, state, shutdown_signal())
        .await
        .context("relay server failed")?;
    info!("Relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
