//! Backhaul relay: public HTTP entry point that tunnels requests to agents
//! connected over WebSocket.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{routing::get, Router};
use backhaul_shared::headers::ForwardedHeaders;
use tokio::net::TcpListener;

pub mod auth;
pub mod config;
pub mod exchange;
pub mod proxy;
pub mod registry;

use auth::AuthPolicy;
use config::RelayConfig;
use exchange::Multiplexer;
use registry::Registry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub mux: Arc<Multiplexer>,
    pub auth: Arc<AuthPolicy>,
    pub forwarded: Arc<ForwardedHeaders>,
    serials: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            mux: Arc::new(Multiplexer::new(config.request_timeout())),
            auth: Arc::new(config.auth_policy()),
            forwarded: Arc::new(config.forwarded_headers()),
            serials: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn next_serial(&self) -> u64 {
        self.serials.fetch_add(1, Ordering::Relaxed)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/__connect__", get(proxy::connect_agent))
        .route("/__ping__", get(proxy::ping_agent))
        .route("/__ws__", get(proxy::agent_ws_hop))
        .route("/__health__", get(|| async { "OK" }))
        .fallback(proxy::forward)
        .with_state(state)
}

/// Serve until `shutdown` resolves, then close every agent connection.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let registry = state.registry.clone();
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        registry.close_all().await;
    })
    .await
}
