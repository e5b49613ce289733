//! Multi-connection manager
//!
//! Spawns one agent connection per id from the configuration and stops them
//! together on Ctrl+C.

use std::sync::Arc;

use anyhow::Result;
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tracing::{info, info_span, Instrument};

use crate::agent::Agent;
use crate::config::AgentConfig;

/// Manages the agent's tunnel connections
pub struct AgentManager {
    config: Arc<AgentConfig>,
    handles: Vec<JoinHandle<()>>,
}

impl AgentManager {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config: Arc::new(config),
            handles: Vec::new(),
        }
    }

    /// Start every connection; each logs under its own id.
    pub fn start_all(&mut self) -> Result<()> {
        for id in self.config.connection_ids() {
            let agent = Agent::new(self.config.clone(), id.clone())?;
            let span = info_span!("conn", id = %id);
            let handle = tokio::spawn(
                async move {
                    info!("Starting connection {}", agent.client_id());
                    agent.run().await;
                }
                .instrument(span),
            );
            self.handles.push(handle);
        }
        Ok(())
    }

    pub fn connections(&self) -> usize {
        self.handles.len()
    }

    /// Wait for Ctrl+C, or for every connection to give up.
    pub async fn wait_for_shutdown(mut self) {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down all connections...");
            }
            _ = join_all(self.handles.iter_mut()) => {
                info!("All connections stopped");
                return;
            }
        }
        for handle in self.handles {
            handle.abort();
        }
        println!("\n✓ All connections stopped.");
    }
}
