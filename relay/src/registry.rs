//! Agent connection registry and per-request selection.
//!
//! Connections are keyed by the id the agent declared on connect. Selection
//! hashes a session string (CRC-32) into a deterministic ordering of the
//! live set; the ordering is rebuilt from scratch whenever membership
//! changes, so affinity holds only while the set is stable.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use backhaul_shared::headers;
use backhaul_shared::{HeaderList, RequestFrame, TunnelTransport};
use tokio::sync::RwLock;

use crate::exchange::Exchanges;

/// One live agent socket.
#[derive(Clone)]
pub struct AgentConnection {
    pub client_id: String,
    /// Distinguishes a reconnect under the same id from the socket it replaced.
    pub serial: u64,
    pub transport: TunnelTransport<RequestFrame>,
    pub exchanges: Arc<Exchanges>,
    pub connected_at: Instant,
}

impl AgentConnection {
    pub fn new(
        client_id: String,
        serial: u64,
        transport: TunnelTransport<RequestFrame>,
        exchanges: Arc<Exchanges>,
    ) -> Self {
        Self {
            client_id,
            serial,
            transport,
            exchanges,
            connected_at: Instant::now(),
        }
    }
}

#[derive(Default)]
struct Members {
    by_id: HashMap<String, AgentConnection>,
    /// Selection order, rebuilt on every membership change.
    order: Vec<String>,
}

impl Members {
    fn rebuild(&mut self) {
        let n = self.by_id.len() as u32;
        let mut order: Vec<String> = self.by_id.keys().cloned().collect();
        if n > 0 {
            order.sort_by(|a, b| {
                (checksum(a) % n, a.as_str()).cmp(&(checksum(b) % n, b.as_str()))
            });
        }
        self.order = order;
    }
}

/// Live agent connections, owned by the relay's application state.
#[derive(Default)]
pub struct Registry {
    members: RwLock<Members>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Returns the connection it replaced, if an agent
    /// with the same id was already registered.
    pub async fn insert(&self, conn: AgentConnection) -> Option<AgentConnection> {
        let mut members = self.members.write().await;
        let replaced = members.by_id.insert(conn.client_id.clone(), conn);
        members.rebuild();
        replaced
    }

    /// Remove `client_id` if it still belongs to the connection `serial`.
    pub async fn remove(&self, client_id: &str, serial: u64) -> bool {
        let mut members = self.members.write().await;
        match members.by_id.get(client_id) {
            Some(conn) if conn.serial == serial => {
                members.by_id.remove(client_id);
                members.rebuild();
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, client_id: &str) -> Option<AgentConnection> {
        self.members.read().await.by_id.get(client_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.members.read().await.by_id.len()
    }

    /// Ask every live connection to close; each removes itself on the way out.
    pub async fn close_all(&self) {
        let members = self.members.read().await;
        for conn in members.by_id.values() {
            conn.transport.close();
        }
    }

    /// Pick the connection serving `session_id`.
    pub async fn select(&self, session_id: &str) -> Option<AgentConnection> {
        let members = self.members.read().await;
        if members.order.is_empty() {
            return None;
        }
        let idx = checksum(session_id) as usize % members.order.len();
        members.by_id.get(&members.order[idx]).cloned()
    }
}

pub fn checksum(s: &str) -> u32 {
    crc32fast::hash(s.as_bytes())
}

/// The string a request is hashed by: forwarded-for, else the peer address,
/// else a placeholder.
pub fn session_key(headers: &HeaderList, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers::get(headers, "x-forwarded-for") {
        if !forwarded.trim().is_empty() {
            return forwarded.to_string();
        }
    }
    match peer {
        Some(addr) => addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}
