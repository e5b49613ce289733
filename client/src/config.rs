//! Agent configuration.
//!
//! Settings come from a `backhaul.yml` file, the command line, or the
//! environment; flags and environment variables override file values.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

/// Idle seconds before a ping is sent.
pub const DEFAULT_PING_INTERVAL: u64 = 30;
pub const MIN_PING_INTERVAL: u64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentConfig {
    /// Id this agent registers under
    pub client_id: String,

    /// Relay base URL (http, https, ws or wss)
    pub remote_url: String,

    /// Local service base URL
    pub local_url: String,

    /// Token for the relay's agent endpoints
    #[serde(default)]
    pub conn_token: Option<String>,

    /// Idle seconds before pinging the relay
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,

    /// Parallel tunnel connections
    #[serde(default = "default_max_conn")]
    pub max_conn: usize,
}

fn default_ping_interval() -> u64 {
    DEFAULT_PING_INTERVAL
}

fn default_max_conn() -> usize {
    1
}

/// Values given on the command line or through the environment.
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Id to register with the relay
    #[arg(long, env = "CLIENT_ID")]
    pub client_id: Option<String>,

    /// Relay base URL
    #[arg(long, env = "REMOTE_URL")]
    pub remote_url: Option<String>,

    /// Local service base URL
    #[arg(long, env = "LOCAL_URL")]
    pub local_url: Option<String>,

    /// Connection token expected by the relay
    #[arg(long, env = "CONN_TOKEN")]
    pub conn_token: Option<String>,

    /// Idle seconds before pinging the relay (minimum 5)
    #[arg(long, env = "PING_INTERVAL")]
    pub ping_interval: Option<u64>,

    /// Number of parallel tunnel connections
    #[arg(long, env = "MAX_CONN")]
    pub max_conn: Option<usize>,
}

impl AgentConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: AgentConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Combine an optional file with overrides; the result is validated.
    pub fn resolve(file: Option<AgentConfig>, overrides: ConfigOverrides) -> Result<Self> {
        let base = file.unwrap_or(AgentConfig {
            client_id: String::new(),
            remote_url: String::new(),
            local_url: String::new(),
            conn_token: None,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_conn: 1,
        });

        let config = AgentConfig {
            client_id: overrides.client_id.unwrap_or(base.client_id),
            remote_url: overrides.remote_url.unwrap_or(base.remote_url),
            local_url: overrides.local_url.unwrap_or(base.local_url),
            conn_token: overrides.conn_token.or(base.conn_token),
            ping_interval: overrides.ping_interval.unwrap_or(base.ping_interval),
            max_conn: overrides.max_conn.unwrap_or(base.max_conn),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() || self.remote_url.is_empty() || self.local_url.is_empty() {
            anyhow::bail!("CLIENT_ID, REMOTE_URL and LOCAL_URL must be set");
        }
        for (name, url) in [("REMOTE_URL", &self.remote_url), ("LOCAL_URL", &self.local_url)] {
            let parsed = Url::parse(url).with_context(|| format!("Invalid {}: {}", name, url))?;
            match parsed.scheme() {
                "http" | "https" | "ws" | "wss" => {}
                other => anyhow::bail!("Unsupported scheme '{}' in {}", other, name),
            }
        }
        if self.max_conn == 0 {
            anyhow::bail!("MAX_CONN must be at least 1");
        }
        Ok(())
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = ["backhaul.yml", "backhaul.yaml", ".backhaul.yml", ".backhaul.yaml"];

        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        let home = dirs::home_dir()?;
        candidates.iter().map(|name| home.join(name)).find(|path| path.exists())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval.max(MIN_PING_INTERVAL))
    }

    /// Ids of the connections to open: the plain id, or `<id>-1..=N`.
    pub fn connection_ids(&self) -> Vec<String> {
        if self.max_conn <= 1 {
            return vec![self.client_id.clone()];
        }
        (1..=self.max_conn)
            .map(|i| format!("{}-{}", self.client_id, i))
            .collect()
    }

    /// `ws(s)://<remote>/__connect__?clientId=..&token=..`
    pub fn connect_url(&self, client_id: &str) -> Result<Url> {
        let mut params = vec![("clientId", client_id)];
        if let Some(token) = &self.conn_token {
            params.push(("token", token.as_str()));
        }
        remote_endpoint(&self.remote_url, true, "__connect__", &params)
    }

    /// Second hop for a bridged WebSocket exchange, carrying the
    /// sub-protocol the origin accepted.
    pub fn ws_hop_url(&self, client_id: &str, request_id: &str, protocol: Option<&str>) -> Result<Url> {
        let mut params = vec![("clientId", client_id), ("requestId", request_id)];
        if let Some(token) = &self.conn_token {
            params.push(("token", token.as_str()));
        }
        if let Some(protocol) = protocol {
            params.push(("protocol", protocol));
        }
        remote_endpoint(&self.remote_url, true, "__ws__", &params)
    }

    /// Out-of-band health probe.
    pub fn ping_url(&self, client_id: &str) -> Result<Url> {
        remote_endpoint(&self.remote_url, false, "__ping__", &[("clientId", client_id)])
    }

    pub fn local_target(&self) -> Result<LocalTarget> {
        LocalTarget::new(&self.local_url)
    }
}

fn remote_endpoint(base: &str, websocket: bool, endpoint: &str, params: &[(&str, &str)]) -> Result<Url> {
    let mut url = Url::parse(base).with_context(|| format!("Invalid remote URL: {}", base))?;
    let secure = matches!(url.scheme(), "https" | "wss");
    let scheme = match (websocket, secure) {
        (true, true) => "wss",
        (true, false) => "ws",
        (false, true) => "https",
        (false, false) => "http",
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("Cannot use scheme {} for {}", scheme, base))?;

    let path = format!("{}/{}", url.path().trim_end_matches('/'), endpoint);
    url.set_path(&path);
    url.query_pairs_mut().clear().extend_pairs(params);
    Ok(url)
}

/// The local service requests are replayed against.
#[derive(Debug, Clone)]
pub struct LocalTarget {
    base: String,
    authority: String,
    secure: bool,
}

impl LocalTarget {
    pub fn new(local_url: &str) -> Result<Self> {
        let url = Url::parse(local_url).with_context(|| format!("Invalid local URL: {}", local_url))?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("Local URL has no host: {}", local_url))?;
        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        Ok(Self {
            base: local_url.trim_end_matches('/').to_string(),
            authority,
            secure: matches!(url.scheme(), "https" | "wss"),
        })
    }

    /// `host[:port]` of the local service.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Absolute URL for a request path (path plus query).
    pub fn http_url(&self, path: &str) -> Result<Url> {
        let mut url = Url::parse(&format!("{}{}", self.base, path))
            .with_context(|| format!("Invalid request path: {}", path))?;
        let scheme = if self.secure { "https" } else { "http" };
        url.set_scheme(scheme)
            .map_err(|_| anyhow::anyhow!("Cannot use scheme {}", scheme))?;
        Ok(url)
    }

    /// Same as [`http_url`](Self::http_url) with a WebSocket scheme.
    pub fn ws_url(&self, path: &str) -> Result<Url> {
        let mut url = self.http_url(path)?;
        let scheme = if self.secure { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| anyhow::anyhow!("Cannot use scheme {}", scheme))?;
        Ok(url)
    }
}
