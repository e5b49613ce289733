//! Relay configuration: command-line flags with environment fallbacks.

use std::net::SocketAddr;

use backhaul_shared::headers::{ForwardHostMode, ForwardedHeaders};
use clap::Parser;
use tokio::time::Duration;

use crate::auth::AuthPolicy;

#[derive(Parser, Debug, Clone)]
#[command(name = "backhaul-relay")]
#[command(author, version, about = "Public relay for backhaul agents")]
pub struct RelayConfig {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Token agents must present when connecting
    #[arg(long, env = "CONN_TOKEN")]
    pub conn_token: Option<String>,

    /// Bearer token required on public requests
    #[arg(long, env = "AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Comma-separated path globs exempt from the bearer check
    #[arg(long, env = "AUTH_BYPASS", value_delimiter = ',')]
    pub auth_bypass: Vec<String>,

    /// How the public Host reaches the local service: x-forwarded-host | host
    #[arg(long, env = "FORWARD_HOST_MODE", default_value = "x-forwarded-host", value_parser = parse_host_mode)]
    pub forward_host_mode: ForwardHostMode,

    /// Scheme reported in X-Forwarded-Proto
    #[arg(long, env = "FORWARDED_PROTO", default_value = "https")]
    pub forwarded_proto: String,

    /// Seconds to wait for an agent's response header
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,
}

fn parse_host_mode(value: &str) -> Result<ForwardHostMode, String> {
    ForwardHostMode::parse(value)
        .ok_or_else(|| format!("expected 'x-forwarded-host' or 'host', got '{}'", value))
}

impl RelayConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn auth_policy(&self) -> AuthPolicy {
        let bypass = self
            .auth_bypass
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        AuthPolicy::new(self.conn_token.clone(), self.auth_token.clone(), bypass)
    }

    pub fn forwarded_headers(&self) -> ForwardedHeaders {
        ForwardedHeaders {
            host_mode: self.forward_host_mode,
            proto: self.forwarded_proto.clone(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            conn_token: None,
            auth_token: None,
            auth_bypass: Vec::new(),
            forward_host_mode: ForwardHostMode::default(),
            forwarded_proto: "https".to_string(),
            request_timeout_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_parse() {
        let config = RelayConfig::parse_from([
            "backhaul-relay",
            "--port",
            "9000",
            "--conn-token",
            "s3cret",
            "--auth-bypass",
            "/public/**, /status",
            "--forward-host-mode",
            "host",
        ]);
        assert_eq!(config.port, 9000);
        assert_eq!(config.forward_host_mode, ForwardHostMode::Host);
        assert!(config.auth_policy().connection_allowed(Some("s3cret")));
        assert_eq!(config.forwarded_headers().proto, "https");
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_bad_host_mode_rejected() {
        let result = RelayConfig::try_parse_from(["backhaul-relay", "--forward-host-mode", "via"]);
        assert!(result.is_err());
    }
}
