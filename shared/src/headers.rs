//! Header list helpers and forwarded-header rewriting.
//!
//! Header lists are ordered `(name, value)` pairs with duplicates kept, so
//! all lookups are case-insensitive scans rather than map operations.

use crate::protocol::HeaderList;

/// Headers that describe one hop and never cross the tunnel.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// How the public `Host` reaches the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForwardHostMode {
    /// Put the public host in `X-Forwarded-Host`; the agent points `Host`
    /// back at its local target.
    #[default]
    XForwardedHost,
    /// Pass the public `Host` straight through.
    Host,
}

impl ForwardHostMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "x-forwarded-host" | "xfh" | "forwarded" => Some(ForwardHostMode::XForwardedHost),
            "host" => Some(ForwardHostMode::Host),
            _ => None,
        }
    }
}

/// Relay-side request rewriting before a request enters the tunnel.
#[derive(Debug, Clone)]
pub struct ForwardedHeaders {
    pub host_mode: ForwardHostMode,
    /// Value for `X-Forwarded-Proto`.
    pub proto: String,
}

impl Default for ForwardedHeaders {
    fn default() -> Self {
        Self {
            host_mode: ForwardHostMode::XForwardedHost,
            proto: "https".to_string(),
        }
    }
}

impl ForwardedHeaders {
    /// Rewrite request headers before forwarding to an agent
    pub fn rewrite_request(&self, headers: &mut HeaderList, client_ip: Option<&str>) {
        if let Some(ip) = client_ip {
            if get(headers, "x-forwarded-for").is_none() {
                headers.push(("x-forwarded-for".to_string(), ip.to_string()));
            }
        }
        upsert(headers, "x-forwarded-proto", &self.proto);

        if self.host_mode == ForwardHostMode::XForwardedHost {
            if let Some(host) = get(headers, "host").map(str::to_string) {
                upsert(headers, "x-forwarded-host", &host);
            }
        }
    }
}

/// Agent-side: point `Host` at the local target when the public host
/// travelled in `X-Forwarded-Host`.
pub fn resynthesize_host(headers: &mut HeaderList, local_authority: &str) {
    if get(headers, "x-forwarded-host").is_some() {
        upsert(headers, "host", local_authority);
    }
}

/// Drop hop-by-hop headers.
pub fn strip_hop_by_hop(headers: &mut HeaderList) {
    headers.retain(|(name, _)| !is_hop_by_hop(name));
}

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// The tunnel always carries decoded bytes, so the encoding header goes, and
/// with it any length that described the encoded body.
pub fn strip_content_encoding(headers: &mut HeaderList) {
    let encoded = get(headers, "content-encoding").is_some();
    headers.retain(|(name, _)| {
        !name.eq_ignore_ascii_case("content-encoding")
            && !(encoded && name.eq_ignore_ascii_case("content-length"))
    });
}

/// `GET` with `Connection: Upgrade` and `Upgrade: websocket`.
pub fn is_websocket_upgrade(method: &str, headers: &HeaderList) -> bool {
    method.eq_ignore_ascii_case("GET")
        && headers.iter().any(|(k, v)| {
            k.eq_ignore_ascii_case("connection")
                && v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
        })
        && get(headers, "upgrade").is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"))
}

/// First value for a header name.
pub fn get<'a>(headers: &'a HeaderList, key: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

/// Drop every value of `key`
pub fn remove(headers: &mut HeaderList, key: &str) {
    headers.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
}

/// Insert or update a header
pub fn upsert(headers: &mut HeaderList, key: &str, value: &str) {
    if let Some(h) = headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
        h.1 = value.to_string();
    } else {
        headers.push((key.to_string(), value.to_string()));
    }
}
