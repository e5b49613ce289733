//! Access control for the relay's two audiences.
//!
//! Agents present a shared connection token on the control endpoints. Public
//! callers present `Authorization: Bearer <token>` unless their path matches
//! one of the bypass globs (`*` is one segment, `**` any depth).

#[derive(Debug, Clone, Default)]
pub struct AuthPolicy {
    conn_token: Option<String>,
    auth_token: Option<String>,
    bypass: Vec<String>,
}

impl AuthPolicy {
    pub fn new(conn_token: Option<String>, auth_token: Option<String>, bypass: Vec<String>) -> Self {
        Self {
            conn_token: conn_token.filter(|t| !t.is_empty()),
            auth_token: auth_token.filter(|t| !t.is_empty()),
            bypass,
        }
    }

    /// Check the token an agent presented on `/__connect__` or `/__ws__`.
    pub fn connection_allowed(&self, token: Option<&str>) -> bool {
        match &self.conn_token {
            Some(expected) => token == Some(expected.as_str()),
            None => true,
        }
    }

    /// Check a public request's `Authorization` header.
    pub fn request_allowed(&self, path: &str, authorization: Option<&str>) -> bool {
        let Some(expected) = &self.auth_token else {
            return true;
        };
        if self.bypassed(path) {
            return true;
        }
        authorization
            .and_then(bearer_token)
            .map(|token| token == expected)
            .unwrap_or(false)
    }

    fn bypassed(&self, path: &str) -> bool {
        // Globs match the path only.
        let path = path.split('?').next().unwrap_or(path);
        self.bypass.iter().any(|pattern| matches_glob(pattern, path))
    }
}

fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
}

fn matches_glob(pattern: &str, path: &str) -> bool {
    if pattern == path || pattern == "**" || pattern == "/**" {
        return true;
    }

    let pat_parts: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path_parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    matches_parts(&pat_parts, &path_parts)
}

fn matches_parts(pattern: &[&str], path: &[&str]) -> bool {
    if pattern.is_empty() {
        return path.is_empty();
    }

    if pattern[0] == "**" {
        return (0..=path.len()).any(|i| matches_parts(&pattern[1..], &path[i..]));
    }

    match path.first() {
        Some(segment) if pattern[0] == "*" || pattern[0] == *segment => {
            matches_parts(&pattern[1..], &path[1..])
        }
        _ => false,
    }
}
