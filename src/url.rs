//! `shuttle://host[:port]/path` addresses for the remote side of a transfer.

use crate::protocol::DEFAULT_PORT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSpec {
    pub host: String,
    pub port: u16,
    /// Server-side path, always starting with `/`.
    pub path: String,
}

impl RemoteSpec {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parse a `shuttle://` address. Returns `None` for anything that is not one,
/// so callers can treat the argument as a local path instead.
pub fn parse_remote_url(s: &str) -> Option<RemoteSpec> {
    let s = s.trim();
    let (scheme, rest) = s.split_once("://")?;
    if !scheme.eq_ignore_ascii_case("shuttle") {
        return None;
    }
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let (host, port) = split_host_port(authority)?;
    if host.is_empty() {
        return None;
    }
    Some(RemoteSpec {
        host: host.to_string(),
        port,
        path: normalize_remote_path(path),
    })
}

fn split_host_port(authority: &str) -> Option<(&str, u16)> {
    // [v6]:port
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        return match tail.strip_prefix(':') {
            Some(p) => Some((host, p.parse().ok()?)),
            None if tail.is_empty() => Some((host, DEFAULT_PORT)),
            None => None,
        };
    }
    match authority.rsplit_once(':') {
        Some((h, p)) => Some((h, p.parse().ok()?)),
        None => Some((authority, DEFAULT_PORT)),
    }
}

/// Collapse duplicate separators and drop a trailing one.
pub fn normalize_remote_path(path: &str) -> String {
    let parts: Vec<&str> = path
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    format!("/{}", parts.join("/"))
}

/// Join a relative component onto a remote directory path.
pub fn join_remote(dir: &str, name: &str) -> String {
    normalize_remote_path(&format!("{dir}/{name}"))
}
