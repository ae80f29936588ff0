//! Endpoint descriptors
//!
//! Parses `[host:]port` listen descriptors and `host:port` upstream descriptors.

use std::fmt;
use std::net::SocketAddr;

use crate::error::{ProxyError, Result};

/// Interface bound when a listen endpoint omits its host
pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";

/// A network endpoint. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: Option<String>,
    port: u16,
}

impl Endpoint {
    pub fn new(host: Option<String>, port: u16) -> Self {
        Self { host, port }
    }

    /// Parse a listen descriptor: `PORT`, `HOST:PORT` or `[V6]:PORT`.
    /// Port `0` asks the OS for an ephemeral port.
    pub fn parse_listen(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ProxyError::InvalidEndpoint(s.to_string()));
        }
        match split_host_port(s) {
            Some((host, port)) => {
                let port = parse_port(s, port, PortZero::Allow)?;
                let host = if host.is_empty() {
                    None
                } else {
                    Some(host.to_string())
                };
                Ok(Self { host, port })
            }
            None => Ok(Self {
                host: None,
                port: parse_port(s, s, PortZero::Allow)?,
            }),
        }
    }

    /// Parse an upstream descriptor: `HOST:PORT` or `[V6]:PORT`, host required
    pub fn parse_upstream(s: &str) -> Result<Self> {
        let s = s.trim();
        let (host, port) =
            split_host_port(s).ok_or_else(|| ProxyError::InvalidEndpoint(s.to_string()))?;
        if host.is_empty() {
            return Err(ProxyError::InvalidEndpoint(s.to_string()));
        }
        Ok(Self {
            host: Some(host.to_string()),
            port: parse_port(s, port, PortZero::Reject)?,
        })
    }

    /// Parse `HOST[:PORT]`, falling back to `default_port` when the port is absent
    pub fn parse_host_with_default_port(s: &str, default_port: u16) -> Result<Self> {
        let s = s.trim();
        match split_host_port(s) {
            Some(_) => Self::parse_upstream(s),
            None if !s.is_empty() => Ok(Self {
                host: Some(s.trim_start_matches('[').trim_end_matches(']').to_string()),
                port: default_port,
            }),
            None => Err(ProxyError::InvalidEndpoint(s.to_string())),
        }
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Host used for binding, all interfaces when unset
    pub fn bind_host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_LISTEN_HOST)
    }

    /// Resolve to the first socket address
    pub async fn resolve(&self) -> std::io::Result<SocketAddr> {
        let host = self.bind_host();
        let mut addrs = tokio::net::lookup_host((host, self.port)).await?;
        addrs.next().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("no address found for {}", self),
            )
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host.as_deref() {
            Some(host) if host.contains(':') => write!(f, "[{}]:{}", host, self.port),
            Some(host) => write!(f, "{}:{}", host, self.port),
            None => write!(f, "{}:{}", DEFAULT_LISTEN_HOST, self.port),
        }
    }
}

/// Split `host:port`, honouring bracketed IPv6 hosts. `None` when no port separator exists.
fn split_host_port(s: &str) -> Option<(&str, &str)> {
    if let Some(rest) = s.strip_prefix('[') {
        let end = rest.find(']')?;
        let port = rest[end + 1..].strip_prefix(':')?;
        return Some((&rest[..end], port));
    }
    // A bare IPv6 literal has several colons and no port.
    if s.matches(':').count() > 1 {
        return None;
    }
    s.split_once(':')
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PortZero {
    Allow,
    Reject,
}

fn parse_port(input: &str, port: &str, zero: PortZero) -> Result<u16> {
    match port.parse::<u16>() {
        Ok(0) if zero == PortZero::Reject => Err(ProxyError::InvalidEndpoint(input.to_string())),
        Ok(p) => Ok(p),
        Err(_) => Err(ProxyError::InvalidEndpoint(input.to_string())),
    }
}
