//! Configuration module for the intercepting proxy
//!
//! Handles CLI argument parsing. Tuning options can also be set through
//! environment variables with the INTERCEPT_PROXY_ prefix.

use anyhow::{anyhow, Result};
use clap::{ArgAction, ArgGroup, Parser};
use std::path::PathBuf;

use crate::address::Endpoint;
use crate::core::rules::{RuleSet, Scope};
use crate::core::session::DEFAULT_BUFFER_SIZE;
use crate::transport::Protocol;

/// CLI arguments
#[derive(Parser, Debug, Clone)]
#[command(
    name = "intercept-proxy",
    author,
    version,
    about = "Starts a TCP/UDP/SSL intercept proxy",
    after_help = "Examples:\n  intercept-proxy 8080 google.com:80\n  intercept-proxy --udp --hexdump 0.0.0.0:53 4.2.2.1:53"
)]
#[command(group(ArgGroup::new("protocol").args(["tcp", "ssl", "udp"])))]
pub struct CliArgs {
    /// TCP Proxy (default)
    #[arg(short = 't', long)]
    pub tcp: bool,

    /// SSL Proxy
    #[arg(short = 'S', long, visible_alias = "tls")]
    pub ssl: bool,

    /// UDP Proxy
    #[arg(short = 'u', long)]
    pub udp: bool,

    /// Enable hexdump output
    #[arg(short = 'x', long)]
    pub hexdump: bool,

    /// Host to listen on (overrides the PROXY argument)
    #[arg(short = 'H', long, value_name = "HOST")]
    pub host: Option<String>,

    /// Port to listen on (overrides the PROXY argument)
    #[arg(short = 'p', long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Upstream server; the port defaults to the listen port
    #[arg(short = 's', long, value_name = "HOST[:PORT]")]
    pub server: Option<String>,

    // ==================== Rules ====================
    /// Rewrite rules
    #[arg(short = 'r', long, value_name = "/REGEXP/:STRING", help_heading = "Rules")]
    pub rewrite: Vec<String>,

    /// Client rewrite rules
    #[arg(long, value_name = "/REGEXP/:STRING", help_heading = "Rules")]
    pub rewrite_client: Vec<String>,

    /// Server rewrite rules
    #[arg(long, value_name = "/REGEXP/:STRING", help_heading = "Rules")]
    pub rewrite_server: Vec<String>,

    /// Ignore rules
    #[arg(short = 'i', long, value_name = "/REGEXP/", help_heading = "Rules")]
    pub ignore: Vec<String>,

    /// Client ignore rules
    #[arg(long, value_name = "/REGEXP/", help_heading = "Rules")]
    pub ignore_client: Vec<String>,

    /// Server ignore rules
    #[arg(long, value_name = "/REGEXP/", help_heading = "Rules")]
    pub ignore_server: Vec<String>,

    /// Close rules
    #[arg(short = 'C', long, value_name = "/REGEXP/", help_heading = "Rules")]
    pub close: Vec<String>,

    /// Client close rules
    #[arg(long, value_name = "/REGEXP/", help_heading = "Rules")]
    pub close_client: Vec<String>,

    /// Server close rules
    #[arg(long, value_name = "/REGEXP/", help_heading = "Rules")]
    pub close_server: Vec<String>,

    /// Reset rules
    #[arg(short = 'R', long, value_name = "/REGEXP/", help_heading = "Rules")]
    pub reset: Vec<String>,

    /// Client reset rules
    #[arg(long, value_name = "/REGEXP/", help_heading = "Rules")]
    pub reset_client: Vec<String>,

    /// Server reset rules
    #[arg(long, value_name = "/REGEXP/", help_heading = "Rules")]
    pub reset_server: Vec<String>,

    // ==================== TLS ====================
    /// TLS certificate presented to clients (PEM); self-signed when omitted
    #[arg(long, env = "INTERCEPT_PROXY_CERT", help_heading = "TLS")]
    pub cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, env = "INTERCEPT_PROXY_KEY", help_heading = "TLS")]
    pub key: Option<PathBuf>,

    /// SNI sent to the upstream (default: upstream host)
    #[arg(long, env = "INTERCEPT_PROXY_UPSTREAM_SNI", help_heading = "TLS")]
    pub upstream_sni: Option<String>,

    // ==================== Performance Tuning ====================
    /// Buffer size for data transfer in bytes (default: 16KB)
    #[arg(long, env = "INTERCEPT_PROXY_BUFFER_SIZE", default_value_t = DEFAULT_BUFFER_SIZE, help_heading = "Performance")]
    pub buffer_size: usize,

    /// TCP listen backlog for pending connections (default: 1024)
    #[arg(
        long,
        env = "INTERCEPT_PROXY_TCP_BACKLOG",
        default_value_t = 1024,
        help_heading = "Performance"
    )]
    pub tcp_backlog: i32,

    /// Enable TCP_NODELAY for lower latency (default: true)
    #[arg(
        long,
        env = "INTERCEPT_PROXY_TCP_NODELAY",
        default_value_t = true,
        action = ArgAction::Set,
        help_heading = "Performance"
    )]
    pub tcp_nodelay: bool,

    /// Maximum concurrent TCP/TLS sessions, 0 = unlimited
    #[arg(
        long,
        env = "INTERCEPT_PROXY_MAX_CONNECTIONS",
        default_value_t = 0,
        help_heading = "Performance"
    )]
    pub max_connections: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "INTERCEPT_PROXY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// The host and/or port to listen on
    #[arg(value_name = "[PROXY_HOST:]PROXY_PORT")]
    pub proxy: Option<String>,

    /// The upstream server to proxy data to
    #[arg(value_name = "UPSTREAM_HOST:UPSTREAM_PORT")]
    pub upstream: Option<String>,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the CLI arguments
    pub fn validate(&self) -> Result<()> {
        self.listen_endpoint()?;
        self.upstream_endpoint()?;

        if self.buffer_size == 0 {
            return Err(anyhow!("buffer_size must be greater than 0"));
        }
        if self.tcp_backlog <= 0 {
            return Err(anyhow!("tcp_backlog must be greater than 0"));
        }

        match (&self.cert, &self.key) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(anyhow!("--cert and --key must be given together"));
            }
            _ => {}
        }
        for path in [&self.cert, &self.key].into_iter().flatten() {
            if !path.exists() {
                return Err(anyhow!("TLS file not found: {}", path.display()));
            }
        }
        if (self.cert.is_some() || self.upstream_sni.is_some()) && !self.ssl {
            return Err(anyhow!("TLS options require --ssl"));
        }

        Ok(())
    }

    /// Selected wire protocol, TCP unless `--ssl` or `--udp` is given
    pub fn protocol(&self) -> Protocol {
        if self.ssl {
            Protocol::Tls
        } else if self.udp {
            Protocol::Udp
        } else {
            Protocol::Tcp
        }
    }

    /// The positional naming the listen endpoint, if any.
    ///
    /// A lone positional names the upstream unless `--server` already does.
    fn proxy_arg(&self) -> Option<&str> {
        match (&self.proxy, &self.upstream) {
            (Some(proxy), Some(_)) => Some(proxy),
            (Some(proxy), None) if self.server.is_some() => Some(proxy),
            _ => None,
        }
    }

    fn upstream_arg(&self) -> Option<&str> {
        match (&self.proxy, &self.upstream) {
            (_, Some(upstream)) => Some(upstream),
            (Some(upstream), None) if self.server.is_none() => Some(upstream),
            _ => None,
        }
    }

    /// Listen endpoint from the PROXY positional and `--host`/`--port`
    pub fn listen_endpoint(&self) -> Result<Endpoint> {
        let base = match self.proxy_arg() {
            Some(proxy) => Some(Endpoint::parse_listen(proxy)?),
            None => None,
        };
        let port = self
            .port
            .or(base.as_ref().map(Endpoint::port))
            .ok_or_else(|| anyhow!("missing proxy port ([PROXY_HOST:]PROXY_PORT or --port)"))?;
        if port == 0 {
            return Err(anyhow!("proxy port must be greater than 0"));
        }
        let host = self
            .host
            .clone()
            .or_else(|| base.as_ref().and_then(|e| e.host().map(str::to_string)));
        Ok(Endpoint::new(host, port))
    }

    /// Upstream endpoint from `--server` or the UPSTREAM positional
    pub fn upstream_endpoint(&self) -> Result<Endpoint> {
        if let Some(server) = &self.server {
            let default_port = self.listen_endpoint()?.port();
            return Ok(Endpoint::parse_host_with_default_port(
                server,
                default_port,
            )?);
        }
        let upstream = self
            .upstream_arg()
            .ok_or_else(|| anyhow!("missing upstream (UPSTREAM_HOST:UPSTREAM_PORT or --server)"))?;
        Ok(Endpoint::parse_upstream(upstream)?)
    }

    /// Build the rule set.
    ///
    /// Client rules go first, then server rules, then bidirectional ones;
    /// within a scope reset, close, ignore and rewrite are kept apart.
    pub fn rule_set(&self) -> Result<RuleSet> {
        let mut builder = RuleSet::builder();
        for (scope, resets, closes, ignores, rewrites) in [
            (
                Scope::Client,
                &self.reset_client,
                &self.close_client,
                &self.ignore_client,
                &self.rewrite_client,
            ),
            (
                Scope::Server,
                &self.reset_server,
                &self.close_server,
                &self.ignore_server,
                &self.rewrite_server,
            ),
            (
                Scope::Both,
                &self.reset,
                &self.close,
                &self.ignore,
                &self.rewrite,
            ),
        ] {
            for pattern in resets {
                builder = builder.reset(scope, pattern)?;
            }
            for pattern in closes {
                builder = builder.close(scope, pattern)?;
            }
            for pattern in ignores {
                builder = builder.ignore(scope, pattern)?;
            }
            for spec in rewrites {
                builder = builder.rewrite_spec(scope, spec)?;
            }
        }
        Ok(builder.build())
    }

    /// Runtime configuration for the server
    pub fn proxy_config(&self) -> Result<ProxyConfig> {
        Ok(ProxyConfig {
            protocol: self.protocol(),
            listen: self.listen_endpoint()?,
            upstream: self.upstream_endpoint()?,
            conn: ConnConfig::from_cli(self),
            tls: TlsSettings {
                cert: self.cert.clone(),
                key: self.key.clone(),
                upstream_sni: self.upstream_sni.clone(),
            },
        })
    }
}

/// Connection performance configuration
#[derive(Debug, Clone, Copy)]
pub struct ConnConfig {
    /// Read buffer per direction
    pub buffer_size: usize,
    /// TCP listen backlog
    pub tcp_backlog: i32,
    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,
    /// Concurrent stream sessions, 0 = unlimited
    pub max_connections: usize,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            tcp_backlog: 1024,
            tcp_nodelay: true,
            max_connections: 0,
        }
    }
}

impl ConnConfig {
    /// Create from CLI args
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self {
            buffer_size: cli.buffer_size,
            tcp_backlog: cli.tcp_backlog,
            tcp_nodelay: cli.tcp_nodelay,
            max_connections: cli.max_connections,
        }
    }
}

/// TLS material for the `Tls` protocol
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    /// SNI override for the upstream handshake
    pub upstream_sni: Option<String>,
}

/// Runtime server configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub protocol: Protocol,
    pub listen: Endpoint,
    pub upstream: Endpoint,
    pub conn: ConnConfig,
    pub tls: TlsSettings,
}

impl ProxyConfig {
    pub fn new(protocol: Protocol, listen: Endpoint, upstream: Endpoint) -> Self {
        Self {
            protocol,
            listen,
            upstream,
            conn: ConnConfig::default(),
            tls: TlsSettings::default(),
        }
    }
}
