//! Transport layer abstraction
//!
//! Provides a unified interface for the wire variants:
//! - TCP (plain byte stream)
//! - TLS (TCP + TLS, terminated on both legs)
//! - UDP (datagrams, driven by `core::udp`)

pub mod tls;

pub use tls::TlsBinding;

use async_trait::async_trait;
use socket2::SockRef;
use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::address::Endpoint;
use crate::error::{ProxyError, Result};
use crate::logger::log;

/// Unified transport stream trait combining AsyncRead + AsyncWrite + Send + Unpin
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Unified transport stream type
pub type TransportStream = Pin<Box<dyn AsyncStream>>;

/// TCP keepalive interval for accepted and upstream sockets.
/// Dead peers are detected in ~45s (3 probes x 15s).
const TCP_KEEPALIVE_SECS: u64 = 15;

/// Wire protocol selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Tls,
}

impl Protocol {
    /// Connection-oriented protocols get one session per accepted peer
    pub fn is_stream(&self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Tls)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Tls => write!(f, "tls"),
        }
    }
}

impl FromStr for Protocol {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "tls" | "ssl" => Ok(Protocol::Tls),
            other => Err(ProxyError::Config(format!("unknown protocol '{}'", other))),
        }
    }
}

/// Duplicate handle on a TCP socket, used to force an RST on release
#[derive(Debug, Default)]
pub struct AbortHandle(Option<socket2::Socket>);

impl AbortHandle {
    /// Capture a handle on `stream`'s socket
    pub fn for_tcp(stream: &TcpStream) -> Self {
        Self(SockRef::from(stream).try_clone().ok())
    }

    /// Arm `SO_LINGER=0` so that releasing the socket resets the connection
    pub fn abort(&self) {
        if let Some(socket) = &self.0 {
            if let Err(e) = socket.set_linger(Some(Duration::ZERO)) {
                log::debug!(error = %e, "Failed to set SO_LINGER");
            }
        }
    }
}

/// One side of a session: an opaque byte stream plus its address
pub struct Peer {
    pub stream: TransportStream,
    pub addr: SocketAddr,
    abort: AbortHandle,
}

impl Peer {
    pub fn new(stream: TransportStream, addr: SocketAddr) -> Self {
        Self {
            stream,
            addr,
            abort: AbortHandle::default(),
        }
    }

    pub fn with_abort_handle(mut self, abort: AbortHandle) -> Self {
        self.abort = abort;
        self
    }

    pub fn into_parts(self) -> (TransportStream, AbortHandle) {
        (self.stream, self.abort)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer").field("addr", &self.addr).finish()
    }
}

/// Connection-oriented transport: accept a peer, open an upstream channel.
///
/// Chunks are then exchanged over the returned `TransportStream`s.
#[async_trait]
pub trait StreamBinding: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Turn an accepted TCP connection into a session peer
    async fn accept(&self, stream: TcpStream, addr: SocketAddr) -> Result<Peer>;

    /// Open the upstream channel
    async fn connect(&self, upstream: &Endpoint) -> Result<Peer>;
}

/// Plain TCP
#[derive(Debug, Clone, Copy)]
pub struct TcpBinding {
    nodelay: bool,
}

impl TcpBinding {
    pub fn new(nodelay: bool) -> Self {
        Self { nodelay }
    }

    /// Apply socket options shared by both legs
    pub(crate) fn configure(&self, stream: &TcpStream) {
        if self.nodelay {
            let _ = stream.set_nodelay(true);
        }
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(TCP_KEEPALIVE_SECS))
            .with_interval(Duration::from_secs(TCP_KEEPALIVE_SECS));
        let _ = SockRef::from(stream).set_tcp_keepalive(&keepalive);
    }

    /// Resolve and connect to `upstream`
    pub(crate) async fn connect_tcp(&self, upstream: &Endpoint) -> Result<(TcpStream, SocketAddr)> {
        let unreachable = |source| ProxyError::UpstreamUnreachable {
            addr: upstream.to_string(),
            source,
        };
        let addr = upstream.resolve().await.map_err(unreachable)?;
        let stream = TcpStream::connect(addr).await.map_err(unreachable)?;
        self.configure(&stream);
        Ok((stream, addr))
    }
}

#[async_trait]
impl StreamBinding for TcpBinding {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    async fn accept(&self, stream: TcpStream, addr: SocketAddr) -> Result<Peer> {
        self.configure(&stream);
        let abort = AbortHandle::for_tcp(&stream);
        Ok(Peer::new(Box::pin(stream), addr).with_abort_handle(abort))
    }

    async fn connect(&self, upstream: &Endpoint) -> Result<Peer> {
        let (stream, addr) = self.connect_tcp(upstream).await?;
        let abort = AbortHandle::for_tcp(&stream);
        Ok(Peer::new(Box::pin(stream), addr).with_abort_handle(abort))
    }
}
