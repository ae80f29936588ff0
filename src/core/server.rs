//! Proxy server
//!
//! `ProxyServer` owns the frozen rules, hooks and display sink, binds the
//! listening socket and drives one session per client.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::connection::SessionRegistry;
use super::engine::RuleEngine;
use super::hooks::{ChunkSink, HookRegistry, NullSink};
use super::rules::RuleSet;
use super::session::{ProxySession, SessionContext};
use super::udp::UdpRelay;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::logger::log;
use crate::transport::{tls, Protocol, StreamBinding, TcpBinding, TlsBinding};

/// Name on the generated certificate when none is configured
const SELF_SIGNED_NAME: &str = "localhost";

/// Intercepting relay between clients and one upstream
pub struct ProxyServer {
    config: ProxyConfig,
    ctx: Arc<SessionContext>,
    registry: SessionRegistry,
    shutdown: CancellationToken,
}

impl ProxyServer {
    /// Create a new server builder
    pub fn builder(config: ProxyConfig) -> ProxyServerBuilder {
        ProxyServerBuilder::new(config)
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Number of sessions currently relaying
    pub fn active_sessions(&self) -> usize {
        self.registry.session_count()
    }

    /// Bind the listening socket.
    ///
    /// Bind and certificate failures are fatal and returned here, before
    /// any client is served.
    pub async fn bind(self: &Arc<Self>) -> Result<BoundProxy> {
        let listener = match self.config.protocol {
            Protocol::Tcp => {
                let binding = TcpBinding::new(self.config.conn.tcp_nodelay);
                Listener::Stream {
                    listener: self.bind_tcp().await?,
                    binding: Arc::new(binding),
                }
            }
            Protocol::Tls => {
                let binding = self.tls_binding()?;
                Listener::Stream {
                    listener: self.bind_tcp().await?,
                    binding: Arc::new(binding),
                }
            }
            Protocol::Udp => {
                let addr = self.listen_addr().await?;
                let socket = UdpSocket::bind(addr).await.map_err(|source| ProxyError::Bind {
                    addr: addr.to_string(),
                    source,
                })?;
                // the receive loop never resolves names
                let upstream = self.config.upstream.resolve().await.map_err(|e| {
                    ProxyError::InvalidEndpoint(format!("{}: {}", self.config.upstream, e))
                })?;
                Listener::Datagram { socket, upstream }
            }
        };

        Ok(BoundProxy {
            server: Arc::clone(self),
            listener,
        })
    }

    /// Bind and serve until `request_stop`
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let bound = self.bind().await?;
        log::info!(
            address = %bound.local_addr()?,
            protocol = %self.config.protocol,
            upstream = %self.config.upstream,
            "Listening on {} ...",
            self.config.listen
        );
        bound.serve().await
    }

    /// Stop accepting and unwind every live session.
    ///
    /// Safe to call more than once.
    pub fn request_stop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let stopped = self.registry.stop_all();
        log::info!(sessions = stopped, "Stop requested");
    }

    async fn listen_addr(&self) -> Result<SocketAddr> {
        self.config
            .listen
            .resolve()
            .await
            .map_err(|e| ProxyError::InvalidEndpoint(format!("{}: {}", self.config.listen, e)))
    }

    /// Bind TCP listener with SO_REUSEADDR for fast restarts
    async fn bind_tcp(&self) -> Result<TcpListener> {
        let addr = self.listen_addr().await?;
        let bind_err = |source| ProxyError::Bind {
            addr: addr.to_string(),
            source,
        };
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )
        .map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;
        socket.bind(&addr.into()).map_err(bind_err)?;
        socket
            .listen(self.config.conn.tcp_backlog)
            .map_err(bind_err)?;
        TcpListener::from_std(socket.into()).map_err(bind_err)
    }

    fn tls_binding(&self) -> Result<TlsBinding> {
        let tls_settings = &self.config.tls;
        let server_config = match (&tls_settings.cert, &tls_settings.key) {
            (Some(cert), Some(key)) => tls::load_server_config(cert, key)?,
            (None, None) => {
                log::info!(name = SELF_SIGNED_NAME, "Using a generated self-signed certificate");
                tls::self_signed_server_config(&[SELF_SIGNED_NAME])?
            }
            _ => {
                return Err(ProxyError::Tls(
                    "certificate and key must be given together".to_string(),
                ))
            }
        };
        TlsBinding::new(
            TcpBinding::new(self.config.conn.tcp_nodelay),
            server_config,
            tls::insecure_client_config()?,
            tls_settings.upstream_sni.as_deref(),
        )
    }
}

enum Listener {
    Stream {
        listener: TcpListener,
        binding: Arc<dyn StreamBinding>,
    },
    Datagram {
        socket: UdpSocket,
        upstream: SocketAddr,
    },
}

/// A server whose socket is bound but not yet serving
pub struct BoundProxy {
    server: Arc<ProxyServer>,
    listener: Listener,
}

impl BoundProxy {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let addr = match &self.listener {
            Listener::Stream { listener, .. } => listener.local_addr()?,
            Listener::Datagram { socket, .. } => socket.local_addr()?,
        };
        Ok(addr)
    }

    /// Serve clients until the server is asked to stop, then wait for
    /// every session to finish.
    pub async fn serve(self) -> Result<()> {
        let server = self.server;
        let tracker = TaskTracker::new();

        match self.listener {
            Listener::Stream { listener, binding } => {
                accept_loop(&server, listener, binding, &tracker).await;
            }
            Listener::Datagram { socket, upstream } => {
                let relay = UdpRelay::new(
                    socket,
                    upstream,
                    Arc::clone(&server.ctx),
                    server.registry.clone(),
                    tracker.clone(),
                );
                relay.serve(server.shutdown.clone()).await;
            }
        }

        tracker.close();
        tracker.wait().await;
        log::info!("Server stopped");
        Ok(())
    }
}

/// Run the accept loop
async fn accept_loop(
    server: &Arc<ProxyServer>,
    listener: TcpListener,
    binding: Arc<dyn StreamBinding>,
    tracker: &TaskTracker,
) {
    // Connection limiter: 0 = unlimited
    let conn_limiter = if server.config.conn.max_connections > 0 {
        Some(Arc::new(Semaphore::new(server.config.conn.max_connections)))
    } else {
        None
    };

    loop {
        // Acquire connection permit (backpressure when at limit)
        let permit = match &conn_limiter {
            Some(limiter) => {
                let acquired = tokio::select! {
                    _ = server.shutdown.cancelled() => break,
                    p = Arc::clone(limiter).acquire_owned() => p,
                };
                match acquired {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                }
            }
            None => None,
        };

        let accepted = tokio::select! {
            _ = server.shutdown.cancelled() => break,
            r = listener.accept() => r,
        };

        match accepted {
            Ok((stream, addr)) => {
                let (id, cancel) = server.registry.register(addr, binding.protocol());
                let server = Arc::clone(server);
                let binding = Arc::clone(&binding);

                tracker.spawn(async move {
                    // Hold permit for the lifetime of this session
                    let _permit = permit;
                    let registry = server.registry.clone();
                    let _guard = scopeguard::guard((), move |_| registry.unregister(id));
                    let peer = addr.to_string();

                    let client = tokio::select! {
                        _ = cancel.cancelled() => return,
                        r = binding.accept(stream, addr) => r,
                    };
                    let client = match client {
                        Ok(client) => client,
                        Err(e) => {
                            log::debug!(peer = %peer, error = %e, "Client handshake failed");
                            return;
                        }
                    };

                    let established = tokio::select! {
                        _ = cancel.cancelled() => return,
                        r = ProxySession::establish(
                            id,
                            Arc::clone(&server.ctx),
                            client,
                            binding.as_ref(),
                            &server.config.upstream,
                            cancel.clone(),
                        ) => r,
                    };
                    match established {
                        Ok(session) => {
                            let outcome = session.run().await;
                            log::debug!(
                                session = id,
                                peer = %peer,
                                termination = ?outcome.termination,
                                sent = outcome.client_to_upstream,
                                received = outcome.upstream_to_client,
                                "Session finished"
                            );
                        }
                        Err(e) => log::session_error(&peer, &e),
                    }
                });
            }
            Err(e) => {
                log::error!(error = %e, "Failed to accept connection");
            }
        }
    }
    log::debug!("Accept loop stopped");
}

/// Builder for constructing a ProxyServer
pub struct ProxyServerBuilder {
    config: ProxyConfig,
    rules: RuleSet,
    hooks: HookRegistry,
    sink: Option<Arc<dyn ChunkSink>>,
}

impl ProxyServerBuilder {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            rules: RuleSet::new(),
            hooks: HookRegistry::new(),
            sink: None,
        }
    }

    /// Set the rules; frozen once the server is built
    pub fn rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    pub fn hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    /// Set the display sink
    pub fn sink(mut self, sink: Arc<dyn ChunkSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Arc<ProxyServer> {
        let ctx = SessionContext::new(
            RuleEngine::new(Arc::new(self.rules)),
            Arc::new(self.hooks),
            self.sink.unwrap_or_else(|| Arc::new(NullSink)),
        )
        .with_buffer_size(self.config.conn.buffer_size);
        let shutdown = CancellationToken::new();

        Arc::new(ProxyServer {
            config: self.config,
            ctx: Arc::new(ctx),
            registry: SessionRegistry::new(shutdown.clone()),
            shutdown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Endpoint;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    fn config(protocol: Protocol, upstream: &str) -> ProxyConfig {
        ProxyConfig::new(
            protocol,
            Endpoint::parse_listen("127.0.0.1:0").unwrap(),
            Endpoint::parse_upstream(upstream).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_bind_in_use_is_fatal() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let mut cfg = config(Protocol::Tcp, "127.0.0.1:9");
        cfg.listen = Endpoint::parse_listen(&format!("127.0.0.1:{}", port)).unwrap();

        let server = ProxyServer::builder(cfg).build();
        let err = server.bind().await.err().unwrap();
        assert!(matches!(err, ProxyError::Bind { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_tls_requires_cert_and_key_together() {
        let mut cfg = config(Protocol::Tls, "127.0.0.1:9");
        cfg.tls.cert = Some("/tmp/cert.pem".into());

        let server = ProxyServer::builder(cfg).build();
        let err = server.bind().await.err().unwrap();
        assert!(matches!(err, ProxyError::Tls(_)));
    }

    #[tokio::test]
    async fn test_udp_upstream_resolved_at_bind() {
        let server = ProxyServer::builder(config(Protocol::Udp, "upstream.invalid:53")).build();
        let err = server.bind().await.err().unwrap();
        assert!(matches!(err, ProxyError::InvalidEndpoint(_)));
        assert!(err.is_fatal());

        let server = ProxyServer::builder(config(Protocol::Udp, "127.0.0.1:53")).build();
        let bound = server.bind().await.unwrap();
        assert_ne!(bound.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_leaves_server_running() {
        let dead_port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let server = ProxyServer::builder(config(
            Protocol::Tcp,
            &format!("127.0.0.1:{}", dead_port),
        ))
        .build();
        let bound = server.bind().await.unwrap();
        let addr = bound.local_addr().unwrap();
        let task = tokio::spawn(bound.serve());

        for _ in 0..2 {
            let mut client = TcpStream::connect(addr).await.unwrap();
            let mut buf = [0u8; 1];
            let n = timeout(Duration::from_secs(2), client.read(&mut buf))
                .await
                .unwrap()
                .unwrap_or(0);
            assert_eq!(n, 0);
        }

        server.request_stop();
        timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_request_stop_unwinds_sessions() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = upstream.accept().await.unwrap();
            let mut buf = [0u8; 64];
            while let Ok(n) = s.read(&mut buf).await {
                if n == 0 || s.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        });

        let server = ProxyServer::builder(config(Protocol::Tcp, &upstream_addr.to_string())).build();
        let bound = server.bind().await.unwrap();
        let addr = bound.local_addr().unwrap();
        let task = tokio::spawn(bound.serve());

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(server.active_sessions(), 1);

        server.request_stop();
        server.request_stop();
        timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(server.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_max_connections_applies_backpressure() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let opened = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&opened);
        tokio::spawn(async move {
            while let Ok((mut s, _)) = upstream.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut sink = Vec::new();
                    let _ = s.read_to_end(&mut sink).await;
                });
            }
        });

        let mut cfg = config(Protocol::Tcp, &upstream_addr.to_string());
        cfg.conn.max_connections = 1;
        let server = ProxyServer::builder(cfg).build();
        let bound = server.bind().await.unwrap();
        let addr = bound.local_addr().unwrap();
        let task = tokio::spawn(bound.serve());

        let first = TcpStream::connect(addr).await.unwrap();
        // the second connect lands in the backlog but gets no session
        let _second = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(server.active_sessions(), 1);
        assert_eq!(opened.load(Ordering::SeqCst), 1);

        drop(first);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(opened.load(Ordering::SeqCst), 2);
        assert_eq!(server.active_sessions(), 1);

        server.request_stop();
        timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
