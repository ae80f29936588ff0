//! UDP relay
//!
//! One listening socket, one session per client address. Each session owns a
//! connected socket to the upstream, so replies map back to their client
//! without any demultiplexing.

use bytes::Bytes;
use dashmap::DashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::connection::{SessionId, SessionRegistry};
use super::engine::Disposition;
use super::hooks::SessionInfo;
use super::rules::Direction;
use super::session::{Lifecycle, SessionContext, SessionOutcome, Termination};
use crate::error::{ProxyError, Result};
use crate::logger::log;
use crate::transport::Protocol;

/// Largest UDP payload
const MAX_DATAGRAM: usize = 64 * 1024;

/// Datagrams queued per session before new ones are dropped
const SESSION_QUEUE_DEPTH: usize = 256;

struct UdpSessionHandle {
    id: SessionId,
    tx: mpsc::Sender<Bytes>,
}

type SessionTable = Arc<DashMap<SocketAddr, UdpSessionHandle>>;

/// Datagram front end of the proxy
pub(crate) struct UdpRelay {
    listener: Arc<UdpSocket>,
    upstream: SocketAddr,
    ctx: Arc<SessionContext>,
    registry: SessionRegistry,
    tracker: TaskTracker,
    sessions: SessionTable,
}

impl UdpRelay {
    pub(crate) fn new(
        listener: UdpSocket,
        upstream: SocketAddr,
        ctx: Arc<SessionContext>,
        registry: SessionRegistry,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            listener: Arc::new(listener),
            upstream,
            ctx,
            registry,
            tracker,
            sessions: Arc::new(DashMap::new()),
        }
    }

    #[cfg(test)]
    pub(crate) fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Receive datagrams until `shutdown` fires.
    ///
    /// Session tasks are spawned on the tracker; the caller waits for them.
    pub(crate) async fn serve(&self, shutdown: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, client) = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = self.listener.recv_from(&mut buf) => match r {
                    Ok(v) => v,
                    Err(e) => {
                        log::debug!(error = %e, "UDP receive failed");
                        continue;
                    }
                },
            };
            self.dispatch(client, Bytes::copy_from_slice(&buf[..n])).await;
        }
        log::debug!(sessions = self.sessions.len(), "UDP relay stopped");
    }

    /// Route a client datagram to its session, creating one if needed
    async fn dispatch(&self, client: SocketAddr, datagram: Bytes) {
        let existing = self.sessions.get(&client).map(|h| h.tx.clone());
        let datagram = match existing {
            Some(tx) => match tx.try_send(datagram) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    log::debug!(peer = %client, "UDP session queue full, dropping datagram");
                    return;
                }
                Err(TrySendError::Closed(datagram)) => {
                    // session ended since the lookup; start over
                    self.sessions
                        .remove_if(&client, |_, h| h.tx.same_channel(&tx));
                    datagram
                }
            },
            None => datagram,
        };

        match self.open_session(client).await {
            Ok(tx) => {
                let _ = tx.try_send(datagram);
            }
            Err(e) => log::session_error(&client.to_string(), &e),
        }
    }

    async fn open_session(&self, client: SocketAddr) -> Result<mpsc::Sender<Bytes>> {
        let upstream_addr = self.upstream;
        let bind_addr: SocketAddr = if upstream_addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket
            .connect(upstream_addr)
            .await
            .map_err(|source| ProxyError::UpstreamUnreachable {
                addr: upstream_addr.to_string(),
                source,
            })?;

        let (id, cancel) = self.registry.register(client, Protocol::Udp);
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        self.sessions.insert(
            client,
            UdpSessionHandle {
                id,
                tx: tx.clone(),
            },
        );

        let info = SessionInfo {
            id,
            protocol: Protocol::Udp,
            client,
            upstream: upstream_addr,
        };
        let session = UdpSession {
            lifecycle: Lifecycle::new(info, Arc::clone(&self.ctx)),
            listener: Arc::clone(&self.listener),
            upstream: socket,
            rx,
            cancel,
        };

        let sessions = Arc::clone(&self.sessions);
        let registry = self.registry.clone();
        self.tracker.spawn(async move {
            let outcome = session.run().await;
            sessions.remove_if(&client, |_, h| h.id == id);
            registry.unregister(id);
            log::debug!(
                session = id,
                peer = %client,
                termination = ?outcome.termination,
                sent = outcome.client_to_upstream,
                received = outcome.upstream_to_client,
                "UDP session finished"
            );
        });

        Ok(tx)
    }
}

/// One client address and its upstream socket
struct UdpSession {
    lifecycle: Lifecycle,
    listener: Arc<UdpSocket>,
    upstream: UdpSocket,
    rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
}

impl UdpSession {
    async fn run(mut self) -> SessionOutcome {
        self.lifecycle.connected();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut outbound: u64 = 0;
        let mut inbound: u64 = 0;

        let termination = loop {
            let (datagram, direction) = tokio::select! {
                _ = self.cancel.cancelled() => break Termination::Stopped,
                msg = self.rx.recv() => match msg {
                    Some(datagram) => (datagram, Direction::Client),
                    None => break Termination::Stopped,
                },
                r = self.upstream.recv(&mut buf) => match r {
                    Ok(n) => (Bytes::copy_from_slice(&buf[..n]), Direction::Server),
                    Err(e) => {
                        // ICMP errors surface here; the session stays up
                        log::debug!(peer = %self.lifecycle.info().client, error = %e, "UDP upstream receive failed");
                        continue;
                    }
                },
            };

            let (data, close) = match self.lifecycle.evaluate(datagram, direction) {
                Disposition::Forward(data) => (data, false),
                Disposition::CloseGracefully(data) => (data, true),
                Disposition::Drop => continue,
                Disposition::ResetAbruptly => break Termination::Reset,
            };

            match self.forward(direction, &data).await {
                Ok(()) => match direction {
                    Direction::Client => outbound += data.len() as u64,
                    Direction::Server => inbound += data.len() as u64,
                },
                Err(e) => {
                    log::debug!(peer = %self.lifecycle.info().client, direction = %direction, error = %e, "UDP send failed");
                }
            }
            if close {
                break Termination::CloseRequested;
            }
        };

        self.lifecycle.terminating(termination);
        // Later datagrams for this client see a closed channel and open a new session.
        self.rx.close();
        self.lifecycle.closed();

        SessionOutcome {
            termination,
            client_to_upstream: outbound,
            upstream_to_client: inbound,
        }
    }

    async fn forward(&self, direction: Direction, data: &Bytes) -> std::io::Result<()> {
        match direction {
            Direction::Client => self.upstream.send(data).await?,
            Direction::Server => {
                self.listener
                    .send_to(data, self.lifecycle.info().client)
                    .await?
            }
        };
        self.lifecycle.display(direction, data);
        Ok(())
    }
}
