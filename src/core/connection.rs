//! Session tracking
//!
//! Tracks live sessions so a stop request can unwind every one of them.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::transport::Protocol;

/// Unique session identifier
pub type SessionId = u64;

#[derive(Debug)]
struct ActiveSession {
    client: SocketAddr,
    protocol: Protocol,
    started_at: Instant,
    cancel_token: CancellationToken,
}

/// Registry of live sessions with cancellation handles
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    next_id: Arc<AtomicU64>,
    sessions: Arc<DashMap<SessionId, ActiveSession>>,
    /// Parent of every session token
    shutdown: CancellationToken,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl SessionRegistry {
    /// Create a registry whose session tokens are children of `shutdown`
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
            sessions: Arc::new(DashMap::new()),
            shutdown,
        }
    }

    /// Register a session and return its ID and cancellation token
    pub fn register(
        &self,
        client: SocketAddr,
        protocol: Protocol,
    ) -> (SessionId, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel_token = self.shutdown.child_token();

        self.sessions.insert(
            id,
            ActiveSession {
                client,
                protocol,
                started_at: Instant::now(),
                cancel_token: cancel_token.clone(),
            },
        );

        (id, cancel_token)
    }

    /// Unregister a session
    pub fn unregister(&self, id: SessionId) {
        if let Some((_, session)) = self.sessions.remove(&id) {
            tracing::debug!(
                session = id,
                client = %session.client,
                protocol = %session.protocol,
                duration_ms = session.started_at.elapsed().as_millis() as u64,
                "Session unregistered"
            );
        }
    }

    /// Cancel every live session, returning how many were signalled
    pub fn stop_all(&self) -> usize {
        let mut stopped = 0;
        for session in self.sessions.iter() {
            session.cancel_token.cancel();
            stopped += 1;
        }
        stopped
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_registry_new() {
        let registry = SessionRegistry::default();
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn test_registry_register_assigns_increasing_ids() {
        let registry = SessionRegistry::default();
        let (id1, _t1) = registry.register(addr(1234), Protocol::Tcp);
        let (id2, _t2) = registry.register(addr(1235), Protocol::Udp);

        assert!(id1 < id2);
        assert_eq!(registry.session_count(), 2);
    }

    #[test]
    fn test_registry_unregister() {
        let registry = SessionRegistry::default();
        let (id, _token) = registry.register(addr(1234), Protocol::Tls);
        registry.unregister(id);
        assert_eq!(registry.session_count(), 0);

        // unregistering twice is harmless
        registry.unregister(id);
    }

    #[test]
    fn test_registry_stop_all() {
        let registry = SessionRegistry::default();
        let (_, t1) = registry.register(addr(1), Protocol::Tcp);
        let (_, t2) = registry.register(addr(2), Protocol::Tcp);

        assert_eq!(registry.stop_all(), 2);
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
    }

    #[test]
    fn test_registry_tokens_follow_shutdown() {
        let shutdown = CancellationToken::new();
        let registry = SessionRegistry::new(shutdown.clone());
        let (_, token) = registry.register(addr(1), Protocol::Udp);

        shutdown.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_registry_concurrent() {
        use std::thread;

        let registry = SessionRegistry::default();
        let handles: Vec<_> = (0..10)
            .map(|i| {
                let r = registry.clone();
                thread::spawn(move || {
                    for j in 0..100 {
                        let (id, _) = r.register(addr((i * 1000 + j) as u16), Protocol::Tcp);
                        thread::yield_now();
                        r.unregister(id);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.session_count(), 0);
    }
}
