//! Hook registry and display sink
//!
//! Lifecycle callbacks observe session boundaries; the chunk sink observes
//! forwarded data. Neither can alter the flow of a session.

use std::fmt;
use std::net::SocketAddr;

use super::connection::SessionId;
use super::rules::Direction;
use crate::transport::Protocol;

/// Identity of one session as seen by hooks and sinks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub protocol: Protocol,
    pub client: SocketAddr,
    pub upstream: SocketAddr,
}

/// Lifecycle events, one callback list each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    ClientConnect,
    ClientDisconnect,
    ServerConnect,
    ServerDisconnect,
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HookEvent::ClientConnect => "client_connect",
            HookEvent::ClientDisconnect => "client_disconnect",
            HookEvent::ServerConnect => "server_connect",
            HookEvent::ServerDisconnect => "server_disconnect",
        };
        f.write_str(name)
    }
}

/// Lifecycle callback
pub type Hook = Box<dyn Fn(&SessionInfo) + Send + Sync>;

/// Ordered lifecycle callbacks, fixed once the server starts
#[derive(Default)]
pub struct HookRegistry {
    client_connect: Vec<Hook>,
    client_disconnect: Vec<Hook>,
    server_connect: Vec<Hook>,
    server_disconnect: Vec<Hook>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_client_connect(&mut self, hook: impl Fn(&SessionInfo) + Send + Sync + 'static) {
        self.client_connect.push(Box::new(hook));
    }

    pub fn on_client_disconnect(
        &mut self,
        hook: impl Fn(&SessionInfo) + Send + Sync + 'static,
    ) {
        self.client_disconnect.push(Box::new(hook));
    }

    pub fn on_server_connect(&mut self, hook: impl Fn(&SessionInfo) + Send + Sync + 'static) {
        self.server_connect.push(Box::new(hook));
    }

    pub fn on_server_disconnect(
        &mut self,
        hook: impl Fn(&SessionInfo) + Send + Sync + 'static,
    ) {
        self.server_disconnect.push(Box::new(hook));
    }

    fn hooks(&self, event: HookEvent) -> &[Hook] {
        match event {
            HookEvent::ClientConnect => &self.client_connect,
            HookEvent::ClientDisconnect => &self.client_disconnect,
            HookEvent::ServerConnect => &self.server_connect,
            HookEvent::ServerDisconnect => &self.server_disconnect,
        }
    }

    /// Invoke every callback for `event` in registration order
    pub fn fire(&self, event: HookEvent, info: &SessionInfo) {
        for hook in self.hooks(event) {
            hook(info);
        }
    }

    pub fn len(&self, event: HookEvent) -> usize {
        self.hooks(event).len()
    }

    pub fn is_empty(&self) -> bool {
        self.client_connect.is_empty()
            && self.client_disconnect.is_empty()
            && self.server_connect.is_empty()
            && self.server_disconnect.is_empty()
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("client_connect", &self.client_connect.len())
            .field("client_disconnect", &self.client_disconnect.len())
            .field("server_connect", &self.server_connect.len())
            .field("server_disconnect", &self.server_disconnect.len())
            .finish()
    }
}

/// Receives every forwarded chunk after the rule decision.
///
/// Dropped chunks never reach the sink.
pub trait ChunkSink: Send + Sync {
    fn chunk(&self, info: &SessionInfo, direction: Direction, data: &[u8]);
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ChunkSink for NullSink {
    fn chunk(&self, _info: &SessionInfo, _direction: Direction, _data: &[u8]) {}
}
