//! Proxy session
//!
//! One client/upstream pairing. The session walks
//! `Connecting -> Relaying -> {Closing | Resetting} -> Closed`, firing the
//! lifecycle hooks at the boundaries and passing every chunk through the
//! rule engine before it is forwarded.

use bytes::BytesMut;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::connection::SessionId;
use super::engine::{Disposition, RuleEngine};
use super::hooks::{ChunkSink, HookEvent, HookRegistry, NullSink, SessionInfo};
use super::rules::Direction;
use crate::address::Endpoint;
use crate::error::{ProxyError, Result};
use crate::logger::log;
use crate::transport::{Peer, StreamBinding};

/// Default read buffer for stream sessions
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Shared, read-only collaborators of every session on one server
pub struct SessionContext {
    pub engine: RuleEngine,
    pub hooks: Arc<HookRegistry>,
    pub sink: Arc<dyn ChunkSink>,
    pub buffer_size: usize,
}

impl SessionContext {
    pub fn new(engine: RuleEngine, hooks: Arc<HookRegistry>, sink: Arc<dyn ChunkSink>) -> Self {
        Self {
            engine,
            hooks,
            sink,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new(
            RuleEngine::default(),
            Arc::new(HookRegistry::new()),
            Arc::new(NullSink),
        )
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Relaying,
    Closing,
    Resetting,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Relaying => "relaying",
            SessionState::Closing => "closing",
            SessionState::Resetting => "resetting",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Both directions reached end of stream (or failed)
    EndOfStream,
    /// A close rule matched
    CloseRequested,
    /// A reset rule matched
    Reset,
    /// The server asked the session to stop
    Stopped,
}

/// Result of a finished session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOutcome {
    pub termination: Termination,
    /// Bytes forwarded client -> upstream
    pub client_to_upstream: u64,
    /// Bytes forwarded upstream -> client
    pub upstream_to_client: u64,
}

/// State machine shared by stream and datagram sessions.
///
/// Hooks fire on the transitions; the terminal transition happens once.
/// Either pump of a stream session may move the state to `Closing` while
/// the other is still relaying.
pub(crate) struct Lifecycle {
    info: SessionInfo,
    ctx: Arc<SessionContext>,
    state: Mutex<SessionState>,
}

impl Lifecycle {
    pub(crate) fn new(info: SessionInfo, ctx: Arc<SessionContext>) -> Self {
        Self {
            info,
            ctx,
            state: Mutex::new(SessionState::Connecting),
        }
    }

    pub(crate) fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub(crate) fn ctx(&self) -> &SessionContext {
        &self.ctx
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.lock_state()
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` when the current state is one of `from`
    fn transition(&self, from: &[SessionState], next: SessionState) {
        let mut state = self.lock_state();
        let current = *state;
        if !from.contains(&current) {
            return;
        }
        log::debug!(
            session = self.info.id,
            from = %current,
            to = %next,
            "Session state"
        );
        *state = next;
    }

    /// `Connecting -> Relaying`: upstream is open, announce both peers
    pub(crate) fn connected(&mut self) {
        debug_assert_eq!(self.state(), SessionState::Connecting);
        self.ctx.hooks.fire(HookEvent::ServerConnect, &self.info);
        self.ctx.hooks.fire(HookEvent::ClientConnect, &self.info);
        self.transition(&[SessionState::Connecting], SessionState::Relaying);
    }

    /// `Relaying -> Closing`: one direction finished, the other drains
    pub(crate) fn draining(&self) {
        self.transition(&[SessionState::Relaying], SessionState::Closing);
    }

    /// `Relaying | Closing -> Closing | Resetting`
    pub(crate) fn terminating(&mut self, termination: Termination) {
        let next = match termination {
            Termination::Reset => SessionState::Resetting,
            _ => SessionState::Closing,
        };
        self.transition(&[SessionState::Relaying, SessionState::Closing], next);
    }

    /// `Closing | Resetting -> Closed`, firing the disconnect hooks
    pub(crate) fn closed(&mut self) {
        let live = [
            SessionState::Relaying,
            SessionState::Closing,
            SessionState::Resetting,
        ];
        if !live.contains(&self.state()) {
            return;
        }
        self.ctx.hooks.fire(HookEvent::ClientDisconnect, &self.info);
        self.ctx.hooks.fire(HookEvent::ServerDisconnect, &self.info);
        self.transition(&live, SessionState::Closed);
    }

    /// Run one chunk through the rules, reporting terminating decisions
    pub(crate) fn evaluate(&self, chunk: bytes::Bytes, direction: Direction) -> Disposition {
        let disposition = self.ctx.engine.evaluate(chunk, direction);
        if !matches!(disposition, Disposition::Forward(_)) {
            log::rule_action(
                &self.info.client.to_string(),
                direction.tag(),
                disposition.name(),
            );
        }
        disposition
    }

    /// Hand a forwarded chunk to the display sink
    pub(crate) fn display(&self, direction: Direction, data: &[u8]) {
        self.ctx.sink.chunk(&self.info, direction, data);
    }
}

/// Session-wide control signals observed by both pumps
struct Signals {
    reset: CancellationToken,
    close: CancellationToken,
    stop: CancellationToken,
}

/// How one directional pump ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpEnd {
    Eof,
    Failed,
    Close,
    Reset,
    Stop,
}

/// A connection-oriented session (TCP or TLS)
pub struct ProxySession {
    lifecycle: Lifecycle,
    client: Peer,
    upstream: Peer,
    cancel: CancellationToken,
}

impl ProxySession {
    /// Open the upstream channel for `client` and enter `Relaying`.
    ///
    /// On failure no hook fires and the client peer is released.
    pub async fn establish(
        id: SessionId,
        ctx: Arc<SessionContext>,
        client: Peer,
        binding: &dyn StreamBinding,
        upstream: &Endpoint,
        cancel: CancellationToken,
    ) -> Result<Self> {
        log::session(&client.addr.to_string(), "connecting");
        let upstream_peer = binding.connect(upstream).await?;

        let info = SessionInfo {
            id,
            protocol: binding.protocol(),
            client: client.addr,
            upstream: upstream_peer.addr,
        };
        let mut lifecycle = Lifecycle::new(info, ctx);
        lifecycle.connected();

        Ok(Self {
            lifecycle,
            client,
            upstream: upstream_peer,
            cancel,
        })
    }

    pub fn info(&self) -> &SessionInfo {
        self.lifecycle.info()
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.state()
    }

    /// Relay until both directions finish, a rule terminates the session,
    /// or the server stops it.
    pub async fn run(mut self) -> SessionOutcome {
        let (client_stream, client_abort) = self.client.into_parts();
        let (upstream_stream, upstream_abort) = self.upstream.into_parts();
        let (mut client_rd, mut client_wr) = tokio::io::split(client_stream);
        let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream_stream);

        let signals = Signals {
            reset: CancellationToken::new(),
            close: CancellationToken::new(),
            stop: self.cancel.clone(),
        };

        let lifecycle = &self.lifecycle;
        let ((outbound_end, outbound), (inbound_end, inbound)) = tokio::join!(
            pump(
                &mut client_rd,
                &mut upstream_wr,
                Direction::Client,
                lifecycle,
                &signals
            ),
            pump(
                &mut upstream_rd,
                &mut client_wr,
                Direction::Server,
                lifecycle,
                &signals
            ),
        );

        let ends = [outbound_end, inbound_end];
        let termination = if ends.contains(&PumpEnd::Reset) {
            Termination::Reset
        } else if ends.contains(&PumpEnd::Stop) {
            Termination::Stopped
        } else if ends.contains(&PumpEnd::Close) {
            Termination::CloseRequested
        } else {
            Termination::EndOfStream
        };

        self.lifecycle.terminating(termination);
        if termination == Termination::Reset {
            client_abort.abort();
            upstream_abort.abort();
        }
        // Release both peers before announcing the disconnect.
        drop((client_rd, client_wr, upstream_rd, upstream_wr));
        drop((client_abort, upstream_abort));
        self.lifecycle.closed();

        SessionOutcome {
            termination,
            client_to_upstream: outbound,
            upstream_to_client: inbound,
        }
    }
}

/// Copy chunks from `reader` to `writer` through the rule engine.
///
/// Returns how the pump ended and how many bytes it forwarded.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    direction: Direction,
    lifecycle: &Lifecycle,
    signals: &Signals,
) -> (PumpEnd, u64)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let buffer_size = lifecycle.ctx().buffer_size;
    let peer = lifecycle.info().client.to_string();
    let mut buf = BytesMut::with_capacity(buffer_size);
    let mut forwarded: u64 = 0;

    loop {
        buf.reserve(buffer_size);
        let read = tokio::select! {
            biased;
            _ = signals.reset.cancelled() => return (PumpEnd::Reset, forwarded),
            _ = signals.stop.cancelled() => {
                let _ = writer.shutdown().await;
                return (PumpEnd::Stop, forwarded);
            }
            _ = signals.close.cancelled() => {
                let _ = writer.shutdown().await;
                return (PumpEnd::Close, forwarded);
            }
            r = reader.read_buf(&mut buf) => r,
        };

        match read {
            Ok(0) => {
                log::session(&peer, &format!("{} end of stream", direction));
                lifecycle.draining();
                let _ = writer.shutdown().await;
                return (PumpEnd::Eof, forwarded);
            }
            Ok(_) => {}
            Err(e) => {
                report_io_error(&peer, direction, forwarded, e);
                lifecycle.draining();
                let _ = writer.shutdown().await;
                return (PumpEnd::Failed, forwarded);
            }
        }

        let chunk = buf.split().freeze();
        let (data, close) = match lifecycle.evaluate(chunk, direction) {
            Disposition::Forward(data) => (data, false),
            Disposition::CloseGracefully(data) => (data, true),
            Disposition::Drop => continue,
            Disposition::ResetAbruptly => {
                signals.reset.cancel();
                return (PumpEnd::Reset, forwarded);
            }
        };

        let write = async {
            writer.write_all(&data).await?;
            writer.flush().await
        };
        let written = tokio::select! {
            biased;
            _ = signals.reset.cancelled() => return (PumpEnd::Reset, forwarded),
            _ = signals.stop.cancelled() => return (PumpEnd::Stop, forwarded),
            r = write => r,
        };
        if let Err(e) = written {
            report_io_error(&peer, direction, forwarded, e);
            lifecycle.draining();
            return (PumpEnd::Failed, forwarded);
        }
        forwarded += data.len() as u64;
        lifecycle.display(direction, &data);

        if close {
            lifecycle.draining();
            signals.close.cancel();
            let _ = writer.shutdown().await;
            return (PumpEnd::Close, forwarded);
        }
    }
}

/// An IO error ends its direction like end of stream. It only counts as a
/// session failure when nothing was relayed before it.
fn report_io_error(peer: &str, direction: Direction, forwarded: u64, e: std::io::Error) {
    let err = ProxyError::StreamIo(e);
    if forwarded == 0 {
        log::session_error(peer, &err);
    } else {
        log::debug!(peer = %peer, direction = %direction, error = %err, "Stream ended with error");
    }
}
