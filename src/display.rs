//! Console output
//!
//! Prints a direction header for every forwarded chunk followed by the data,
//! either raw or as a hexdump, plus the connect/disconnect lines for stream
//! sessions.

use std::fmt::Write as _;
use std::net::SocketAddr;

use crate::core::hooks::{ChunkSink, HookRegistry, SessionInfo};
use crate::core::rules::Direction;
use crate::logger::log;

/// How chunk payloads are printed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayMode {
    #[default]
    Raw,
    Hexdump,
}

/// Header for data or events heading to the upstream
fn outgoing(client: SocketAddr, proxy: &str, event: &str) -> String {
    format!("{} -> {} {}", client, proxy, event).trim_end().to_string()
}

/// Header for data or events heading back to the client
fn incoming(client: SocketAddr, proxy: &str, event: &str) -> String {
    format!("{} <- {} {}", client, proxy, event).trim_end().to_string()
}

/// Sink that prints every forwarded chunk to stdout
#[derive(Debug, Clone)]
pub struct ConsoleSink {
    mode: DisplayMode,
    proxy_label: String,
}

impl ConsoleSink {
    pub fn new(mode: DisplayMode, proxy_label: impl Into<String>) -> Self {
        Self {
            mode,
            proxy_label: proxy_label.into(),
        }
    }

    /// Direction header for a chunk
    pub fn header(&self, info: &SessionInfo, direction: Direction) -> String {
        match direction {
            Direction::Client => outgoing(info.client, &self.proxy_label, ""),
            Direction::Server => incoming(info.client, &self.proxy_label, ""),
        }
    }

    /// Payload as printed: raw bytes with a trailing newline, or a hexdump
    pub fn render(&self, data: &[u8]) -> Vec<u8> {
        match self.mode {
            DisplayMode::Raw => {
                let mut out = data.to_vec();
                if !out.ends_with(b"\n") {
                    out.push(b'\n');
                }
                out
            }
            DisplayMode::Hexdump => hexdump(data).into_bytes(),
        }
    }

    /// Write the header line and the rendered payload as one record
    pub fn write_chunk<W: std::io::Write>(
        &self,
        out: &mut W,
        info: &SessionInfo,
        direction: Direction,
        data: &[u8],
    ) -> std::io::Result<()> {
        writeln!(out, "{}", self.header(info, direction))?;
        out.write_all(&self.render(data))?;
        out.flush()
    }
}

impl ChunkSink for ConsoleSink {
    fn chunk(&self, info: &SessionInfo, direction: Direction, data: &[u8]) {
        // header and body under one lock
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = self.write_chunk(&mut stdout, info, direction, data) {
            log::debug!(error = %e, "Failed to write chunk to stdout");
        }
    }
}

/// Connect/disconnect lines for stream sessions
pub fn lifecycle_hooks(proxy_label: &str) -> HookRegistry {
    let mut hooks = HookRegistry::new();

    let label = proxy_label.to_string();
    hooks.on_client_connect(move |info| {
        log::info!("{}", outgoing(info.client, &label, "[connecting]"));
    });
    let label = proxy_label.to_string();
    hooks.on_client_disconnect(move |info| {
        log::info!("{}", outgoing(info.client, &label, "[disconnecting]"));
    });
    let label = proxy_label.to_string();
    hooks.on_server_connect(move |info| {
        log::info!("{}", incoming(info.client, &label, "[connected]"));
    });
    let label = proxy_label.to_string();
    hooks.on_server_disconnect(move |info| {
        log::info!("{}", incoming(info.client, &label, "[disconnected]"));
    });

    hooks
}

/// Canonical hex+ASCII dump, 16 bytes per row
pub fn hexdump(data: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:08x} ", row * 16);
        for i in 0..16 {
            if i == 8 {
                out.push(' ');
            }
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, " {:02x}", b);
                }
                None => out.push_str("   "),
            }
        }
        out.push_str("  |");
        for &b in chunk {
            out.push(if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            });
        }
        out.push_str("|\n");
    }
    let _ = writeln!(out, "{:08x}", data.len());
    out
}
