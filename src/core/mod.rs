//! Core proxy module
//!
//! This module contains the interception logic:
//! - Rule model and evaluation
//! - Session lifecycle hooks
//! - Stream and datagram sessions
//! - Session tracking and the server loop

mod connection;
pub mod engine;
pub mod hooks;
pub mod rules;
mod server;
pub mod session;
mod udp;

pub use connection::{SessionId, SessionRegistry};
pub use engine::{Disposition, RuleEngine};
pub use hooks::{ChunkSink, HookEvent, HookRegistry, NullSink, SessionInfo};
pub use rules::{Action, Direction, Pattern, RuleSet, RuleSetBuilder, Scope};
pub use server::{BoundProxy, ProxyServer, ProxyServerBuilder};
pub use session::{ProxySession, SessionContext, SessionOutcome, SessionState, Termination};
