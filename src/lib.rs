//! Intercepting relay proxy for TCP, TLS and UDP
//!
//! Architecture:
//! - `core/`: rules, hooks, sessions and the server loop
//! - `transport/`: TCP and TLS bindings
//! - `address`: `[host:]port` endpoint parsing
//! - `display`: console output of relayed traffic
//! - `config`: CLI arguments

pub mod address;
pub mod config;
pub mod core;
pub mod display;
pub mod error;
pub mod logger;
pub mod transport;

pub use address::Endpoint;
pub use crate::core::{HookRegistry, ProxyServer, RuleSet};
pub use error::{ProxyError, Result};
pub use transport::Protocol;
