//! Claude Sandbox - persistent terminal sessions from a sandbox container
//!
//! Bridges shells, SSH sessions and an AI CLI running inside a sandbox
//! container to a browser over WebSockets. Terminal sessions survive client
//! disconnects: output produced while nobody is connected is buffered, and a
//! reconnecting client resumes the same process instead of starting a new one.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Gateway                               │
//! │  /ws ── Connection ── OutputRelay ── SessionStore (buffers)       │
//! │             │               ▲                                    │
//! │             ▼               │ tagged events                      │
//! │        AgentManager ────────┘                                    │
//! │   shell │ ssh-shell │ persistent-shell │ persistent-ssh │ ai-cli │
//! └─────────────┬─────────────────────┬──────────────────────────────┘
//!               │ pty                 │ exec
//! ┌─────────────▼─────────────────────▼──────────────────────────────┐
//! │  Sandbox container: GNU screen sessions (PersistentSessionManager)│
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`gateway`]: WebSocket bridge, output relay and REST diagnostics
//! - [`agent`]: pty-backed agents and the agent registry
//! - [`session`]: logical session buffers and persistent multiplexer sessions
//! - [`container`]: exec transports (docker, ssh, local)
//! - [`state`]: durable work-session log
//! - [`config`]: Configuration management

pub mod agent;
pub mod config;
pub mod container;
pub mod error;
pub mod gateway;
pub mod session;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use config::SandboxConfig;
pub use error::{Error, Result};
