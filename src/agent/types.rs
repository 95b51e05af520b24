//! Agent types and the common agent contract

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

// =============================================================================
// Kinds and status
// =============================================================================

/// Built-in agent kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    /// Local shell on this host
    Shell,
    /// Shell over SSH into the sandbox
    SshShell,
    /// Shell inside a persistent multiplexer session
    PersistentShell,
    /// Persistent multiplexer session attached over SSH
    PersistentSsh,
    /// AI CLI running inside a persistent session
    AiCli,
}

impl AgentKind {
    pub const ALL: [AgentKind; 5] = [
        AgentKind::Shell,
        AgentKind::SshShell,
        AgentKind::PersistentShell,
        AgentKind::PersistentSsh,
        AgentKind::AiCli,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Shell => "shell",
            AgentKind::SshShell => "ssh-shell",
            AgentKind::PersistentShell => "persistent-shell",
            AgentKind::PersistentSsh => "persistent-ssh",
            AgentKind::AiCli => "ai-cli",
        }
    }

    /// Whether an unexpected exit should trigger a relaunch
    pub fn is_remote_shell(&self) -> bool {
        matches!(self, AgentKind::SshShell | AgentKind::PersistentSsh)
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        AgentKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::UnknownAgentType(s.to_string()))
    }
}

/// Agent lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Initializing,
    Running,
    Stopped,
    Error,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStatus::Stopped | AgentStatus::Error)
    }
}

/// Shared status with terminal states that cannot be left
#[derive(Debug, Clone)]
pub struct StatusCell(Arc<Mutex<AgentStatus>>);

impl StatusCell {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(AgentStatus::Initializing)))
    }

    pub fn get(&self) -> AgentStatus {
        *self.0.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Move to `next` unless already stopped or errored. Returns whether it moved.
    pub fn set(&self, next: AgentStatus) -> bool {
        let mut status = self.0.lock().unwrap_or_else(|p| p.into_inner());
        if status.is_terminal() {
            return false;
        }
        *status = next;
        true
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Events
// =============================================================================

/// Event emitted by a single agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// Chunk of terminal output
    Output(String),
    /// Error text from the agent (non-pty stderr, attach failures)
    Error(String),
    /// The underlying process ended; emitted at most once
    Exit(Option<i32>),
    /// Persistent session backing this agent
    SessionId(String),
}

/// Agent event tagged with its agent id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedAgentEvent {
    pub agent_id: String,
    pub event: AgentEvent,
}

pub type AgentEventSender = mpsc::UnboundedSender<AgentEvent>;

// =============================================================================
// Launch options and info
// =============================================================================

/// Options passed to an agent factory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentOptions {
    pub cwd: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    /// Command typed into the shell after start
    pub command: Option<String>,
    /// Reuse an existing persistent session instead of creating one
    pub persistent_session_id: Option<String>,
    pub env: HashMap<String, String>,
}

impl AgentOptions {
    pub fn size(&self) -> (u16, u16) {
        (self.cols.unwrap_or(80), self.rows.unwrap_or(24))
    }
}

/// Agent snapshot for diagnostics and the UI
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub agent_type: AgentKind,
    pub status: AgentStatus,
    pub start_time: DateTime<Utc>,
    pub attached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent_session_id: Option<String>,
}

// =============================================================================
// Agent contract
// =============================================================================

/// One pty-backed process managed by the [`AgentManager`](super::AgentManager)
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> AgentKind;

    fn status(&self) -> AgentStatus;

    fn start_time(&self) -> DateTime<Utc>;

    /// Backed by a persistent session that survives `stop()`
    fn is_persistent(&self) -> bool {
        false
    }

    fn persistent_session_id(&self) -> Option<String> {
        None
    }

    /// Whether a local pty attachment currently exists
    fn attached(&self) -> bool {
        self.status() == AgentStatus::Running
    }

    /// Spawn the process. Only reports `Running` once the process is confirmed alive.
    async fn initialize(&mut self, events: AgentEventSender) -> Result<()>;

    async fn send_input(&self, input: &str) -> Result<()>;

    async fn resize(&self, cols: u16, rows: u16) -> Result<()>;

    /// Drop the local attachment, leaving any persistent process running
    async fn detach(&self) -> Result<()>;

    /// Re-establish a local attachment after `detach()`
    async fn reattach(&self) -> Result<()>;

    /// Kill the process, including any persistent session
    async fn terminate(&self) -> Result<()>;

    /// Detach persistent agents, terminate everything else
    async fn stop(&self) -> Result<()> {
        if self.is_persistent() {
            self.detach().await
        } else {
            self.terminate().await
        }
    }

    /// Run one command and wait for its response
    async fn execute(&self, _command: &str) -> Result<String> {
        Err(Error::Unsupported(format!(
            "{} agents do not support command execution",
            self.kind()
        )))
    }

    fn info(&self) -> AgentInfo {
        AgentInfo {
            id: self.id().to_string(),
            agent_type: self.kind(),
            status: self.status(),
            start_time: self.start_time(),
            attached: self.attached(),
            persistent_session_id: self.persistent_session_id(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in AgentKind::ALL {
            assert_eq!(kind.as_str().parse::<AgentKind>().unwrap(), kind);
        }
        assert!(matches!(
            "vim".parse::<AgentKind>(),
            Err(Error::UnknownAgentType(_))
        ));
    }

    #[test]
    fn test_kind_serializes_kebab_case() {
        let json = serde_json::to_string(&AgentKind::PersistentSsh).unwrap();
        assert_eq!(json, "\"persistent-ssh\"");
    }

    #[test]
    fn test_status_cell_terminal_states_stick() {
        let status = StatusCell::new();
        assert!(status.set(AgentStatus::Running));
        assert!(status.set(AgentStatus::Stopped));
        assert!(!status.set(AgentStatus::Running));
        assert_eq!(status.get(), AgentStatus::Stopped);
    }

    #[test]
    fn test_agent_options_camel_case() {
        let opts: AgentOptions =
            serde_json::from_str(r#"{"cols":120,"persistentSessionId":"p1"}"#).unwrap();
        assert_eq!(opts.size(), (120, 24));
        assert_eq!(opts.persistent_session_id.as_deref(), Some("p1"));
    }
}
