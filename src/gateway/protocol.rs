//! WebSocket message protocol
//!
//! Every frame is a JSON envelope `{ "type": "...", "payload": { ... } }`.
//! Type names are SCREAMING_SNAKE_CASE, payload fields camelCase.

use crate::agent::{AgentInfo, AgentOptions};
use crate::error::{Error, Result};
use crate::session::PersistentSession;
use crate::state::{CurrentState, Snapshot};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

// =============================================================================
// Client -> server
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateSessionPayload {
    pub workspace_path: Option<String>,
    pub agent_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LaunchAgentPayload {
    /// Registered agent type; the configured default when absent
    pub agent_type: Option<String>,
    pub options: AgentOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SendInputPayload {
    #[serde(alias = "data")]
    pub input: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StopAgentPayload {
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CreateSnapshotPayload {
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ResizePayload {
    pub cols: u16,
    pub rows: u16,
}

/// Message received from the browser
#[derive(Debug, Clone)]
pub enum ClientMessage {
    CreateSession(CreateSessionPayload),
    LaunchAgent(LaunchAgentPayload),
    SendInput(SendInputPayload),
    StopAgent(StopAgentPayload),
    GetState,
    CreateSnapshot(CreateSnapshotPayload),
    Resize(ResizePayload),
}

impl ClientMessage {
    /// Parse one text frame
    pub fn parse(text: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let payload = envelope.payload.unwrap_or(serde_json::Value::Null);

        Ok(match envelope.kind.as_str() {
            "CREATE_SESSION" => Self::CreateSession(optional(payload)?),
            "LAUNCH_AGENT" => Self::LaunchAgent(optional(payload)?),
            "SEND_INPUT" => Self::SendInput(serde_json::from_value(payload)?),
            "STOP_AGENT" => Self::StopAgent(optional(payload)?),
            "GET_STATE" => Self::GetState,
            "CREATE_SNAPSHOT" => Self::CreateSnapshot(optional(payload)?),
            "RESIZE" => Self::Resize(serde_json::from_value(payload)?),
            other => return Err(Error::UnknownMessageType(other.to_string())),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateSession(_) => "CREATE_SESSION",
            Self::LaunchAgent(_) => "LAUNCH_AGENT",
            Self::SendInput(_) => "SEND_INPUT",
            Self::StopAgent(_) => "STOP_AGENT",
            Self::GetState => "GET_STATE",
            Self::CreateSnapshot(_) => "CREATE_SNAPSHOT",
            Self::Resize(_) => "RESIZE",
        }
    }
}

/// Absent payload means all defaults
fn optional<T>(payload: serde_json::Value) -> Result<T>
where
    T: Default + serde::de::DeserializeOwned,
{
    if payload.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(payload)?)
}

// =============================================================================
// Server -> client
// =============================================================================

/// Message sent to the browser
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Connected { session_id: String },

    #[serde(rename_all = "camelCase")]
    SessionCreated {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        work_session_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    AgentLaunched {
        agent_id: String,
        agent_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        persistent_session_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    Reconnected {
        session_id: String,
        agent_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        persistent_session_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    Output { agent_id: String, data: String },

    Error { code: String, message: String },

    #[serde(rename_all = "camelCase")]
    AgentExit { agent_id: String, code: Option<i32> },

    #[serde(rename_all = "camelCase")]
    TerminalSessionId {
        agent_id: String,
        persistent_session_id: String,
    },

    #[serde(rename_all = "camelCase")]
    StateUpdate {
        state: CurrentState,
        agents: Vec<AgentInfo>,
        persistent_sessions: Vec<PersistentSession>,
    },

    SnapshotCreated { snapshot: Snapshot },

    #[serde(rename_all = "camelCase")]
    AgentStopped { agent_id: String },
}

impl ServerMessage {
    pub fn error(err: &Error) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!("Failed to serialize server message: {}", e);
            r#"{"type":"ERROR","payload":{"code":"internal_error","message":"serialization failed"}}"#
                .to_string()
        })
    }
}
