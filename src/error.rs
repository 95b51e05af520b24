//! Claude Sandbox error types

use thiserror::Error;

/// Claude Sandbox error type
#[derive(Error, Debug)]
pub enum Error {
    /// Agent or persistent session failed to start
    #[error("Initialization error: {0}")]
    Initialization(String),

    /// Unknown agent id or session id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Input sent to an agent that is not running and has no persistent backing
    #[error("Agent not running: {0}")]
    NotRunning(String),

    /// WebSocket handshake rejected
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Bounded wait exceeded
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Malformed or unsupported client message
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    /// Agent type was never registered
    #[error("Unknown agent type: {0}")]
    UnknownAgentType(String),

    /// Operation not supported by this agent kind
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Container or remote exec failure
    #[error("Container error: {0}")]
    Container(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parse error
    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable snake-case code sent to clients in `ERROR` messages
    pub fn code(&self) -> &'static str {
        match self {
            Error::Initialization(_) => "initialization_error",
            Error::NotFound(_) => "not_found",
            Error::NotRunning(_) => "not_running",
            Error::Auth(_) => "auth_error",
            Error::Timeout(_) => "timeout",
            Error::UnknownMessageType(_) => "unknown_message_type",
            Error::UnknownAgentType(_) => "unknown_agent_type",
            Error::Unsupported(_) => "unsupported",
            Error::Config(_) | Error::Toml(_) => "config_error",
            Error::Container(_) => "container_error",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::Internal(_) => "internal_error",
        }
    }
}

/// Result type alias for Claude Sandbox operations
pub type Result<T> = std::result::Result<T, Error>;
