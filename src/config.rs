//! Claude Sandbox configuration management

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main Claude Sandbox configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// HTTP / WebSocket server configuration
    pub server: ServerConfig,

    /// Logical session buffering configuration
    pub sessions: SessionsConfig,

    /// Sandbox container configuration
    pub container: ContainerConfig,

    /// SSH transport configuration
    pub ssh: SshConfig,

    /// Persistent multiplexer session configuration
    pub persistent: PersistentConfig,

    /// Agent configuration
    pub agents: AgentsConfig,

    /// Storage configuration
    pub storage: StorageConfig,
}

impl SandboxConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SandboxConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the runtime misbehave
    pub fn validate(&self) -> Result<()> {
        if self.sessions.max_buffer_chars == 0 {
            return Err(Error::Config(
                "sessions.max_buffer_chars must be greater than zero".to_string(),
            ));
        }
        if self.sessions.timeout_secs == 0 {
            return Err(Error::Config(
                "sessions.timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.persistent.health_check_interval_secs == 0 {
            return Err(Error::Config(
                "persistent.health_check_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.container.backend == ContainerBackend::Docker && self.container.name.is_empty() {
            return Err(Error::Config(
                "container.name is required for the docker backend".to_string(),
            ));
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// WebSocket ping interval in seconds
    pub ws_ping_interval_secs: u64,

    /// Shared token required on the WebSocket handshake (None = auth disabled)
    pub auth_token: Option<String>,

    /// Allowed origins for CORS (empty = any)
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3456,
            ws_ping_interval_secs: 30,
            auth_token: None,
            cors_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ws_ping_interval_secs.max(1))
    }
}

/// Logical session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Inactivity timeout before a disconnected session is evicted
    pub timeout_secs: u64,

    /// Maximum buffered characters per session while no client is attached
    pub max_buffer_chars: usize,

    /// Scrollback lines replayed on reconnect for persistent agents
    pub replay_scrollback_lines: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30 * 60,
            max_buffer_chars: 100_000,
            replay_scrollback_lines: 1000,
        }
    }
}

impl SessionsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// How commands reach the sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerBackend {
    /// `docker exec` into a running container
    Docker,
    /// Run directly on this host (development)
    Local,
}

/// Sandbox container configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Exec backend
    pub backend: ContainerBackend,

    /// Container name or id
    pub name: String,

    /// Docker CLI binary
    pub docker_binary: String,

    /// User to exec as inside the container
    pub user: Option<String>,

    /// Default working directory inside the container
    pub workdir: String,

    /// Per-call timeout for non-interactive exec in seconds
    pub exec_timeout_secs: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            backend: ContainerBackend::Docker,
            name: "claude-sandbox".to_string(),
            docker_binary: "docker".to_string(),
            user: None,
            workdir: "/workspace".to_string(),
            exec_timeout_secs: 15,
        }
    }
}

/// SSH transport configuration (ssh-shell and persistent-ssh agents)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Enable the ssh-backed agent kinds
    pub enabled: bool,

    /// Host to connect to
    pub host: String,

    /// SSH port
    pub port: u16,

    /// Remote user
    pub user: String,

    /// Private key file
    pub identity_file: Option<PathBuf>,

    /// Extra `-o` style arguments passed verbatim
    pub extra_args: Vec<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 2222,
            user: "claude".to_string(),
            identity_file: None,
            extra_args: vec![
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
                "-o".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
            ],
        }
    }
}

/// Persistent multiplexer session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentConfig {
    /// Health check poll interval in seconds
    pub health_check_interval_secs: u64,

    /// Polls for a freshly created session before giving up
    pub create_retries: u32,

    /// Delay between creation polls in milliseconds
    pub create_retry_delay_ms: u64,

    /// Scrollback kept by the multiplexer per session
    pub scrollback_lines: usize,

    /// Prefix for multiplexer session names
    pub name_prefix: String,

    /// Shell started as the root process of every session
    pub shell: String,

    /// Command used to install the multiplexer when missing
    pub install_command: String,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            create_retries: 10,
            create_retry_delay_ms: 100,
            scrollback_lines: 10_000,
            name_prefix: "cs".to_string(),
            shell: "/bin/bash".to_string(),
            install_command: "apt-get update && apt-get install -y screen".to_string(),
        }
    }
}

impl PersistentConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn create_retry_delay(&self) -> Duration {
        Duration::from_millis(self.create_retry_delay_ms)
    }
}

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    /// Local shell for `shell` agents
    pub shell: String,

    /// Agent type launched for plain terminal connections
    pub default_interactive: String,

    /// Grace period before a spawned process counts as alive
    pub liveness_grace_ms: u64,

    /// Command that starts the AI CLI inside a session
    pub ai_cli_command: String,

    /// Hard timeout for one AI CLI command round-trip
    pub exchange_timeout_secs: u64,

    /// Output quiet period that counts as a complete response
    pub stability_ms: u64,

    /// Prompt patterns that mark a complete response
    pub prompt_patterns: Vec<String>,

    /// Relaunch policy for ssh-backed agents
    pub restart: RestartConfig,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            shell: "/bin/bash".to_string(),
            default_interactive: "persistent-shell".to_string(),
            liveness_grace_ms: 300,
            ai_cli_command: "claude".to_string(),
            exchange_timeout_secs: 5,
            stability_ms: 1500,
            prompt_patterns: vec![r"(?m)^\s*>\s*$".to_string(), r"(?m)^│\s*>\s".to_string()],
            restart: RestartConfig::default(),
        }
    }
}

impl AgentsConfig {
    pub fn liveness_grace(&self) -> Duration {
        Duration::from_millis(self.liveness_grace_ms)
    }
}

/// Bounded restart with exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Relaunch attempts after an unexpected exit (0 = never)
    pub max_attempts: u32,

    /// Delay before the first attempt in milliseconds
    pub delay_ms: u64,

    /// Upper bound on the backoff delay in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 2000,
            max_delay_ms: 30_000,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON file backing the state manager
    pub state_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = dirs_next::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("claude-sandbox");

        Self {
            state_file: base.join("state.json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SandboxConfig::default();
        assert_eq!(config.server.port, 3456);
        assert_eq!(config.sessions.max_buffer_chars, 100_000);
        assert_eq!(config.sessions.timeout(), Duration::from_secs(1800));
        assert_eq!(config.persistent.health_check_interval_secs, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml = r#"
            [server]
            port = 9000
            auth_token = "secret"

            [container]
            backend = "local"
        "#;
        let config: SandboxConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.auth_token.as_deref(), Some("secret"));
        assert_eq!(config.container.backend, ContainerBackend::Local);
        assert_eq!(config.agents.restart.max_attempts, 1);
    }

    #[test]
    fn test_validate_rejects_zero_buffer() {
        let mut config = SandboxConfig::default();
        config.sessions.max_buffer_chars = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_requires_container_name() {
        let mut config = SandboxConfig::default();
        config.container.name.clear();
        assert!(config.validate().is_err());

        config.container.backend = ContainerBackend::Local;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sessions]\ntimeout_secs = 60\n").unwrap();

        let config = SandboxConfig::load(&path).unwrap();
        assert_eq!(config.sessions.timeout_secs, 60);
    }

    #[test]
    fn test_config_roundtrip_toml() {
        let config = SandboxConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: SandboxConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.agents.ai_cli_command, "claude");
    }
}
