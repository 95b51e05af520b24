//! Durable work-session log
//!
//! The bridge records every work session it starts, the commands typed into
//! it, and on-demand snapshots. [`FileStateManager`] keeps everything in one
//! JSON file, rewritten atomically (temp file + rename) after each change.

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Commands kept per session
const MAX_COMMANDS_PER_SESSION: usize = 1000;

/// Commands included in the current-state summary
const RECENT_COMMANDS: usize = 20;

/// One recorded command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub session_id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A work session and its command log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkSession {
    pub id: String,
    pub workspace_path: String,
    pub agent_type: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub commands: Vec<CommandRecord>,
}

/// Session without its command log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub workspace_path: String,
    pub agent_type: String,
    pub created_at: DateTime<Utc>,
    pub command_count: usize,
}

impl From<&WorkSession> for SessionSummary {
    fn from(s: &WorkSession) -> Self {
        Self {
            id: s.id.clone(),
            workspace_path: s.workspace_path.clone(),
            agent_type: s.agent_type.clone(),
            created_at: s.created_at,
            command_count: s.commands.len(),
        }
    }
}

/// Overview returned by [`StateManager::current_state`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentState {
    pub sessions: Vec<SessionSummary>,
    pub recent_commands: Vec<CommandRecord>,
    pub snapshot_count: usize,
}

/// Point-in-time copy of the current state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub state: CurrentState,
}

/// Durable log the bridge writes into
#[async_trait]
pub trait StateManager: Send + Sync {
    /// Record a new work session and return its id
    async fn create_session(&self, workspace_path: &str, agent_type: &str) -> Result<String>;

    async fn log_command(
        &self,
        session_id: &str,
        command: &str,
        output: Option<&str>,
        error: Option<&str>,
    ) -> Result<()>;

    async fn current_state(&self) -> Result<CurrentState>;

    async fn create_snapshot(&self, description: Option<String>) -> Result<Snapshot>;

    async fn session_history(&self, session_id: &str) -> Result<Vec<CommandRecord>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    sessions: BTreeMap<String, WorkSession>,
    #[serde(default)]
    snapshots: Vec<Snapshot>,
}

impl StateFile {
    fn current(&self) -> CurrentState {
        let mut recent: Vec<CommandRecord> = self
            .sessions
            .values()
            .flat_map(|s| s.commands.iter().cloned())
            .collect();
        recent.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        recent.truncate(RECENT_COMMANDS);

        let mut sessions: Vec<SessionSummary> =
            self.sessions.values().map(SessionSummary::from).collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        CurrentState {
            sessions,
            recent_commands: recent,
            snapshot_count: self.snapshots.len(),
        }
    }
}

/// JSON-file-backed [`StateManager`]
pub struct FileStateManager {
    path: PathBuf,
    state: RwLock<StateFile>,
}

impl FileStateManager {
    /// Open (or start) the state file at `path`. A corrupt file is moved aside.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let state = match tokio::fs::read_to_string(&path).await {
            Ok(data) => match serde_json::from_str::<StateFile>(&data) {
                Ok(state) => {
                    tracing::info!(
                        path = %path.display(),
                        sessions = state.sessions.len(),
                        "Loaded state file"
                    );
                    state
                }
                Err(e) => {
                    let backup = path.with_extension("json.corrupt");
                    tracing::warn!(
                        path = %path.display(),
                        "State file unreadable, moving to {}: {}",
                        backup.display(),
                        e
                    );
                    tokio::fs::rename(&path, &backup).await?;
                    StateFile::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StateFile::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, state: &StateFile) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl StateManager for FileStateManager {
    async fn create_session(&self, workspace_path: &str, agent_type: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut state = self.state.write().await;
        state.sessions.insert(
            id.clone(),
            WorkSession {
                id: id.clone(),
                workspace_path: workspace_path.to_string(),
                agent_type: agent_type.to_string(),
                created_at: Utc::now(),
                commands: Vec::new(),
            },
        );
        self.persist(&state).await?;
        tracing::debug!(session_id = %id, agent_type, "Recorded work session");
        Ok(id)
    }

    async fn log_command(
        &self,
        session_id: &str,
        command: &str,
        output: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::NotFound(format!("Work session {}", session_id)))?;
        session.commands.push(CommandRecord {
            session_id: session_id.to_string(),
            command: command.to_string(),
            output: output.map(str::to_string),
            error: error.map(str::to_string),
            timestamp: Utc::now(),
        });
        if session.commands.len() > MAX_COMMANDS_PER_SESSION {
            let excess = session.commands.len() - MAX_COMMANDS_PER_SESSION;
            session.commands.drain(..excess);
        }
        self.persist(&state).await
    }

    async fn current_state(&self) -> Result<CurrentState> {
        Ok(self.state.read().await.current())
    }

    async fn create_snapshot(&self, description: Option<String>) -> Result<Snapshot> {
        let mut state = self.state.write().await;
        let snapshot = Snapshot {
            id: uuid::Uuid::new_v4().to_string(),
            description,
            created_at: Utc::now(),
            state: state.current(),
        };
        state.snapshots.push(snapshot.clone());
        self.persist(&state).await?;
        tracing::info!(snapshot_id = %snapshot.id, "Created snapshot");
        Ok(snapshot)
    }

    async fn session_history(&self, session_id: &str) -> Result<Vec<CommandRecord>> {
        self.state
            .read()
            .await
            .sessions
            .get(session_id)
            .map(|s| s.commands.clone())
            .ok_or_else(|| Error::NotFound(format!("Work session {}", session_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open(dir: &TempDir) -> FileStateManager {
        FileStateManager::open(dir.path().join("state").join("state.json"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_session_and_history_round_trip_through_disk() {
        let dir = TempDir::new().unwrap();
        let id = {
            let state = open(&dir).await;
            let id = state.create_session("/workspace", "shell").await.unwrap();
            state.log_command(&id, "ls -la", None, None).await.unwrap();
            state
                .log_command(&id, "cat nope", None, Some("No such file"))
                .await
                .unwrap();
            id
        };

        let reopened = open(&dir).await;
        let history = reopened.session_history(&id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].command, "ls -la");
        assert_eq!(history[1].error.as_deref(), Some("No such file"));
        assert!(!dir.path().join("state").join("state.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_log_command_unknown_session() {
        let dir = TempDir::new().unwrap();
        let state = open(&dir).await;
        assert!(matches!(
            state.log_command("missing", "ls", None, None).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            state.session_history("missing").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_current_state_and_snapshot() {
        let dir = TempDir::new().unwrap();
        let state = open(&dir).await;
        let id = state.create_session("/workspace", "ai-cli").await.unwrap();
        state.log_command(&id, "help", Some("usage"), None).await.unwrap();

        let snapshot = state
            .create_snapshot(Some("before refactor".to_string()))
            .await
            .unwrap();
        assert_eq!(snapshot.state.sessions.len(), 1);
        assert_eq!(snapshot.state.sessions[0].command_count, 1);

        let current = state.current_state().await.unwrap();
        assert_eq!(current.snapshot_count, 1);
        assert_eq!(current.recent_commands[0].command, "help");
    }

    #[tokio::test]
    async fn test_corrupt_file_is_moved_aside() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "not json").unwrap();

        let state = FileStateManager::open(&path).await.unwrap();
        assert!(state.current_state().await.unwrap().sessions.is_empty());
        assert!(dir.path().join("state.json.corrupt").exists());
    }

    #[tokio::test]
    async fn test_command_log_is_capped() {
        let dir = TempDir::new().unwrap();
        let state = open(&dir).await;
        let id = state.create_session("/w", "shell").await.unwrap();
        for i in 0..(MAX_COMMANDS_PER_SESSION + 5) {
            state.log_command(&id, &format!("cmd {}", i), None, None).await.unwrap();
        }
        let history = state.session_history(&id).await.unwrap();
        assert_eq!(history.len(), MAX_COMMANDS_PER_SESSION);
        assert_eq!(history[0].command, "cmd 5");
    }
}
